//! Message Router
//!
//! Publish/fan-out engine: matches a PUBLISH against the subscription index
//! and hands every matching connection its own copy of the encoded frame.
//! Delivery is always QoS 0 and never blocks on a recipient.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{trace, warn};

use crate::codec::Encoder;
use crate::metrics::Metrics;
use crate::protocol::{Packet, Publish, QoS};
use crate::topic::SubscriptionIndex;

/// Message router for distributing messages to subscribers
pub struct MessageRouter {
    subscriptions: Arc<SubscriptionIndex>,
    metrics: Arc<Metrics>,
    encoder: Encoder,
}

impl MessageRouter {
    pub fn new(subscriptions: Arc<SubscriptionIndex>, metrics: Arc<Metrics>) -> Self {
        Self {
            subscriptions,
            metrics,
            encoder: Encoder::new(),
        }
    }

    /// Route `publish` to every matching subscriber.
    ///
    /// Returns the number of connections the message was delivered to.
    pub fn publish(&self, publish: &Publish) -> usize {
        let payload_len = publish.payload.len();
        self.metrics.publish_received(payload_len);

        let matches = self.subscriptions.matches(&publish.topic);
        for filter in &matches.filters {
            self.metrics.record_topic_publish(filter);
        }

        if matches.recipients.is_empty() {
            trace!("No subscribers for {}", publish.topic);
            return 0;
        }

        let outbound = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: publish.topic.clone(),
            packet_id: None,
            payload: publish.payload.clone(),
        });

        let mut frame = BytesMut::with_capacity(5 + 2 + publish.topic.len() + payload_len);
        if let Err(e) = self.encoder.encode(&outbound, &mut frame) {
            warn!("Failed to encode PUBLISH to {}: {}", publish.topic, e);
            return 0;
        }

        let mut delivered = 0;
        for recipient in &matches.recipients {
            match recipient.send_frame(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(
                    "Skipping recipient {} for {}: {}",
                    recipient.addr(),
                    publish.topic,
                    e
                ),
            }
        }

        self.metrics.publish_delivered(delivered, payload_len);
        trace!(
            "Routed {} ({} bytes) to {} of {} subscribers",
            publish.topic,
            payload_len,
            delivered,
            matches.recipients.len()
        );
        delivered
    }
}

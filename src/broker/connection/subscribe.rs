//! SUBSCRIBE and UNSUBSCRIBE packet handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, QoS, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic::validate_topic_filter_with_max_length;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE packet
    ///
    /// An invalid filter only fails its own slot in the SUBACK. Every
    /// accepted filter is granted QoS 0.
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let max_length = self.shared.config.max_topic_length;
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());

        for sub in &subscribe.subscriptions {
            if let Err(e) = validate_topic_filter_with_max_length(&sub.filter, max_length) {
                warn!(
                    "Rejecting filter {:?} from {}: {}",
                    sub.filter,
                    self.client_label(),
                    e
                );
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            if self.shared.subscriptions.subscribe(&sub.filter, &self.handle) {
                debug!(
                    "{} subscribed to {} (requested QoS {}, granted 0)",
                    self.client_label(),
                    sub.filter,
                    sub.qos as u8
                );
            }
            return_codes.push(SubAckReturnCode::Granted(QoS::AtMostOnce));
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            if self.shared.subscriptions.unsubscribe(filter, &self.handle) {
                debug!("{} unsubscribed from {}", self.client_label(), filter);
            }
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }
}

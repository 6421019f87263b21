//! PUBLISH packet handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, Publish, QoS};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle PUBLISH packet
    ///
    /// QoS 1 is acknowledged before fan-out, QoS 2 is not acknowledged at
    /// all; subscribers always receive QoS 0.
    pub(crate) async fn handle_publish(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        if publish.topic.is_empty() {
            warn!(
                "Ignoring PUBLISH with empty topic from {}",
                self.client_label()
            );
            return Ok(());
        }

        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                if let Some(packet_id) = publish.packet_id {
                    self.write_packet(&Packet::PubAck(PubAck::new(packet_id)))
                        .await?;
                }
            }
            QoS::ExactlyOnce => {
                // No PUBREC/PUBREL/PUBCOMP flow; delivered like any other publish
                debug!(
                    "QoS 2 PUBLISH to {} from {} routed without acknowledgement",
                    publish.topic,
                    self.client_label()
                );
            }
        }

        let delivered = self.shared.router.publish(&publish);
        trace!(
            "PUBLISH {} from {} delivered to {}",
            publish.topic,
            self.client_label(),
            delivered
        );
        Ok(())
    }
}

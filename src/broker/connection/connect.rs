//! CONNECT packet handling

use std::sync::Arc;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use super::{Connection, ConnectionError};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError};
use crate::session::WillMessage;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);

                return match packet {
                    Packet::Connect(connect) => self.handle_connect(*connect).await,
                    other => {
                        // Protocol violation - first packet must be CONNECT
                        debug!(
                            "First packet from {} was {:?}, not CONNECT",
                            self.handle.addr(),
                            other.packet_type()
                        );
                        Err(ProtocolError::ConnectExpected(other.packet_type()).into())
                    }
                };
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    /// Handle CONNECT packet
    ///
    /// Checks run in a fixed order and the first failure refuses the
    /// connection before any shared state is touched.
    async fn handle_connect(&mut self, mut connect: Connect) -> Result<(), ConnectionError> {
        self.shared.metrics.connect_attempt();

        let Some(protocol_version) = connect.protocol_version() else {
            debug!(
                "Unsupported protocol {:?} level {} from {}",
                connect.protocol_name,
                connect.protocol_level,
                self.handle.addr()
            );
            return self
                .refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                .await;
        };

        if connect.password.is_some() && connect.username.is_none() {
            return self.refuse(ConnectReturnCode::BadUsernameOrPassword).await;
        }

        // No session persistence
        if !connect.clean_session {
            return self.refuse(ConnectReturnCode::IdentifierRejected).await;
        }

        if connect.client_id.trim_matches(|c: char| c <= ' ').is_empty() {
            return self.refuse(ConnectReturnCode::IdentifierRejected).await;
        }

        let client_id: Arc<str> = Arc::from(connect.client_id.as_str());
        debug!(
            "CONNECT from {} (client_id: {}, protocol: {:?})",
            self.handle.addr(),
            client_id,
            protocol_version
        );

        self.handle.set_client_id(client_id.clone());
        self.handle.reset_session();

        // Armed before registration so a takeover racing this CONNECT sees
        // the Will and suppresses it.
        if let Some(will) = connect.will.take() {
            match WillMessage::capture(will, &self.shared.packet_ids) {
                Ok(will) => {
                    debug!("Will armed for {} on {}", client_id, will.topic);
                    self.handle.arm_will(will);
                }
                Err(e) => {
                    warn!("Ignoring will from {}: {}", client_id, e);
                }
            }
        }

        if let Some(previous) = self
            .shared
            .sessions
            .register(client_id.clone(), self.handle.clone())
        {
            info!(
                "Client {} reconnected from {}, closing previous connection from {}",
                client_id,
                self.handle.addr(),
                previous.addr()
            );
        }

        self.shared.metrics.connect_accepted();
        self.write_packet(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
            .await?;

        info!("Client {} connected from {}", client_id, self.handle.addr());
        Ok(())
    }

    /// Send a refusing CONNACK and fail the connection
    async fn refuse(&mut self, code: ConnectReturnCode) -> Result<(), ConnectionError> {
        self.shared.metrics.connect_refused();
        warn!("Refusing CONNECT from {}: {}", self.handle.addr(), code);

        self.write_packet(&Packet::ConnAck(ConnAck::new(code))).await?;
        Err(ConnectionError::Refused(code))
    }
}

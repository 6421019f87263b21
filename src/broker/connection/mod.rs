//! MQTT Connection Handler
//!
//! One `Connection` per accepted socket: decodes frames in arrival order,
//! dispatches them, writes responses, and flushes fan-out frames buffered on
//! its `ClientHandle`. All shared state the connection touched is released
//! when it is dropped, however the task ends.

mod connect;
mod disconnect;
mod publish;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::{ClientHandle, Shared};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnectReturnCode, DecodeError, EncodeError, Packet, PacketType, ProtocolError,
};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    Protocol(ProtocolError),
    /// CONNECT refused with the given return code
    Refused(ConnectReturnCode),
    /// Client sent a packet type this broker does not handle
    Unsupported(PacketType),
    /// No CONNECT within the connect timeout
    Timeout,
    /// Another connection registered the same client id
    SessionTakenOver,
    /// Client sent DISCONNECT
    Disconnected,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Refused(code) => write!(f, "Connection refused: {}", code),
            ConnectionError::Unsupported(t) => write!(f, "Unsupported packet type: {:?}", t),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::SessionTakenOver => write!(f, "Session taken over"),
            ConnectionError::Disconnected => write!(f, "Client disconnected"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::Decode(e) => Some(e),
            ConnectionError::Encode(e) => Some(e),
            ConnectionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) handle: Arc<ClientHandle>,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) shared: Arc<Shared>,
    torn_down: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, addr: SocketAddr, shared: Arc<Shared>) -> Self {
        shared.metrics.client_connected();

        Self {
            stream,
            handle: Arc::new(ClientHandle::new(addr)),
            decoder: Decoder::new().with_max_packet_size(shared.config.max_payload_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            shared,
            torn_down: false,
        }
    }

    pub fn handle(&self) -> &Arc<ClientHandle> {
        &self.handle
    }

    /// Run the connection handler
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        // Wait for CONNECT packet with timeout
        let connect_timeout = self.shared.config.connect_timeout;
        match timeout(connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Connect timeout from {}", self.handle.addr());
                return Err(ConnectionError::Timeout);
            }
        }

        self.run_connected().await
    }

    /// Run the main connection loop
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let handle = self.handle.clone();

        // Frames pipelined behind CONNECT are already buffered
        self.process_packets().await?;

        loop {
            tokio::select! {
                // Read from socket
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", handle.addr());
                        return Ok(());
                    }
                    self.process_packets().await?;
                }

                // Flush fan-out frames buffered by the router
                _ = handle.notified() => {
                    self.flush_outbound().await?;
                    if !handle.is_alive() {
                        debug!("Session for {} taken over, closing {}", self.client_label(), handle.addr());
                        return Err(ConnectionError::SessionTakenOver);
                    }
                }
            }
        }
    }

    /// Decode and dispatch every complete frame in the read buffer
    async fn process_packets(&mut self) -> Result<(), ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            self.handle_packet(packet).await?;
        }
        Ok(())
    }

    /// Handle an incoming packet
    async fn handle_packet(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::DuplicateConnect.into()),
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect => self.handle_disconnect(),
            packet @ (Packet::ConnAck(_)
            | Packet::PubAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp
            | Packet::Unsupported(_)) => self.reject_unsupported(packet.packet_type()),
        }
    }

    /// Count, log and close on a packet type this broker does not serve
    fn reject_unsupported(&self, packet_type: PacketType) -> Result<(), ConnectionError> {
        self.shared.metrics.unsupported_message();
        warn!(
            "Unsupported packet {:?} from {} ({}), closing connection",
            packet_type,
            self.client_label(),
            self.handle.addr()
        );
        Err(ConnectionError::Unsupported(packet_type))
    }

    /// Encode and write a single packet
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn flush_outbound(&mut self) -> Result<(), ConnectionError> {
        let data = self.handle.take_buffer();
        if !data.is_empty() {
            self.stream.write_all(&data).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }
}

impl<S> Connection<S> {
    /// Client id for log lines, or a placeholder before CONNECT
    pub(crate) fn client_label(&self) -> &str {
        self.handle.client_id().map_or("<unidentified>", |id| &**id)
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

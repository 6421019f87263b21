//! Transport Layer
//!
//! Socket options applied to accepted TCP connections.

use socket2::SockRef;
use tokio::net::TcpStream;

/// DSCP AF31 (0x1A << 2), suited to interactive telemetry
pub const DEFAULT_TRAFFIC_CLASS: u32 = 0x68;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
    /// IP type-of-service byte, `None` leaves the OS default
    pub traffic_class: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            traffic_class: Some(DEFAULT_TRAFFIC_CLASS),
        }
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(tos) = config.traffic_class {
        // IP_TOS only applies to IPv4 sockets
        if stream.local_addr()?.is_ipv4() {
            SockRef::from(stream).set_tos(tos)?;
        }
    }

    Ok(())
}

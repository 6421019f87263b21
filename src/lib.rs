//! mqgate - embeddable MQTT v3.1/v3.1.1 broker
//!
//! Clean sessions only: subscriptions live as long as the connection that
//! made them, a reconnecting client id replaces the previous connection,
//! and a Last Will is published when a client disappears without sending
//! DISCONNECT. Every message is delivered at QoS 0.
//!
//! Live counters are kept in [`Metrics`] and can be rendered as a text
//! report or served over HTTP in Prometheus format.

pub mod broker;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use metrics::{Metrics, MetricsServer, MetricsSnapshot};
pub use protocol::{ProtocolVersion, QoS};

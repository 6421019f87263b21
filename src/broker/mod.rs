//! MQTT Broker Core
//!
//! Owns the listening socket and the shared state every connection works
//! against (session registry, subscription index, router, metrics), and runs
//! the shutdown sequence that drains connections and sweeps leftover Wills.

mod connection;
mod handle;
mod router;

pub use connection::{Connection, ConnectionError};
pub use handle::{ClientHandle, SendError};
pub use router::MessageRouter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::metrics::Metrics;
use crate::protocol::{Publish, QoS};
use crate::session::{PacketIdGenerator, SessionRegistry};
use crate::topic::{validate_topic_name, SubscriptionIndex, MAX_TOPIC_LENGTH};
use crate::transport::{configure_stream, TransportConfig};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum remaining length of an inbound packet
    pub max_payload_size: usize,
    /// Maximum byte length of a subscription filter
    pub max_topic_length: usize,
    /// How long a new connection may take to send CONNECT
    pub connect_timeout: Duration,
    /// How long shutdown waits for connections before aborting them
    pub shutdown_timeout: Duration,
    /// Socket options for accepted connections
    pub transport: TransportConfig,
    /// Log the metrics report at this interval
    pub report_interval: Option<Duration>,
    /// Filters listed in the report
    pub report_top_topics: usize,
    /// Number of runtime worker threads
    pub num_workers: usize,
}

impl BrokerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_topic_length: MAX_TOPIC_LENGTH,
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            transport: TransportConfig::default(),
            report_interval: None,
            report_top_topics: 10,
            num_workers: num_cpus::get(),
        }
    }
}

// Helper to get number of CPUs
pub(crate) mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// State shared by the broker and all of its connections
pub(crate) struct Shared {
    pub(crate) config: BrokerConfig,
    pub(crate) sessions: SessionRegistry,
    pub(crate) subscriptions: Arc<SubscriptionIndex>,
    pub(crate) router: MessageRouter,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) packet_ids: PacketIdGenerator,
}

impl Shared {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        let subscriptions = Arc::new(SubscriptionIndex::new(metrics.clone()));
        let router = MessageRouter::new(subscriptions.clone(), metrics.clone());

        Self {
            config,
            sessions: SessionRegistry::new(),
            subscriptions,
            router,
            metrics,
            packet_ids: PacketIdGenerator::new(),
        }
    }
}

/// Resolves once `rx` reads `true` (or the sender is gone)
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// The MQTT Broker
pub struct Broker {
    shared: Arc<Shared>,
    /// Shutdown signal; a watch so a stop requested before `run` is not lost
    shutdown: watch::Sender<bool>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared::new(config)),
            shutdown,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Bind, serve connections until `shutdown` is called, then drain.
    ///
    /// A bind failure is returned to the caller; faults on individual
    /// connections are logged and never end the accept loop.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", listener.local_addr()?);

        if let Some(interval) = self.shared.config.report_interval {
            self.spawn_reporter(interval);
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(&mut connections, stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
            }
        }

        drop(listener);
        self.drain(connections).await;
        Ok(())
    }

    /// Handle a new connection
    fn handle_connection(&self, tasks: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = configure_stream(&stream, &self.shared.config.transport) {
            debug!("Failed to configure socket for {}: {}", addr, e);
        }

        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tasks.spawn(async move {
            let mut conn = Connection::new(stream, addr, shared);

            let result = {
                let conn_fut = conn.run();
                tokio::pin!(conn_fut);

                tokio::select! {
                    biased;

                    result = &mut conn_fut => Some(result),
                    _ = wait_for_shutdown(&mut shutdown_rx) => None,
                }
            };

            match result {
                Some(Ok(())) | Some(Err(ConnectionError::Disconnected)) => {
                    debug!("Connection {} closed", addr);
                }
                Some(Err(e)) => {
                    debug!("Connection error from {}: {}", addr, e);
                }
                None => {
                    // The server going away is not a client failure
                    debug!("Connection {} shutting down", addr);
                    conn.handle().mark_graceful();
                }
            }
            // Dropping the connection tears its state down
        });
    }

    /// Wait for connection tasks, then release any Will still armed
    async fn drain(&self, mut connections: JoinSet<()>) {
        let timeout = self.shared.config.shutdown_timeout;
        if !connections.is_empty() {
            info!("Waiting for {} connections to close", connections.len());
        }

        let drained = tokio::time::timeout(timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        let mut released = 0;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                connections.len(),
                timeout
            );
            released += self.shared.sessions.release_all_wills();
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        released += self.shared.sessions.release_all_wills();
        self.shared.metrics.wills_discarded(released);
        info!(
            "Broker stopped ({} sessions left, {} wills released)",
            self.shared.sessions.len(),
            released
        );
    }

    fn spawn_reporter(&self, interval: Duration) {
        let metrics = self.shared.metrics.clone();
        let top_topics = self.shared.config.report_top_topics;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!("\n{}", metrics.report(top_topics));
                    }
                    _ = wait_for_shutdown(&mut shutdown_rx) => break,
                }
            }
        });
    }

    /// Shutdown the broker. Safe to call more than once, or before `run`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Receiver that flips to `true` on shutdown, for companion tasks
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    /// Formatted metrics report
    pub fn metrics_report(&self) -> String {
        self.shared
            .metrics
            .report(self.shared.config.report_top_topics)
    }

    /// Number of client ids with an active connection
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Number of distinct subscribed filters
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.len()
    }

    /// Publish a message from the server at QoS 0.
    ///
    /// Returns the number of connections it was delivered to.
    pub fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, &'static str> {
        validate_topic_name(topic)?;

        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(topic),
            packet_id: None,
            payload,
        };
        Ok(self.shared.router.publish(&publish))
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

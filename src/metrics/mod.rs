//! Broker metrics
//!
//! Counters live in a Prometheus [`Registry`] so they can be scraped from the
//! `/metrics` endpoint; per-filter [`TopicStats`] live beside them in a
//! concurrent map. Every update is an independent increment, so writers on
//! different connections never coordinate. A [`MetricsSnapshot`] is a
//! point-in-time read used by the formatted report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{IntCounter, IntGauge, Opts, Registry};

mod report;
mod server;

pub use server::MetricsServer;

/// Publish statistics for one subscribed filter
#[derive(Debug)]
pub struct TopicStats {
    topic: Arc<str>,
    publish_count: AtomicU64,
    last_publish: Mutex<Option<Instant>>,
}

impl TopicStats {
    pub fn new(topic: Arc<str>) -> Self {
        Self {
            topic,
            publish_count: AtomicU64::new(0),
            last_publish: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn record_publish(&self) {
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        *self.last_publish.lock() = Some(Instant::now());
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    pub fn last_publish(&self) -> Option<Instant> {
        *self.last_publish.lock()
    }

    fn snapshot(&self) -> TopicStatsSnapshot {
        TopicStatsSnapshot {
            topic: self.topic.to_string(),
            publish_count: self.publish_count(),
            since_last_publish: self.last_publish().map(|at| at.elapsed()),
        }
    }
}

/// Point-in-time copy of a [`TopicStats`] entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStatsSnapshot {
    pub topic: String,
    pub publish_count: u64,
    /// Time since the last publish, `None` if never published to
    pub since_last_publish: Option<Duration>,
}

/// Point-in-time read of every counter
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub connections_current: i64,
    pub connections_total: u64,
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub connect_failures: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub unsupported_messages: u64,
    pub subscriptions_current: i64,
    pub active_topics: usize,
    pub wills_published: u64,
    pub wills_discarded: u64,
}

impl MetricsSnapshot {
    pub fn messages_received_per_sec(&self) -> f64 {
        rate(self.messages_received, self.uptime)
    }

    pub fn messages_sent_per_sec(&self) -> f64 {
        rate(self.messages_sent, self.uptime)
    }
}

fn rate(count: u64, uptime: Duration) -> f64 {
    let secs = uptime.as_secs();
    if secs == 0 {
        0.0
    } else {
        count as f64 / secs as f64
    }
}

/// All broker metrics in one place
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_current: IntGauge,
    pub connections_total: IntCounter,
    pub connect_attempts: IntCounter,
    pub connect_successes: IntCounter,
    pub connect_failures: IntCounter,

    // Message metrics
    pub messages_received: IntCounter,
    pub messages_sent: IntCounter,
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,
    pub unsupported_messages: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounter,

    // Last Will metrics
    pub wills_published: IntCounter,
    pub wills_discarded: IntCounter,

    topics: DashMap<Arc<str>, Arc<TopicStats>>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        Self {
            connections_current: register(
                &registry,
                IntGauge::with_opts(Opts::new(
                    "mqgate_connections_current",
                    "Current number of open client connections",
                )),
            ),
            connections_total: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_connections_total",
                    "Total number of accepted TCP connections since startup",
                )),
            ),
            connect_attempts: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_connect_attempts_total",
                    "Total CONNECT packets processed",
                )),
            ),
            connect_successes: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_connect_successes_total",
                    "Total CONNECT packets accepted",
                )),
            ),
            connect_failures: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_connect_failures_total",
                    "Total CONNECT packets refused",
                )),
            ),
            messages_received: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_messages_received_total",
                    "Total PUBLISH messages routed, including Will replays",
                )),
            ),
            messages_sent: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_messages_sent_total",
                    "Total PUBLISH copies delivered to subscribers",
                )),
            ),
            bytes_received: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_bytes_received_total",
                    "Total payload bytes received",
                )),
            ),
            bytes_sent: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_bytes_sent_total",
                    "Total payload bytes delivered",
                )),
            ),
            unsupported_messages: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_unsupported_messages_total",
                    "Total packets of unsupported types (connection closed)",
                )),
            ),
            subscriptions_current: register(
                &registry,
                IntGauge::with_opts(Opts::new(
                    "mqgate_subscriptions_current",
                    "Current number of (filter, connection) subscriptions",
                )),
            ),
            subscriptions_total: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_subscriptions_total",
                    "Total subscriptions created since startup",
                )),
            ),
            wills_published: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_wills_published_total",
                    "Will messages published after an ungraceful close",
                )),
            ),
            wills_discarded: register(
                &registry,
                IntCounter::with_opts(Opts::new(
                    "mqgate_wills_discarded_total",
                    "Will messages released without publishing",
                )),
            ),
            registry,
            topics: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record a new TCP connection
    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    /// Record a closed TCP connection
    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn connect_attempt(&self) {
        self.connect_attempts.inc();
    }

    pub fn connect_accepted(&self) {
        self.connect_successes.inc();
    }

    pub fn connect_refused(&self) {
        self.connect_failures.inc();
    }

    /// Record an inbound PUBLISH
    pub fn publish_received(&self, payload_len: usize) {
        self.messages_received.inc();
        self.bytes_received.inc_by(payload_len as u64);
    }

    /// Record delivery of one message to `recipients` subscribers
    pub fn publish_delivered(&self, recipients: usize, payload_len: usize) {
        self.messages_sent.inc_by(recipients as u64);
        self.bytes_sent
            .inc_by((payload_len as u64).saturating_mul(recipients as u64));
    }

    pub fn unsupported_message(&self) {
        self.unsupported_messages.inc();
    }

    pub fn subscription_added(&self) {
        self.subscriptions_current.inc();
        self.subscriptions_total.inc();
    }

    pub fn subscription_removed(&self) {
        self.subscriptions_current.dec();
    }

    pub fn will_published(&self) {
        self.wills_published.inc();
    }

    pub fn wills_discarded(&self, count: usize) {
        self.wills_discarded.inc_by(count as u64);
    }

    /// Start tracking publish statistics for a filter (no-op if tracked)
    pub fn add_topic(&self, filter: &Arc<str>) {
        self.topics
            .entry(filter.clone())
            .or_insert_with(|| Arc::new(TopicStats::new(filter.clone())));
    }

    /// Stop tracking a filter
    pub fn remove_topic(&self, filter: &str) {
        self.topics.remove(filter);
    }

    /// Count a publish against a tracked filter
    pub fn record_topic_publish(&self, filter: &str) {
        if let Some(stats) = self.topics.get(filter) {
            stats.record_publish();
        }
    }

    pub fn topic_stats(&self, filter: &str) -> Option<TopicStatsSnapshot> {
        self.topics.get(filter).map(|stats| stats.snapshot())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// The `limit` most published-to filters, busiest first
    pub fn top_topics(&self, limit: usize) -> Vec<TopicStatsSnapshot> {
        let mut topics: Vec<TopicStatsSnapshot> =
            self.topics.iter().map(|entry| entry.snapshot()).collect();
        topics.sort_by(|a, b| {
            b.publish_count
                .cmp(&a.publish_count)
                .then_with(|| a.topic.cmp(&b.topic))
        });
        topics.truncate(limit);
        topics
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime: self.uptime(),
            connections_current: self.connections_current.get(),
            connections_total: self.connections_total.get(),
            connect_attempts: self.connect_attempts.get(),
            connect_successes: self.connect_successes.get(),
            connect_failures: self.connect_failures.get(),
            messages_received: self.messages_received.get(),
            messages_sent: self.messages_sent.get(),
            bytes_received: self.bytes_received.get(),
            bytes_sent: self.bytes_sent.get(),
            unsupported_messages: self.unsupported_messages.get(),
            subscriptions_current: self.subscriptions_current.get(),
            active_topics: self.topic_count(),
            wills_published: self.wills_published.get(),
            wills_discarded: self.wills_discarded.get(),
        }
    }

    /// Human-readable report with the `top_n` busiest filters
    pub fn report(&self, top_n: usize) -> String {
        report::render(&self.snapshot(), &self.top_topics(top_n), top_n)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Register a freshly built collector, panicking only on programmer error
/// (a malformed or duplicate metric name).
fn register<C>(registry: &Registry, collector: prometheus::Result<C>) -> C
where
    C: Collector + Clone + 'static,
{
    let collector = collector.expect("metric definition is valid");
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_current, 1);
        assert_eq!(snapshot.connections_total, 2);
    }

    #[test]
    fn test_publish_counters() {
        let metrics = Metrics::new();
        metrics.publish_received(4);
        metrics.publish_delivered(3, 4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_received, 4);
        assert_eq!(snapshot.messages_sent, 3);
        assert_eq!(snapshot.bytes_sent, 12);
    }

    #[test]
    fn test_topic_stats_lifecycle() {
        let metrics = Metrics::new();
        let filter: Arc<str> = Arc::from("room/#");

        metrics.record_topic_publish("room/#");
        assert_eq!(metrics.topic_stats("room/#"), None);

        metrics.add_topic(&filter);
        let fresh = metrics.topic_stats("room/#").unwrap();
        assert_eq!(fresh.publish_count, 0);
        assert_eq!(fresh.since_last_publish, None);

        metrics.record_topic_publish("room/#");
        metrics.add_topic(&filter);
        let stats = metrics.topic_stats("room/#").unwrap();
        assert_eq!(stats.publish_count, 1);
        assert!(stats.since_last_publish.is_some());

        metrics.remove_topic("room/#");
        assert_eq!(metrics.topic_count(), 0);
    }

    #[test]
    fn test_top_topics_ordering() {
        let metrics = Metrics::new();
        for (filter, publishes) in [("a", 1), ("b", 3), ("c", 2)] {
            metrics.add_topic(&Arc::from(filter));
            for _ in 0..publishes {
                metrics.record_topic_publish(filter);
            }
        }

        let top: Vec<_> = metrics
            .top_topics(2)
            .into_iter()
            .map(|t| (t.topic, t.publish_count))
            .collect();
        assert_eq!(top, vec![("b".to_string(), 3), ("c".to_string(), 2)]);
    }

    #[test]
    fn test_rates_with_zero_uptime() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.messages_received_per_sec(), 0.0);
        assert_eq!(rate(100, Duration::from_secs(10)), 10.0);
    }

    #[test]
    fn test_registry_exposes_counters() {
        let metrics = Metrics::new();
        metrics.connect_attempt();
        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"mqgate_connect_attempts_total".to_string()));
        assert!(names.contains(&"mqgate_wills_published_total".to_string()));
    }
}

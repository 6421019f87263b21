//! Topic matching and subscription management
//!
//! The `SubscriptionIndex` maps each topic filter to the connections
//! subscribed to it. A filter is present iff at least one connection holds
//! it, and its `TopicStats` entry lives exactly as long as the filter does.
//!
//! Matching walks every filter in the index; subscription counts in this
//! broker are small and filters are compared without allocation.

pub mod validation;

pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_filter_with_max_length,
    validate_topic_name, MAX_TOPIC_LENGTH,
};

use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use smallvec::SmallVec;

use crate::broker::ClientHandle;
use crate::metrics::Metrics;

type Subscribers = AHashMap<u64, Arc<ClientHandle>>;

/// Result of matching a topic against the index
#[derive(Debug, Default)]
pub struct Matches {
    /// Filters that matched the topic
    pub filters: SmallVec<[Arc<str>; 4]>,
    /// Deduplicated set of subscribed connections
    pub recipients: Vec<Arc<ClientHandle>>,
}

/// Concurrent filter -> subscribers index
pub struct SubscriptionIndex {
    filters: DashMap<Arc<str>, Subscribers>,
    metrics: Arc<Metrics>,
}

impl SubscriptionIndex {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            filters: DashMap::new(),
            metrics,
        }
    }

    /// Add `handle` as a subscriber of an already validated `filter`.
    ///
    /// Returns false if the connection already held the filter, in which
    /// case no counter changes.
    pub fn subscribe(&self, filter: &str, handle: &Arc<ClientHandle>) -> bool {
        let filter: Arc<str> = Arc::from(filter);

        let added = {
            let mut subscribers = self.filters.entry(filter.clone()).or_insert_with(|| {
                self.metrics.add_topic(&filter);
                Subscribers::new()
            });
            subscribers.insert(handle.id(), handle.clone()).is_none()
        };

        if added {
            handle.track_subscription(filter);
            self.metrics.subscription_added();
        }
        added
    }

    /// Remove `handle` from `filter`, dropping the filter and its stats once
    /// nobody holds it. Returns true if the connection was subscribed.
    pub fn unsubscribe(&self, filter: &str, handle: &ClientHandle) -> bool {
        handle.untrack_subscription(filter);
        self.remove_subscriber(filter, handle.id())
    }

    /// Drop every subscription held by `handle`; returns how many were removed
    pub fn unsubscribe_all(&self, handle: &ClientHandle) -> usize {
        let mut removed = 0;
        for filter in handle.take_subscriptions() {
            if self.remove_subscriber(&filter, handle.id()) {
                removed += 1;
            }
        }
        removed
    }

    fn remove_subscriber(&self, filter: &str, connection_id: u64) -> bool {
        let mut removed = false;
        // Emptiness check and stats removal happen under the entry lock so a
        // concurrent subscribe cannot recreate the filter in between.
        self.filters.remove_if_mut(filter, |_, subscribers| {
            removed = subscribers.remove(&connection_id).is_some();
            let empty = subscribers.is_empty();
            if empty {
                self.metrics.remove_topic(filter);
            }
            empty
        });

        if removed {
            self.metrics.subscription_removed();
        }
        removed
    }

    /// Every filter matching `topic`, and the union of their subscribers
    pub fn matches(&self, topic: &str) -> Matches {
        let mut matches = Matches::default();
        let mut seen: AHashMap<u64, Arc<ClientHandle>> = AHashMap::new();

        for entry in self.filters.iter() {
            if topic_matches_filter(topic, entry.key()) {
                matches.filters.push(entry.key().clone());
                for (id, handle) in entry.value() {
                    seen.entry(*id).or_insert_with(|| handle.clone());
                }
            }
        }

        matches.recipients = seen.into_values().collect();
        matches
    }

    /// Number of distinct filters
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.filters.contains_key(filter)
    }

    pub fn subscriber_count(&self, filter: &str) -> usize {
        self.filters.get(filter).map_or(0, |subs| subs.len())
    }
}

impl std::fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionIndex")
            .field("filters", &self.filters.len())
            .finish()
    }
}

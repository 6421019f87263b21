//! Session Registry
//!
//! Maps each client identifier to the single connection currently holding it.
//! Only clean sessions exist, so an entry lives exactly as long as its
//! connection: it is installed on a successful CONNECT and removed at
//! teardown, unless a newer connection has already replaced it.

mod will;

pub use will::{WillError, WillMessage};

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::broker::ClientHandle;

/// Registry of active client sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<ClientHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Install `handle` as the holder of `client_id`.
    ///
    /// The check-and-replace happens under the entry lock, so two CONNECTs
    /// racing on one id cannot both end up registered. A still-active
    /// previous holder is marked graceful (its Will is suppressed) and closed
    /// before the new handle becomes visible. Returns the superseded handle.
    pub fn register(
        &self,
        client_id: Arc<str>,
        handle: Arc<ClientHandle>,
    ) -> Option<Arc<ClientHandle>> {
        match self.sessions.entry(client_id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                if previous.id() != handle.id() && previous.is_alive() {
                    previous.mark_graceful();
                    previous.close();
                }
                entry.insert(handle);
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
        }
    }

    /// Remove the entry for `client_id` only if it still belongs to
    /// connection `connection_id`
    pub fn remove_if_current(&self, client_id: &str, connection_id: u64) -> bool {
        self.sessions
            .remove_if(client_id, |_, handle| handle.id() == connection_id)
            .is_some()
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Emergency sweep: release every armed Will without publishing it.
    ///
    /// Each handle is also marked graceful so a teardown still in flight
    /// treats its connection as closed on purpose. Returns the number of
    /// Wills released.
    pub fn release_all_wills(&self) -> usize {
        let mut released = 0;
        for entry in self.sessions.iter() {
            let handle = entry.value();
            handle.mark_graceful();
            if handle.take_will().is_some() {
                released += 1;
            }
        }
        released
    }
}

/// Broker-wide packet identifier source.
///
/// Ids run 1..=65535 and wrap back to 1; 0 is never handed out.
#[derive(Debug)]
pub struct PacketIdGenerator {
    next: AtomicU16,
}

impl PacketIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }

    pub fn next_id(&self) -> u16 {
        let advance = |id: u16| Some(if id == u16::MAX { 1 } else { id + 1 });
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(id) | Err(id) => id,
        }
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

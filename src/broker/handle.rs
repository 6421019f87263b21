//! Per-connection shared state.
//!
//! A `ClientHandle` is what the rest of the broker holds for a connection:
//! the session registry maps client ids to it, the subscription index stores
//! it per filter, and the router writes fan-out frames into its outbound
//! buffer. The connection task flushes that buffer to the socket whenever it
//! is notified.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use ahash::AHashSet;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::session::WillMessage;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Error when writing to a closed handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

pub struct ClientHandle {
    id: u64,
    addr: SocketAddr,
    /// Set once, on a successful CONNECT
    client_id: OnceLock<Arc<str>>,
    will: Mutex<Option<WillMessage>>,
    graceful: AtomicBool,
    /// Filters this connection holds in the subscription index
    subscriptions: Mutex<AHashSet<Arc<str>>>,
    /// Pre-encoded frames waiting to be written
    buffer: Mutex<BytesMut>,
    notify: Notify,
    alive: AtomicBool,
}

impl ClientHandle {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            client_id: OnceLock::new(),
            will: Mutex::new(None),
            graceful: AtomicBool::new(false),
            subscriptions: Mutex::new(AHashSet::new()),
            buffer: Mutex::new(BytesMut::with_capacity(1024)),
            notify: Notify::new(),
            alive: AtomicBool::new(true),
        }
    }

    /// Unique id of the underlying connection
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_id(&self) -> Option<&Arc<str>> {
        self.client_id.get()
    }

    /// Record the client id; returns false if one was already set
    pub fn set_client_id(&self, client_id: Arc<str>) -> bool {
        self.client_id.set(client_id).is_ok()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection closed and wake its task
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Resolves when frames are buffered or the handle is closed
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Append a copy of `frame` to the outbound buffer
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.buffer.lock().extend_from_slice(frame);
        self.notify.notify_one();
        Ok(())
    }

    /// Take all pending outbound data
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Arm a Will, returning any Will it replaces
    pub fn arm_will(&self, will: WillMessage) -> Option<WillMessage> {
        self.will.lock().replace(will)
    }

    /// Take and clear the Will. Only the first caller gets it.
    pub fn take_will(&self) -> Option<WillMessage> {
        self.will.lock().take()
    }

    pub fn has_will(&self) -> bool {
        self.will.lock().is_some()
    }

    pub fn mark_graceful(&self) {
        self.graceful.store(true, Ordering::Release);
    }

    pub fn is_graceful(&self) -> bool {
        self.graceful.load(Ordering::Acquire)
    }

    /// Reset per-session state at CONNECT
    pub(crate) fn reset_session(&self) {
        self.graceful.store(false, Ordering::Release);
        self.subscriptions.lock().clear();
    }

    /// Returns true if the filter was not already tracked
    pub(crate) fn track_subscription(&self, filter: Arc<str>) -> bool {
        self.subscriptions.lock().insert(filter)
    }

    pub(crate) fn untrack_subscription(&self, filter: &str) -> bool {
        self.subscriptions.lock().remove(filter)
    }

    pub(crate) fn take_subscriptions(&self) -> AHashSet<Arc<str>> {
        std::mem::take(&mut *self.subscriptions.lock())
    }

    pub fn subscriptions(&self) -> Vec<Arc<str>> {
        self.subscriptions.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("client_id", &self.client_id.get())
            .field("alive", &self.is_alive())
            .field("graceful", &self.is_graceful())
            .finish()
    }
}

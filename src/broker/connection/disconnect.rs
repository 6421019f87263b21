//! Disconnect handling and connection teardown

use tracing::{debug, info};

use super::{Connection, ConnectionError};

impl<S> Connection<S> {
    /// Handle DISCONNECT: the close is deliberate, so the Will is discarded
    pub(crate) fn handle_disconnect(&mut self) -> Result<(), ConnectionError> {
        debug!("DISCONNECT from {}", self.client_label());
        self.handle.mark_graceful();
        Err(ConnectionError::Disconnected)
    }

    /// Release everything this connection holds in shared state.
    ///
    /// Runs once, from `Drop`. The Will is taken before the graceful flag is
    /// read, so a Will is consumed at most once even if the emergency sweep
    /// runs concurrently.
    pub(crate) fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let shared = &self.shared;
        self.handle.close();
        shared.metrics.client_disconnected();

        if let Some(will) = self.handle.take_will() {
            if self.handle.is_graceful() {
                debug!("Discarding will for {}", self.client_label());
                shared.metrics.wills_discarded(1);
            } else {
                info!(
                    "Publishing will for {} to {}",
                    self.client_label(),
                    will.topic
                );
                shared.router.publish(&will.into_publish());
                shared.metrics.will_published();
            }
        }

        if let Some(client_id) = self.handle.client_id() {
            if shared.sessions.remove_if_current(client_id, self.handle.id()) {
                debug!("Session {} removed", client_id);
            }
        }

        let removed = shared.subscriptions.unsubscribe_all(&self.handle);
        if removed > 0 {
            debug!(
                "Removed {} subscriptions for {}",
                removed,
                self.client_label()
            );
        }
    }
}

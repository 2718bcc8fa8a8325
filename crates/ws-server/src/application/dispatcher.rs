//! Host callback registry and event routing.
//!
//! The host registers up to four callbacks, each taking a single `&str`.
//! Whatever context the host needs travels inside the closure itself.
//!
//! Callbacks are cloned out of their slot before being invoked, so no lock
//! is held while host code runs.  A callback may therefore replace itself,
//! replace another callback, or call back into the server (e.g. broadcast)
//! without deadlocking.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::CloseCause;

/// A host callback.
pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

type Slot = RwLock<Option<Callback>>;

/// Routes connection events to the host's callbacks.
#[derive(Default)]
pub struct EventDispatcher {
    on_open: Slot,
    on_message: Slot,
    on_error: Slot,
    on_close: Slot,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("on_open", &self.on_open.read().is_some())
            .field("on_message", &self.on_message.read().is_some())
            .field("on_error", &self.on_error.read().is_some())
            .field("on_close", &self.on_close.read().is_some())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Called with the peer address once a connection completes its handshake.
    pub fn set_on_open<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_open.write() = Some(Arc::new(callback));
    }

    /// Called with every complete, non-empty text message.
    pub fn set_on_message<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_message.write() = Some(Arc::new(callback));
    }

    /// Called with a diagnostic when an open connection fails or ends.
    pub fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_error.write() = Some(Arc::new(callback));
    }

    /// Called with the peer's reason text when the peer closes cleanly.
    ///
    /// Without this callback, clean closes are reported through `on_error`
    /// as `"peer closed"`.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_close.write() = Some(Arc::new(callback));
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Reports a successful handshake.  Returns `true` if a callback ran.
    pub fn open(&self, peer: &str) -> bool {
        fire(&self.on_open, peer)
    }

    /// Delivers a text message.  Empty messages are dropped.
    pub fn message(&self, text: &str) -> bool {
        if text.is_empty() {
            debug!("dropping empty text message");
            return false;
        }
        fire(&self.on_message, text)
    }

    /// Reports the end of an open connection.
    ///
    /// A clean peer close goes to `on_close` when one is registered.  Every
    /// other cause, and a clean close with no `on_close`, goes to `on_error`
    /// with the cause's display text.
    pub fn closed(&self, cause: &CloseCause) -> bool {
        if let CloseCause::PeerClosed { reason, .. } = cause {
            if fire(&self.on_close, reason) {
                return true;
            }
        }
        fire(&self.on_error, &cause.to_string())
    }
}

fn fire(slot: &Slot, arg: &str) -> bool {
    // Clone under the read lock, call after releasing it.
    let callback = slot.read().clone();
    match callback {
        Some(cb) => {
            cb(arg);
            true
        }
        None => false,
    }
}

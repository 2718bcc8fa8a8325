//! Shared per-connection handle.
//!
//! A [`Connection`] is created at TCP accept time and lives in the registry
//! until its session task tears it down.  Other tasks (the watchdog, the
//! broadcaster, server shutdown) only ever touch it through this handle:
//!
//! - outbound bytes go through a bounded queue drained by the connection's
//!   single writer task, so frames from different producers never interleave;
//! - teardown requests record a [`CloseCause`] and cancel the connection's
//!   token; the session task notices and performs the teardown itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use ws_core::{
    encode_frame, CloseClaim, ConnectionId, ConnectionState, Frame, LifecycleError, Phase,
};

use crate::error::CloseCause;

/// One item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encoded frame bytes.  Shared so a broadcast encodes once.
    Data(Arc<Vec<u8>>),
    /// The final close frame.  The writer flushes it and stops.
    Close(Vec<u8>),
}

/// Why an outbound frame could not be queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    /// The queue is at capacity: the peer is not reading fast enough.
    #[error("outbound queue full")]
    Full,
    /// The writer task has already stopped.
    #[error("connection writer stopped")]
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: Mutex<ConnectionState>,
    last_activity: Mutex<Instant>,
    outbound: mpsc::Sender<Outbound>,
    close_cause: Mutex<Option<CloseCause>>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            state: Mutex::new(ConnectionState::new()),
            last_activity: Mutex::new(Instant::now()),
            outbound,
            close_cause: Mutex::new(None),
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.state.lock().phase()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    /// `Connecting → Open`.  Fails if a close was claimed first.
    pub fn mark_open(&self) -> Result<(), LifecycleError> {
        self.state.lock().open()
    }

    /// Claims the teardown; see [`ConnectionState::begin_close`].
    pub fn begin_close(&self) -> Option<CloseClaim> {
        self.state.lock().begin_close()
    }

    pub fn finish_close(&self) -> Result<(), LifecycleError> {
        self.state.lock().finish_close()
    }

    // ── Activity ──────────────────────────────────────────────────────────────

    /// Records that the peer just sent something.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the peer last sent anything, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Queues pre-encoded bytes without waiting.
    pub fn send_bytes(&self, bytes: Arc<Vec<u8>>) -> Result<(), SendError> {
        self.outbound
            .try_send(Outbound::Data(bytes))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Encodes and queues one frame without waiting.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        self.send_bytes(Arc::new(encode_frame(frame)))
    }

    /// Queues the final close frame.  Returns `false` if the queue could not
    /// take it; the caller then abandons the writer.
    pub(crate) fn send_close(&self, frame: &Frame) -> bool {
        self.outbound
            .try_send(Outbound::Close(encode_frame(frame)))
            .is_ok()
    }

    // ── Teardown requests ─────────────────────────────────────────────────────

    /// Asks the session task to tear this connection down.
    ///
    /// The first recorded cause wins.  Returns `true` if this call recorded
    /// it.  Never blocks; safe to call from any task or callback.
    pub fn request_close(&self, cause: CloseCause) -> bool {
        let recorded = {
            let mut slot = self.close_cause.lock();
            if slot.is_none() {
                debug!(conn = %self.id, %cause, "close requested");
                *slot = Some(cause);
                true
            } else {
                false
            }
        };
        self.cancel.cancel();
        recorded
    }

    /// The recorded close cause, if any.
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.close_cause.lock().clone()
    }

    /// Cancels the session without recording a cause.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a close was requested or the server shut down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

//! Connection lifecycle state machine.
//!
//! ```text
//!  Connecting ──► Open ──► Closing ──► Closed
//!      │                      ▲
//!      └──────────────────────┘
//! ```
//!
//! Transitions only ever move forward.  Entering `Closing` is a claim: the
//! first caller to make it owns the teardown, every later caller learns that
//! somebody else got there first.  The server builds its "exactly one close
//! notification" guarantee on this.

use std::fmt;

use thiserror::Error;

/// Lifecycle phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// TCP accepted, handshake not yet completed.
    Connecting,
    /// Handshake completed; frames flowing.
    Open,
    /// Teardown claimed; close frame being flushed.
    Closing,
    /// Transport released.  Final.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connecting => "connecting",
            Phase::Open => "open",
            Phase::Closing => "closing",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },
}

/// Outcome of a successful [`ConnectionState::begin_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseClaim {
    /// `true` if the connection was `Open` when the claim was made.  Only
    /// such connections produce a close notification.
    pub was_open: bool,
}

/// Phase tracker for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    phase: Phase,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Connecting,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    /// Returns `true` once the connection has entered `Closing` or `Closed`.
    pub fn is_closing(&self) -> bool {
        self.phase >= Phase::Closing
    }

    /// Moves to `to` if the transition is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] for anything other than
    /// `Connecting→Open`, `Connecting→Closing`, `Open→Closing` or
    /// `Closing→Closed`.
    pub fn transition(&mut self, to: Phase) -> Result<(), LifecycleError> {
        let allowed = matches!(
            (self.phase, to),
            (Phase::Connecting, Phase::Open)
                | (Phase::Connecting, Phase::Closing)
                | (Phase::Open, Phase::Closing)
                | (Phase::Closing, Phase::Closed)
        );
        if !allowed {
            return Err(LifecycleError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// `Connecting → Open` after a successful handshake.
    pub fn open(&mut self) -> Result<(), LifecycleError> {
        self.transition(Phase::Open)
    }

    /// Claims the teardown.
    ///
    /// Returns `Some` for exactly one caller per connection; `None` if the
    /// connection was already closing or closed.
    pub fn begin_close(&mut self) -> Option<CloseClaim> {
        let was_open = self.phase == Phase::Open;
        self.transition(Phase::Closing).ok()?;
        Some(CloseClaim { was_open })
    }

    /// `Closing → Closed` once the transport is released.
    pub fn finish_close(&mut self) -> Result<(), LifecycleError> {
        self.transition(Phase::Closed)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

//! Error types for the server facade and per-connection close causes.

use std::net::SocketAddr;

use thiserror::Error;
use ws_core::{CloseCode, ProtocolError};

use crate::config::ConfigError;

/// Errors returned by [`crate::WsServer`] operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The listener could not be bound (port in use, permission denied, ...).
    #[error("failed to bind WebSocket listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `listen` was called on a server that is already listening.
    #[error("server is already listening")]
    AlreadyListening,

    /// The operation needs a listening server.
    #[error("server is not listening")]
    NotListening,

    /// `broadcast` found no connection in the open phase.
    #[error("no open connections")]
    NoOpenConnections,
}

/// Why a connection was torn down.
///
/// The `Display` text is what the host receives in its error callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer violated the frame protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A read or write on the transport failed, or the peer vanished.
    #[error("transport error: {0}")]
    Transport(String),

    /// No activity for two watchdog periods.
    #[error("watchdog timeout")]
    WatchdogTimeout,

    /// The server is closing.
    #[error("server shutdown")]
    ServerShutdown,

    /// The outbound queue overflowed.
    #[error("slow consumer")]
    SlowConsumer,

    /// The peer sent a close frame.
    #[error("peer closed")]
    PeerClosed {
        code: Option<CloseCode>,
        reason: String,
    },
}

impl CloseCause {
    /// Status code for the close frame the server sends.
    pub fn close_code(&self) -> CloseCode {
        match self {
            CloseCause::Protocol(err) => err.close_code(),
            CloseCause::Transport(_) => CloseCode::Error,
            CloseCause::WatchdogTimeout | CloseCause::ServerShutdown => CloseCode::Away,
            CloseCause::SlowConsumer => CloseCode::Policy,
            CloseCause::PeerClosed { code, .. } => code.unwrap_or(CloseCode::Normal),
        }
    }

    /// Reason text for the close frame the server sends.
    pub fn close_reason(&self) -> &str {
        match self {
            CloseCause::WatchdogTimeout => "Timeout",
            CloseCause::ServerShutdown => "Server shutdown",
            CloseCause::SlowConsumer => "Slow consumer",
            CloseCause::Protocol(_) => "Protocol error",
            CloseCause::Transport(_) | CloseCause::PeerClosed { .. } => "",
        }
    }

    /// `true` for a clean close initiated by the peer.
    pub fn is_peer_close(&self) -> bool {
        matches!(self, CloseCause::PeerClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_text_for_each_cause() {
        assert_eq!(CloseCause::WatchdogTimeout.to_string(), "watchdog timeout");
        assert_eq!(CloseCause::ServerShutdown.to_string(), "server shutdown");
        assert_eq!(CloseCause::SlowConsumer.to_string(), "slow consumer");
        assert_eq!(
            CloseCause::PeerClosed {
                code: Some(CloseCode::Normal),
                reason: "bye".to_string()
            }
            .to_string(),
            "peer closed"
        );
        assert_eq!(
            CloseCause::Protocol(ProtocolError::UnexpectedContinuation).to_string(),
            "protocol error: continuation frame without a message in progress"
        );
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(
            CloseCause::Protocol(ProtocolError::InvalidUtf8).close_code(),
            CloseCode::Invalid
        );
        assert_eq!(CloseCause::WatchdogTimeout.close_code(), CloseCode::Away);
        assert_eq!(CloseCause::SlowConsumer.close_code(), CloseCode::Policy);
        assert_eq!(
            CloseCause::PeerClosed {
                code: None,
                reason: String::new()
            }
            .close_code(),
            CloseCode::Normal
        );
    }

    #[test]
    fn test_only_peer_close_is_peer_close() {
        assert!(CloseCause::PeerClosed {
            code: None,
            reason: String::new()
        }
        .is_peer_close());
        assert!(!CloseCause::WatchdogTimeout.is_peer_close());
    }
}

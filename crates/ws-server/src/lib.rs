//! ws-server library crate.
//!
//! An embeddable WebSocket server engine.  A host program creates a
//! [`WsServer`], registers plain callbacks, calls `listen`, and from then on
//! receives connection events and text messages while it can `broadcast`
//! text to every open client.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Host program (callbacks, broadcast)
//!         ↕
//! [ws-server]
//!   ├── config            ServerConfig (serde + toml)
//!   ├── error             ServerError, CloseCause
//!   ├── application/
//!   │     └── dispatcher  Host callbacks and the close-notification policy
//!   └── infrastructure/
//!         ├── server      WsServer facade: listen / close / broadcast
//!         ├── session     Per-connection handshake, read loop and writer
//!         ├── registry    Live connections, bounded by max_connections
//!         ├── connection  Shared per-connection handle
//!         └── watchdog    Periodic ping / eviction
//!         ↕
//! [ws-core]  frame codec, handshake validation, lifecycle state machine
//! ```
//!
//! # Layer rules
//!
//! - `ws-core` has no I/O and no async.
//! - `application` depends on `ws-core` and `error` only.
//! - `infrastructure` depends on all other layers plus `tokio`.

/// Server configuration.
pub mod config;

/// Error types and connection close causes.
pub mod error;

/// Application layer: callback dispatch.
pub mod application;

/// Infrastructure layer: listener, sessions, registry and watchdog.
pub mod infrastructure;

pub use application::dispatcher::EventDispatcher;
pub use config::{ConfigError, ServerConfig};
pub use error::{CloseCause, ServerError};
pub use infrastructure::server::{BroadcastReport, WsServer};

/// Library version, as reported by `server_version()` in the C API.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Infrastructure layer of the server engine.
//!
//! Contains the tokio-facing adapters: the TCP listener, the per-connection
//! session and writer tasks, the watchdog timer and the shared connection
//! registry.
//!
//! **Dependency rule**: this layer may depend on `application` and `ws_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod connection;
pub mod registry;
pub mod server;
pub mod session;
pub mod watchdog;

//! Domain entities for the WebSocket server.
//!
//! This module contains pure connection bookkeeping with no infrastructure
//! dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! The innermost layer of the workspace.  Domain code has no imports from
//! sockets, async runtimes or threads, so it compiles and tests anywhere.
//! Here that means two things: how a connection is identified, and which
//! lifecycle phases it may move through.  The server crate decides *when*
//! transitions happen; this module decides *which* transitions are legal.

/// Opaque, server-unique connection identifier.
pub mod connection_id;

/// `Connecting → Open → Closing → Closed` state machine.
pub mod lifecycle;

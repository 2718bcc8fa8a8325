//! # ws-core
//!
//! Protocol and domain layer of the embeddable WebSocket server.
//!
//! This crate has zero dependencies on sockets, async runtimes, or threads.
//! Everything in here operates on byte slices and plain values, which keeps
//! the wire protocol testable without a network.
//!
//! # Architecture overview (for beginners)
//!
//! A WebSocket connection starts life as an ordinary HTTP/1.1 request.  The
//! client asks the server to "upgrade" the connection; once the server agrees,
//! both sides stop speaking HTTP and start exchanging *frames* over the same
//! TCP stream.
//!
//! - **`protocol`** – How bytes travel over the wire.  The opening handshake
//!   (`handshake`), the binary frame layout (`frame`, `codec`), and the
//!   reassembly of fragmented messages (`assembler`).
//!
//! - **`domain`** – Pure connection bookkeeping: the opaque connection id and
//!   the `Connecting → Open → Closing → Closed` lifecycle state machine.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `ws_core::Frame` instead of `ws_core::protocol::frame::Frame`.
pub use domain::connection_id::ConnectionId;
pub use domain::lifecycle::{CloseClaim, ConnectionState, LifecycleError, Phase};
pub use protocol::assembler::{Incoming, MessageAssembler};
pub use protocol::codec::{decode_frame, encode_frame, DecodeLimits, ProtocolError};
pub use protocol::frame::{CloseCode, Frame, Opcode};
pub use protocol::handshake::{HandshakeError, UpgradeRequest};

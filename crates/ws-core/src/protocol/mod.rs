//! Protocol module containing the handshake, frame types, and the binary codec.

pub mod assembler;
pub mod codec;
pub mod frame;
pub mod handshake;

pub use assembler::{Incoming, MessageAssembler};
pub use codec::{decode_frame, encode_frame, DecodeLimits, ProtocolError};
pub use frame::*;
pub use handshake::{HandshakeError, UpgradeRequest};

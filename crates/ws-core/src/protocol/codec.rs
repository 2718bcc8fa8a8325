//! Binary codec for WebSocket frames.
//!
//! Wire format (all multi-byte integers are big-endian):
//! ```text
//! [fin|rsv|opcode:1][mask|len7:1][ext_len:0/2/8][mask_key:0/4][payload:N]
//! ```
//!
//! Decoding is resumable: [`decode_frame`] returns `Ok(None)` when the slice
//! holds only part of a frame, so the caller keeps the bytes and retries once
//! more data has arrived.  Header violations are reported as soon as the
//! offending header bytes are available, without waiting for the payload.

use thiserror::Error;

use crate::protocol::frame::{
    apply_mask, CloseCode, Frame, Opcode, FIN_BIT, LEN_16_MARKER, LEN_64_MARKER, LEN_BITS,
    MASK_BIT, MAX_CONTROL_PAYLOAD, MAX_SHORT_PAYLOAD, OPCODE_BITS, RSV_BITS,
};

/// Errors raised while decoding frames or reassembling messages.
///
/// Every variant is fatal for the connection.  [`ProtocolError::close_code`]
/// gives the status code to put in the close frame sent to the peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// RSV1..RSV3 set while no extension is negotiated.
    #[error("reserved bits set: 0b{0:03b}")]
    ReservedBitsSet(u8),

    /// The opcode nibble is not a defined value.
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// A close, ping or pong frame arrived with FIN cleared.
    #[error("fragmented control frame: {0:?}")]
    FragmentedControlFrame(Opcode),

    /// A control frame declared more than 125 payload bytes.
    #[error("control frame payload too large: {0} bytes")]
    ControlFrameTooLarge(u64),

    /// A client frame arrived without a masking key.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// A server frame arrived with a masking key.
    #[error("server frame must not be masked")]
    UnexpectedMask,

    /// A single frame declared a payload above the configured limit.
    #[error("frame payload of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: u64, max: usize },

    /// A continuation frame arrived while no fragmented message was pending.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// A new text/binary frame arrived while a fragmented message was pending.
    #[error("new {0:?} message started before the previous one finished")]
    MessageInterleaved(Opcode),

    /// The reassembled message grew above the configured limit.
    #[error("message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// A text message or close reason is not valid UTF-8.
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// The close frame payload is one byte long or carries a reserved code.
    #[error("invalid close frame payload: {0}")]
    InvalidClosePayload(String),
}

impl ProtocolError {
    /// Status code the server puts in its close frame for this error.
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::InvalidUtf8 => CloseCode::Invalid,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::MessageTooLarge { .. } => {
                CloseCode::Size
            }
            _ => CloseCode::Protocol,
        }
    }
}

/// Limits and role checks applied by [`decode_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Largest payload a single frame may declare.
    pub max_payload: usize,
    /// `true` when decoding client→server traffic: frames must be masked.
    /// `false` when decoding server→client traffic: frames must not be.
    pub require_mask: bool,
}

impl DecodeLimits {
    /// Limits for the server side of a connection.
    pub fn server(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: true,
        }
    }

    /// Limits for a client reading server frames.
    pub fn client(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: false,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `frame` into its wire representation.
///
/// The shortest length encoding is always used.  When `frame.mask` is set
/// the payload is masked with that key; server frames leave it unset.
///
/// # Examples
///
/// ```rust
/// use ws_core::protocol::{decode_frame, encode_frame, DecodeLimits, Frame};
///
/// let bytes = encode_frame(&Frame::text("hi"));
/// assert_eq!(bytes, vec![0x81, 0x02, b'h', b'i']);
///
/// let (frame, consumed) = decode_frame(&bytes, &DecodeLimits::client(1024))
///     .unwrap()
///     .unwrap();
/// assert_eq!(frame.payload, b"hi");
/// assert_eq!(consumed, 4);
/// ```
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let len = frame.payload.len();
    let mut buf = Vec::with_capacity(14 + len);

    let mut b0 = (frame.opcode as u8) | ((frame.rsv & 0x07) << 4);
    if frame.fin {
        b0 |= FIN_BIT;
    }
    buf.push(b0);

    let mask_bit = if frame.mask.is_some() { MASK_BIT } else { 0 };
    if len <= MAX_SHORT_PAYLOAD {
        buf.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(mask_bit | LEN_16_MARKER);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | LEN_64_MARKER);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match frame.mask {
        Some(key) => {
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(&frame.payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.extend_from_slice(&frame.payload),
    }
    buf
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns `Ok(None)` if `bytes` does not yet hold a complete frame, or the
/// decoded frame (payload already unmasked) and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError`] for reserved bits, unknown opcodes, fragmented
/// or oversized control frames, a mask bit that violates `limits`, or a
/// declared payload above `limits.max_payload`.
pub fn decode_frame(
    bytes: &[u8],
    limits: &DecodeLimits,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if bytes.len() < 2 {
        return Ok(None);
    }

    let b0 = bytes[0];
    let b1 = bytes[1];

    let fin = b0 & FIN_BIT != 0;
    let rsv = (b0 & RSV_BITS) >> 4;
    if rsv != 0 {
        return Err(ProtocolError::ReservedBitsSet(rsv));
    }
    let raw_opcode = b0 & OPCODE_BITS;
    let opcode =
        Opcode::try_from(raw_opcode).map_err(|_| ProtocolError::UnknownOpcode(raw_opcode))?;
    if opcode.is_control() && !fin {
        return Err(ProtocolError::FragmentedControlFrame(opcode));
    }

    let masked = b1 & MASK_BIT != 0;
    if limits.require_mask && !masked {
        return Err(ProtocolError::UnmaskedFrame);
    }
    if !limits.require_mask && masked {
        return Err(ProtocolError::UnexpectedMask);
    }

    let len7 = b1 & LEN_BITS;
    let (payload_len, mut offset) = match len7 {
        LEN_16_MARKER => {
            if bytes.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([bytes[2], bytes[3]]) as u64, 4)
        }
        LEN_64_MARKER => {
            if bytes.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        short => (short as u64, 2),
    };

    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(ProtocolError::ControlFrameTooLarge(payload_len));
    }
    if payload_len > limits.max_payload as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: limits.max_payload,
        });
    }
    // Bounded by max_payload above, so the cast cannot truncate.
    let payload_len = payload_len as usize;

    let mask = if masked {
        if bytes.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total = offset
        .checked_add(payload_len)
        .ok_or(ProtocolError::MessageTooLarge {
            size: payload_len,
            max: limits.max_payload,
        })?;
    if bytes.len() < total {
        return Ok(None);
    }

    let mut payload = bytes[offset..total].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        Frame {
            fin,
            rsv,
            opcode,
            mask,
            payload,
        },
        total,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn server() -> DecodeLimits {
        DecodeLimits::server(1 << 20)
    }

    fn client() -> DecodeLimits {
        DecodeLimits::client(1 << 20)
    }

    #[test]
    fn test_encode_short_text_frame_layout() {
        let bytes = encode_frame(&Frame::text("abc"));
        assert_eq!(bytes, vec![0x81, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_uses_16_bit_length_from_126_bytes() {
        let bytes = encode_frame(&Frame::binary(vec![0u8; 126]));
        assert_eq!(bytes[1], 126);
        assert_eq!(&bytes[2..4], &[0x00, 0x7E]);
        assert_eq!(bytes.len(), 4 + 126);
    }

    #[test]
    fn test_encode_uses_64_bit_length_above_u16_max() {
        let bytes = encode_frame(&Frame::binary(vec![0u8; 65_536]));
        assert_eq!(bytes[1], 127);
        assert_eq!(&bytes[2..10], &65_536u64.to_be_bytes());
    }

    #[test]
    fn test_encode_masked_frame_sets_mask_bit_and_key() {
        let bytes = encode_frame(&Frame::text("abc").masked(KEY));
        assert_eq!(bytes[1], 0x80 | 3);
        assert_eq!(&bytes[2..6], &KEY);
        assert_eq!(bytes[6], b'a' ^ 0x12);
        assert_eq!(bytes[7], b'b' ^ 0x34);
        assert_eq!(bytes[8], b'c' ^ 0x56);
    }

    #[test]
    fn test_decode_masked_client_frame_unmasks_payload() {
        // Arrange
        let bytes = encode_frame(&Frame::text("abc").masked(KEY));

        // Act
        let (frame, consumed) = decode_frame(&bytes, &server()).unwrap().unwrap();

        // Assert
        assert_eq!(frame.payload, b"abc");
        assert_eq!(frame.mask, Some(KEY));
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_decode_partial_frame_returns_none_at_every_split() {
        let bytes = encode_frame(&Frame::binary(vec![7u8; 300]).masked(KEY));
        for cut in 0..bytes.len() {
            assert_eq!(
                decode_frame(&bytes[..cut], &server()).unwrap(),
                None,
                "prefix of {cut} bytes must be incomplete"
            );
        }
        assert!(decode_frame(&bytes, &server()).unwrap().is_some());
    }

    #[test]
    fn test_decode_leaves_trailing_bytes_for_next_frame() {
        let mut bytes = encode_frame(&Frame::text("one").masked(KEY));
        let first_len = bytes.len();
        bytes.extend(encode_frame(&Frame::text("two").masked(KEY)));

        let (first, consumed) = decode_frame(&bytes, &server()).unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(consumed, first_len);

        let (second, _) = decode_frame(&bytes[consumed..], &server()).unwrap().unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[test]
    fn test_decode_rejects_reserved_bits() {
        let bytes = [0x81 | 0x40, 0x80, 0, 0, 0, 0];
        assert_eq!(
            decode_frame(&bytes, &server()),
            Err(ProtocolError::ReservedBitsSet(0b100))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let bytes = [0x83, 0x80, 0, 0, 0, 0];
        assert_eq!(
            decode_frame(&bytes, &server()),
            Err(ProtocolError::UnknownOpcode(0x3))
        );
    }

    #[test]
    fn test_decode_rejects_fragmented_ping() {
        let bytes = [0x09, 0x80, 0, 0, 0, 0];
        assert_eq!(
            decode_frame(&bytes, &server()),
            Err(ProtocolError::FragmentedControlFrame(Opcode::Ping))
        );
    }

    #[test]
    fn test_decode_rejects_oversized_control_frame_from_header_alone() {
        // Only the header is present; the error must not wait for the payload.
        let bytes = [0x89, 0x80 | 126, 0x00, 0x7E];
        assert_eq!(
            decode_frame(&bytes, &server()),
            Err(ProtocolError::ControlFrameTooLarge(126))
        );
    }

    #[test]
    fn test_decode_rejects_unmasked_frame_on_server_side() {
        let bytes = encode_frame(&Frame::text("abc"));
        assert_eq!(
            decode_frame(&bytes, &server()),
            Err(ProtocolError::UnmaskedFrame)
        );
    }

    #[test]
    fn test_decode_rejects_masked_frame_on_client_side() {
        let bytes = encode_frame(&Frame::text("abc").masked(KEY));
        assert_eq!(
            decode_frame(&bytes, &client()),
            Err(ProtocolError::UnexpectedMask)
        );
    }

    #[test]
    fn test_decode_rejects_frame_above_limit_before_payload_arrives() {
        let limits = DecodeLimits::server(1000);
        let bytes = [0x82, 0x80 | 126, 0x03, 0xE9]; // declares 1001 bytes
        assert_eq!(
            decode_frame(&bytes, &limits),
            Err(ProtocolError::FrameTooLarge {
                size: 1001,
                max: 1000
            })
        );
    }

    #[test]
    fn test_decode_length_that_overflows_frame_size_is_an_error() {
        // Arrange: no effective limit, 64-bit length just below usize::MAX
        let limits = DecodeLimits {
            max_payload: usize::MAX,
            require_mask: false,
        };
        let declared = usize::MAX - 5;
        let mut bytes = vec![0x81, 127];
        bytes.extend_from_slice(&(declared as u64).to_be_bytes());

        // Act
        let result = decode_frame(&bytes, &limits);

        // Assert
        assert_eq!(
            result,
            Err(ProtocolError::MessageTooLarge {
                size: declared,
                max: usize::MAX
            })
        );
    }

    #[test]
    fn test_decode_accepts_non_minimal_length_encoding() {
        // 3-byte payload declared through the 16-bit form.
        let mut bytes = vec![0x81, 126, 0x00, 0x03];
        bytes.extend_from_slice(b"abc");
        let (frame, consumed) = decode_frame(&bytes, &client()).unwrap().unwrap();
        assert_eq!(frame.payload, b"abc");
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(ProtocolError::InvalidUtf8.close_code(), CloseCode::Invalid);
        assert_eq!(
            ProtocolError::MessageTooLarge { size: 2, max: 1 }.close_code(),
            CloseCode::Size
        );
        assert_eq!(ProtocolError::UnmaskedFrame.close_code(), CloseCode::Protocol);
        assert_eq!(
            ProtocolError::UnexpectedContinuation.close_code(),
            CloseCode::Protocol
        );
    }
}

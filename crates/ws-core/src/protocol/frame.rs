//! WebSocket frame types (RFC 6455 §5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

// ── Protocol constants ────────────────────────────────────────────────────────

/// Largest payload a control frame (close, ping, pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest payload encodable in the 7-bit length field.
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Length marker for a 16-bit extended payload length.
pub const LEN_16_MARKER: u8 = 126;

/// Length marker for a 64-bit extended payload length.
pub const LEN_64_MARKER: u8 = 127;

/// Bit masks for the first two header bytes.
pub(crate) const FIN_BIT: u8 = 0x80;
pub(crate) const RSV_BITS: u8 = 0x70;
pub(crate) const OPCODE_BITS: u8 = 0x0F;
pub(crate) const MASK_BIT: u8 = 0x80;
pub(crate) const LEN_BITS: u8 = 0x7F;

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// Frame type discriminator carried in the low nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Returns `true` for close, ping and pong.
    ///
    /// Control frames carry at most [`MAX_CONTROL_PAYLOAD`] bytes and are
    /// never fragmented.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Returns `true` for the two opcodes that may start a message.
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(()),
        }
    }
}

// ── Close status codes ────────────────────────────────────────────────────────

/// Status code carried in the first two bytes of a close frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, idle timeout).
    Away,
    /// 1002: protocol error.
    Protocol,
    /// 1003: a data type the endpoint cannot accept.
    Unsupported,
    /// 1007: payload inconsistent with the message type (bad UTF-8).
    Invalid,
    /// 1008: generic policy violation.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1011: unexpected server condition.
    Error,
    /// Any other code, passed through unchanged.
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1011 => CloseCode::Error,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Error => 1011,
            CloseCode::Other(other) => other,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One WebSocket protocol unit.
///
/// `payload` always holds the *unmasked* bytes.  When `mask` is `Some`, the
/// encoder masks the payload on the way out and the decoder has already
/// unmasked it on the way in; the key is kept so callers can tell a masked
/// frame from an unmasked one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// RSV1..RSV3 in the low three bits.  Must be zero without extensions.
    pub rsv: u8,
    pub opcode: Opcode,
    /// Masking key.  Present on every client→server frame, absent on every
    /// server→client frame.
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Builds a close frame with a status code and a UTF-8 reason.
    ///
    /// The reason is truncated on a character boundary so the payload never
    /// exceeds [`MAX_CONTROL_PAYLOAD`].
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        Self::new(Opcode::Close, payload)
    }

    /// Builds a close frame with an empty payload (no status code).
    pub fn close_empty() -> Self {
        Self::new(Opcode::Close, Vec::new())
    }

    /// Marks this frame as a non-final fragment.
    pub fn fragment(mut self) -> Self {
        self.fin = false;
        self
    }

    /// Attaches a masking key (client→server frames).
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }
}

/// XORs `payload` in place with the 4-byte masking key.
///
/// Byte `i` is XORed with `key[i % 4]`.  Masking and unmasking are the same
/// operation.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

//! Reassembly of fragmented WebSocket messages.
//!
//! A message is either one frame with FIN set, or a text/binary frame with
//! FIN cleared followed by continuation frames, the last of which has FIN
//! set.  Control frames may appear between fragments and are surfaced
//! immediately; they never touch the pending message.

use crate::protocol::codec::ProtocolError;
use crate::protocol::frame::{CloseCode, Frame, Opcode};

/// A complete unit of inbound traffic, ready for the connection to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A complete, UTF-8 validated text message.
    Text(String),
    /// A complete binary message.
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// A close frame.  `None` when the peer sent no status code.
    Close(Option<(CloseCode, String)>),
}

/// Accumulates fragments of at most one in-progress data message.
#[derive(Debug)]
pub struct MessageAssembler {
    pending: Option<(Opcode, Vec<u8>)>,
    max_message_size: usize,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: None,
            max_message_size,
        }
    }

    /// Returns `true` while a fragmented message is waiting for its final
    /// continuation frame.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feeds one decoded frame.
    ///
    /// Returns `Ok(None)` when the frame was a non-final fragment, or the
    /// completed message / control frame otherwise.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnexpectedContinuation`] for a continuation frame
    ///   with no message in progress.
    /// - [`ProtocolError::MessageInterleaved`] for a new text/binary frame
    ///   while one is in progress.
    /// - [`ProtocolError::MessageTooLarge`] when the accumulated payload
    ///   exceeds the limit.
    /// - [`ProtocolError::InvalidUtf8`] for a completed text message that is
    ///   not UTF-8.
    /// - [`ProtocolError::InvalidClosePayload`] for a malformed close frame.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Incoming>, ProtocolError> {
        match frame.opcode {
            Opcode::Ping => Ok(Some(Incoming::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Incoming::Pong(frame.payload))),
            Opcode::Close => parse_close_payload(&frame.payload).map(|c| Some(Incoming::Close(c))),
            Opcode::Text | Opcode::Binary => {
                if self.pending.is_some() {
                    return Err(ProtocolError::MessageInterleaved(frame.opcode));
                }
                self.check_size(frame.payload.len())?;
                if frame.fin {
                    finish(frame.opcode, frame.payload).map(Some)
                } else {
                    self.pending = Some((frame.opcode, frame.payload));
                    Ok(None)
                }
            }
            Opcode::Continuation => {
                let (opcode, mut buffer) = self
                    .pending
                    .take()
                    .ok_or(ProtocolError::UnexpectedContinuation)?;
                self.check_size(buffer.len() + frame.payload.len())?;
                buffer.extend_from_slice(&frame.payload);
                if frame.fin {
                    finish(opcode, buffer).map(Some)
                } else {
                    self.pending = Some((opcode, buffer));
                    Ok(None)
                }
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn finish(opcode: Opcode, payload: Vec<u8>) -> Result<Incoming, ProtocolError> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Incoming::Text)
            .map_err(|_| ProtocolError::InvalidUtf8),
        _ => Ok(Incoming::Binary(payload)),
    }
}

/// Parses the body of a close frame.
///
/// An empty body means "no status code".  Otherwise the body is a 2-byte
/// code followed by an optional UTF-8 reason.
pub fn parse_close_payload(
    payload: &[u8],
) -> Result<Option<(CloseCode, String)>, ProtocolError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::InvalidClosePayload(
            "one-byte close payload".to_string(),
        )),
        _ => {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(raw) {
                return Err(ProtocolError::InvalidClosePayload(format!(
                    "status code {raw} may not be sent"
                )));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_string();
            Ok(Some((CloseCode::from(raw), reason)))
        }
    }
}

// 1004-1006 and 1015 are reserved for local use and never appear on the wire.
fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

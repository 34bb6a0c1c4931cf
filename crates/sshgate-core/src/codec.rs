//! JSON text framing for the gateway socket.
//!
//! Wire format: one JSON object per websocket text frame, discriminated by
//! its `type` field.

use crate::error::{GateError, GateResult};
use crate::messages::{ClientMessage, ServerMessage};
use serde_json::Value;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ClientMessage),
    /// A well-formed frame whose `type` is not part of the protocol.
    Unknown(String),
}

/// Encode an outbound message as a text frame payload.
pub fn encode(message: &ServerMessage) -> GateResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode an inbound text frame.
///
/// Unknown `type` values are not an error; malformed JSON, a missing `type`
/// or bad fields on a known type are.
pub fn decode(text: &str) -> GateResult<Inbound> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GateError::InvalidMessage(format!("frame is not JSON: {e}")))?;

    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::InvalidMessage("frame has no `type` field".into()))?
        .to_string();

    let message: ClientMessage = serde_json::from_value(value)
        .map_err(|e| GateError::InvalidMessage(format!("{type_name}: {e}")))?;

    Ok(match message {
        ClientMessage::Unknown => Inbound::Unknown(type_name),
        message => Inbound::Message(message),
    })
}

/// Incremental UTF-8 decoder for terminal output.
///
/// Shell reads can end in the middle of a multi-byte character. The
/// incomplete tail is held back and prefixed to the next read, so the
/// concatenation of every decoded chunk equals the decoded byte stream.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Decode the next read. Invalid sequences become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            // Truncated sequence at the end: wait for more bytes.
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still held back (end of stream).
    pub fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

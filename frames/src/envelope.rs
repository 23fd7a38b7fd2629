//! Envelope framing: reassembles `SockJS` style frames from a chunked byte stream.
//!
//! DESIGN
//! ======
//! The envelope protocol prefixes every unit with a one-byte opcode:
//!
//! - `o` open, no body
//! - `h` heartbeat, no body
//! - `a["...", "..."]` one or more messages batched in a JSON string array
//! - `c[code,"reason"]` close, terminal
//!
//! [`parse`] is a pure function over the pending bytes. Body-less frames are
//! consumed immediately; array frames are only consumed once the closing `]`
//! has arrived, otherwise everything from the opcode onward is handed back as
//! the remainder so the caller can prepend it to the next chunk. Feeding a
//! stream one byte at a time therefore yields the same frames as feeding it
//! whole.
//!
//! RESYNC
//! ======
//! `o` and `h` only count as frames when followed by a separator, another
//! opcode or the end of the input, so a word such as `hello` is not read as a
//! heartbeat. Anything else is skipped as one run and reported as a
//! [`FramingError::UnknownOpcode`]. The run ends at ASCII whitespace (the XHR
//! transports terminate each frame with `\n`) or at an unambiguous frame
//! start: `a[`, `c[`, or `o`/`h` followed by whitespace. Parsing never stalls
//! on bad input.

use serde::Deserialize;

const OPEN: u8 = b'o';
const HEARTBEAT: u8 = b'h';
const ARRAY: u8 = b'a';
const SINGLE: u8 = b'm';
const CLOSE: u8 = b'c';

/// Close code used when a close frame carries no usable payload.
pub const DEFAULT_CLOSE_CODE: u16 = 3000;

/// Error reported by [`parse`] for bytes it had to skip.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A run of bytes that does not start with a known opcode.
    #[error("unrecognized envelope opcode, skipped {skipped:?}")]
    UnknownOpcode { skipped: String },
    /// A single-message `m` frame; only batched `a[...]` frames are accepted.
    #[error("unexpected single-message envelope frame")]
    SingleMessage,
    /// An array frame whose JSON payload has the wrong shape.
    #[error("invalid payload for envelope opcode `{opcode}`: {source}")]
    InvalidPayload {
        opcode: char,
        #[source]
        source: serde_json::Error,
    },
    /// An array opcode not followed by `[`.
    #[error("envelope opcode `{0}` is not followed by an array")]
    MissingArray(char),
}

/// Code and message carried by a close frame or a socket-level close.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// One logical envelope frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeFrame {
    Open,
    Heartbeat,
    /// Exactly one element of a (possibly batched) message array.
    Message(String),
    Close(CloseReason),
}

impl EnvelopeFrame {
    /// Wire opcode this frame was decoded from.
    #[must_use]
    pub fn opcode(&self) -> char {
        match self {
            Self::Open => OPEN as char,
            Self::Heartbeat => HEARTBEAT as char,
            Self::Message(_) => ARRAY as char,
            Self::Close(_) => CLOSE as char,
        }
    }
}

/// Output of [`parse`].
#[derive(Debug, Default)]
pub struct Parsed {
    /// Complete frames in arrival order. A [`EnvelopeFrame::Close`], if
    /// present, is always last.
    pub frames: Vec<EnvelopeFrame>,
    /// Unconsumed bytes to prepend to the next chunk.
    pub remainder: Vec<u8>,
    /// Input that was skipped while resynchronizing.
    pub errors: Vec<FramingError>,
}

impl Parsed {
    /// Whether a close frame ended parsing of this buffer.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.frames.last(), Some(EnvelopeFrame::Close(_)))
    }
}

#[derive(Deserialize)]
struct ClosePayload(u16, String);

enum Scan {
    /// Offset one past the end of the complete JSON value.
    Complete(usize),
    Incomplete,
}

/// Split `buffer` into complete envelope frames plus the unconsumed tail.
///
/// A close frame is terminal: nothing after it is parsed and the bytes that
/// follow it are returned untouched as the remainder.
#[must_use]
pub fn parse(buffer: &[u8]) -> Parsed {
    let mut parsed = Parsed::default();
    let mut pos = 0;

    while pos < buffer.len() {
        let byte = buffer[pos];
        match byte {
            b if b.is_ascii_whitespace() => pos += 1,
            OPEN if bodyless_frame_ends(buffer, pos) => {
                parsed.frames.push(EnvelopeFrame::Open);
                pos += 1;
            }
            HEARTBEAT if bodyless_frame_ends(buffer, pos) => {
                parsed.frames.push(EnvelopeFrame::Heartbeat);
                pos += 1;
            }
            ARRAY | CLOSE => {
                let body = &buffer[pos + 1..];
                if body.is_empty() {
                    break;
                }
                if body[0] != b'[' {
                    parsed.errors.push(FramingError::MissingArray(byte as char));
                    pos += 1;
                    continue;
                }
                let Scan::Complete(end) = scan_array(body) else {
                    break;
                };
                let json = &body[..end];
                pos += 1 + end;

                if byte == ARRAY {
                    match serde_json::from_slice::<Vec<String>>(json) {
                        Ok(items) => parsed
                            .frames
                            .extend(items.into_iter().map(EnvelopeFrame::Message)),
                        Err(source) => parsed.errors.push(FramingError::InvalidPayload {
                            opcode: ARRAY as char,
                            source,
                        }),
                    }
                } else {
                    let reason = match serde_json::from_slice::<ClosePayload>(json) {
                        Ok(ClosePayload(code, reason)) => CloseReason::new(code, reason),
                        Err(source) => {
                            parsed.errors.push(FramingError::InvalidPayload {
                                opcode: CLOSE as char,
                                source,
                            });
                            CloseReason::new(DEFAULT_CLOSE_CODE, "malformed close frame")
                        }
                    };
                    parsed.frames.push(EnvelopeFrame::Close(reason));
                    break;
                }
            }
            SINGLE => {
                let body = &buffer[pos + 1..];
                if body.is_empty() {
                    break;
                }
                if body[0] != b'"' {
                    parsed.errors.push(FramingError::SingleMessage);
                    pos += 1;
                    continue;
                }
                let Scan::Complete(end) = scan_string(body) else {
                    break;
                };
                parsed.errors.push(FramingError::SingleMessage);
                pos += 1 + end;
            }
            _ => {
                let start = pos;
                pos += 1;
                while pos < buffer.len() && !resumes_at(buffer, pos) {
                    pos += 1;
                }
                parsed.errors.push(FramingError::UnknownOpcode {
                    skipped: String::from_utf8_lossy(&buffer[start..pos]).into_owned(),
                });
            }
        }
    }

    parsed.remainder = buffer[pos..].to_vec();
    parsed
}

/// Wrap an outbound payload in the one-element array envelope.
///
/// The JSON encoder escapes quotes, newlines and the STOMP NUL terminator,
/// so the result can be decoded back into the exact input string.
#[must_use]
pub fn wrap(message: &str) -> String {
    // Writing a string array into memory cannot fail.
    serde_json::to_string(&[message]).unwrap_or_default()
}

/// Whether the body-less opcode at `pos` is a frame on its own.
fn bodyless_frame_ends(buffer: &[u8], pos: usize) -> bool {
    match buffer.get(pos + 1) {
        None => true,
        Some(&next) => {
            next.is_ascii_whitespace() || matches!(next, OPEN | HEARTBEAT | ARRAY | SINGLE | CLOSE)
        }
    }
}

/// Whether skipping unknown input may stop at `pos`.
fn resumes_at(buffer: &[u8], pos: usize) -> bool {
    let next = buffer.get(pos + 1).copied();
    match buffer[pos] {
        b if b.is_ascii_whitespace() => true,
        OPEN | HEARTBEAT => next.is_some_and(|b| b.is_ascii_whitespace()),
        ARRAY | CLOSE => matches!(next, None | Some(b'[')),
        _ => false,
    }
}

/// Find the end of the JSON array starting at `bytes[0] == b'['`.
fn scan_array(bytes: &[u8]) -> Scan {
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Scan::Complete(index + 1);
                }
            }
            _ => {}
        }
    }
    Scan::Incomplete
}

/// Find the end of the JSON string starting at `bytes[0] == b'"'`.
fn scan_string(bytes: &[u8]) -> Scan {
    let mut escaped = false;
    for (index, &byte) in bytes.iter().enumerate().skip(1) {
        if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            return Scan::Complete(index + 1);
        }
    }
    Scan::Incomplete
}

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;

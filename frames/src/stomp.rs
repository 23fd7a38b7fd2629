//! STOMP sub-protocol frames: outbound builders and inbound decoding.
//!
//! Wire format: `COMMAND\nkey:value\nkey:value\n\nBODY\0`.
//!
//! Inbound bodies are parsed as JSON when possible and fall back to the raw
//! string otherwise. Non-JSON bodies that match a known broker rejection are
//! surfaced as classified errors instead of frames.

use serde_json::Value;

/// Body text of the broker's authentication rejection.
const ACCESS_REFUSED: &str = "Access refused";

/// Markers of the broker's unknown-exchange rejection.
const NOT_FOUND_MARKERS: [&str; 2] = ["NOT_FOUND", "no exchange"];

/// Subscription id sent with every SUBSCRIBE frame.
pub const SUBSCRIPTION_ID: &str = "sub-0";

/// Error returned by [`decode`] and the frame builders.
#[derive(Debug, thiserror::Error)]
pub enum StompError {
    /// The text does not split into `command\nheaders\n\nbody`.
    #[error("malformed STOMP frame: {0:?}")]
    Malformed(String),
    /// The broker refused the credentials. Recoverable by reconnecting.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// The subscribed or published exchange does not exist.
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    /// Any other ERROR frame with a plain-text body.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A header key was inserted twice into an outbound frame.
    #[error("duplicate STOMP header `{0}`")]
    DuplicateHeader(String),
}

impl StompError {
    /// Whether the session can recover by re-authenticating.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

// =============================================================================
// HEADERS
// =============================================================================

/// Ordered, case-sensitive header map without duplicate keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StompError::DuplicateHeader`] if `key` is already present.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), StompError> {
        let key = key.into();
        if self.get(&key).is_some() {
            return Err(StompError::DuplicateHeader(key));
        }
        self.0.push((key, value.into()));
        Ok(())
    }

    /// Builder form of [`Headers::insert`] for keys known to be distinct.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        if self.get(key).is_none() {
            self.0.push((key.to_owned(), value.into()));
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// FRAMES
// =============================================================================

/// Body of an inbound frame after the JSON attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Json(Value),
    Raw(String),
}

impl Body {
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}

/// A decoded STOMP frame.
#[derive(Clone, Debug, PartialEq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Headers,
    pub body: String,
    pub decoded_body: Body,
}

impl StompFrame {
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }
}

/// Serialize a frame to its wire text, NUL terminator included.
#[must_use]
pub fn encode(command: &str, headers: &Headers, body: &str) -> String {
    let mut out = String::with_capacity(command.len() + body.len() + 64);
    out.push_str(command);
    out.push('\n');
    for (key, value) in headers.iter() {
        out.push_str(key);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(body);
    out.push('\0');
    out
}

/// Build a CONNECT frame.
///
/// Mandatory headers come first (`login`, `passcode`, `host`,
/// `accept-version`, `heart-beat`), followed by `extra_headers` in order.
///
/// # Errors
///
/// Returns [`StompError::DuplicateHeader`] if an extra header collides with a
/// mandatory one or repeats a key.
pub fn connect_frame(
    login: &str,
    passcode: &str,
    extra_headers: &[(&str, &str)],
) -> Result<String, StompError> {
    let mut headers = Headers::new()
        .with("login", login)
        .with("passcode", passcode)
        .with("host", "/")
        .with("accept-version", "1.1,1.0")
        .with("heart-beat", "0,0");
    for (key, value) in extra_headers {
        headers.insert(*key, *value)?;
    }
    Ok(encode("CONNECT", &headers, ""))
}

/// Build a SUBSCRIBE frame for `destination`.
#[must_use]
pub fn subscribe_frame(destination: &str) -> String {
    let headers = Headers::new()
        .with("id", SUBSCRIPTION_ID)
        .with("destination", destination);
    encode("SUBSCRIBE", &headers, "")
}

/// Build a SEND frame.
#[must_use]
pub fn send_frame(headers: &Headers, body: &str) -> String {
    encode("SEND", headers, body)
}

/// Decode inbound frame text.
///
/// # Errors
///
/// - [`StompError::Malformed`] when the text has no command line or no blank
///   line separating headers from body.
/// - [`StompError::AccessDenied`] when a non-JSON body mentions
///   `Access refused`.
/// - [`StompError::ExchangeNotFound`] / [`StompError::Protocol`] for other
///   plain-text ERROR bodies.
pub fn decode(raw: &str) -> Result<StompFrame, StompError> {
    let trimmed = match raw.trim_end_matches(['\n', '\r']).strip_suffix('\0') {
        Some(frame) => frame,
        None => raw,
    };

    let Some((command, rest)) = trimmed.split_once('\n') else {
        return Err(StompError::Malformed(raw.to_owned()));
    };
    let command = command.trim_end_matches('\r');
    if command.is_empty() || !command.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(StompError::Malformed(raw.to_owned()));
    }

    let (header_block, body) = match rest.split_once("\n\n") {
        Some(parts) => parts,
        None => match rest.strip_prefix('\n') {
            Some(body) => ("", body),
            None => return Err(StompError::Malformed(raw.to_owned())),
        },
    };

    let headers = parse_headers(header_block);
    let decoded_body = decode_body(command, body)?;

    Ok(StompFrame {
        command: command.to_owned(),
        headers,
        body: body.to_owned(),
        decoded_body,
    })
}

fn parse_headers(block: &str) -> Headers {
    let mut headers = Headers::new();
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // First occurrence wins for repeated inbound keys.
        headers = headers.with(key, value.trim_end_matches('\r'));
    }
    headers
}

fn decode_body(command: &str, body: &str) -> Result<Body, StompError> {
    if body.is_empty() {
        return Ok(Body::Raw(String::new()));
    }
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(Body::Json(value));
    }

    let text = body.trim().to_owned();
    if body.contains(ACCESS_REFUSED) {
        return Err(StompError::AccessDenied(text));
    }
    if command == "ERROR" {
        if NOT_FOUND_MARKERS.iter().any(|marker| body.contains(marker)) {
            return Err(StompError::ExchangeNotFound(text));
        }
        return Err(StompError::Protocol(text));
    }
    Ok(Body::Raw(body.to_owned()))
}

#[cfg(test)]
#[path = "stomp_test.rs"]
mod tests;

//! Transports — move envelope frames between the session and the server.
//!
//! DESIGN
//! ======
//! [`Transport`] is a closed enum over the two ways of reaching the envelope
//! endpoint:
//!
//! - [`DuplexTransport`]: one long-lived websocket, read and written from a
//!   single `select!` loop.
//! - [`PollingTransport`]: XHR. Receives by issuing repeated requests (or one
//!   streamed response) and sends through independent POSTs.
//!
//! Both feed raw chunks through the same [`reader::FrameReader`], which owns
//! the pending buffer and invokes the [`TransportHandler`] once per logical
//! frame, strictly in arrival order.
//!
//! Outbound traffic never touches the I/O directly. [`TransportHandle`] pushes
//! onto an unbounded queue drained by the delivery loop (duplex) or by a
//! dedicated sender task (polling), so handlers may send from inside a
//! callback and foreign tasks may send concurrently.
//!
//! LIFECYCLE
//! =========
//! 1. `Transport::new` resolves the [`ConnectionDescriptor`]
//! 2. `connect()` performs the physical handshake
//! 3. `start(&mut handler)` runs the delivery loop until close
//! 4. `close()` (idempotent) asks the loop to stop; `on_close` fires once

mod descriptor;
mod duplex;
mod polling;
pub(crate) mod reader;

#[cfg(test)]
pub(crate) mod test_server;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use frames::CloseReason;
use frames::envelope;
use tokio::sync::mpsc;

pub use descriptor::ConnectionDescriptor;
pub use duplex::DuplexTransport;
pub use polling::PollingTransport;

/// Close code reported when the client itself requested the close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("unknown transport `{0}` (expected websocket, xhr or xhr_streaming)")]
    UnknownKind(String),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport delivery loop already started")]
    AlreadyStarted,
    #[error("transport is closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(error))
    }
}

// =============================================================================
// KIND
// =============================================================================

/// Transport selected at construction time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Websocket,
    XhrPolling,
    XhrStreaming,
}

impl TransportKind {
    /// Path segment of the receive endpoint.
    #[must_use]
    pub fn transport_id(self) -> &'static str {
        match self {
            Self::Websocket => "websocket",
            Self::XhrPolling => "xhr",
            Self::XhrStreaming => "xhr_streaming",
        }
    }

    /// Path segment of the send endpoint, for transports that have one.
    #[must_use]
    pub fn send_id(self) -> Option<&'static str> {
        match self {
            Self::Websocket => None,
            Self::XhrPolling | Self::XhrStreaming => Some("xhr_send"),
        }
    }

    #[must_use]
    pub fn is_duplex(self) -> bool {
        matches!(self, Self::Websocket)
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "websocket" => Ok(Self::Websocket),
            "xhr" => Ok(Self::XhrPolling),
            "xhr_streaming" => Ok(Self::XhrStreaming),
            other => Err(TransportError::UnknownKind(other.to_owned())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.transport_id())
    }
}

// =============================================================================
// HANDLER
// =============================================================================

/// Callbacks invoked by the delivery loop, one per logical envelope frame.
///
/// Every method defaults to a no-op, so an implementation only binds the
/// events it cares about. Calls are sequential and never overlap.
pub trait TransportHandler {
    fn on_open(&mut self) {}

    fn on_heartbeat(&mut self) {}

    fn on_message(&mut self, _payload: &str) {}

    fn on_close(&mut self, _reason: &CloseReason) {}
}

// =============================================================================
// HANDLE
// =============================================================================

/// Work queued for the I/O side of a transport.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outbound {
    /// An already wrapped envelope frame.
    Frame(String),
    Close,
}

/// Cloneable sending side of a transport.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    closing: Arc<AtomicBool>,
}

impl TransportHandle {
    pub(crate) fn pair() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// Wrap a sub-protocol frame in the array envelope and queue it.
    ///
    /// Returns the wrapped text as it will appear on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once [`close`](Self::close) has been
    /// called or the delivery loop has gone away.
    pub fn send(&self, message: &str) -> Result<String, TransportError> {
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        let wrapped = envelope::wrap(message);
        self.tx
            .send(Outbound::Frame(wrapped.clone()))
            .map_err(|_| TransportError::Closed)?;
        Ok(wrapped)
    }

    /// Request termination. Idempotent.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            // A dropped receiver means the loop already ended.
            let _ = self.tx.send(Outbound::Close);
        }
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn closing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closing)
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// A transport of either variant.
#[derive(Debug)]
pub enum Transport {
    Duplex(DuplexTransport),
    Polling(PollingTransport),
}

impl Transport {
    /// Resolve the connection descriptor for `server_url` and build the
    /// variant matching `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the URL cannot be parsed.
    pub fn new(kind: TransportKind, server_url: &str, prefix: &str) -> Result<Self, TransportError> {
        let descriptor = ConnectionDescriptor::new(kind, server_url, prefix)?;
        Ok(Self::from_descriptor(descriptor))
    }

    #[must_use]
    pub fn from_descriptor(descriptor: ConnectionDescriptor) -> Self {
        match descriptor.kind() {
            TransportKind::Websocket => Self::Duplex(DuplexTransport::new(descriptor)),
            TransportKind::XhrPolling | TransportKind::XhrStreaming => {
                Self::Polling(PollingTransport::new(descriptor))
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.descriptor().kind()
    }

    #[must_use]
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        match self {
            Self::Duplex(t) => t.descriptor(),
            Self::Polling(t) => t.descriptor(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> TransportHandle {
        match self {
            Self::Duplex(t) => t.handle(),
            Self::Polling(t) => t.handle(),
        }
    }

    /// Perform the physical handshake.
    ///
    /// # Errors
    ///
    /// Returns the websocket or HTTP error that prevented the handshake.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Duplex(t) => t.connect().await,
            Self::Polling(t) => t.connect().await,
        }
    }

    /// Run the delivery loop until the session closes.
    ///
    /// I/O faults inside the loop are reported through
    /// [`TransportHandler::on_close`], not returned.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] before `connect()` and
    /// [`TransportError::AlreadyStarted`] on a second call.
    pub async fn start<H: TransportHandler + Send>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), TransportError> {
        match self {
            Self::Duplex(t) => t.start(handler).await,
            Self::Polling(t) => t.start(handler).await,
        }
    }

    /// Wrap and queue a sub-protocol frame.
    ///
    /// # Errors
    ///
    /// See [`TransportHandle::send`].
    pub fn send(&self, message: &str) -> Result<String, TransportError> {
        self.handle().send(message)
    }

    /// Request termination. Idempotent.
    pub fn close(&self) {
        self.handle().close();
    }

    /// Replace the connection with a fresh one: new session ids, new outbound
    /// queue, empty pending buffer. Outstanding handles stop working.
    pub fn renew(&mut self) {
        let descriptor = self.descriptor().renew();
        *self = Self::from_descriptor(descriptor);
    }

    /// Fetch the envelope endpoint's `/info` document.
    ///
    /// # Errors
    ///
    /// Returns HTTP and JSON decoding failures.
    pub async fn server_info(&self) -> Result<serde_json::Value, TransportError> {
        let url = format!("{}/info", self.descriptor().http_base_url());
        let response = reqwest::get(url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

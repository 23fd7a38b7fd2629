//! utalk realtime client.
//!
//! ARCHITECTURE
//! ============
//! Layers, leaves first:
//!
//! 1. `frames` crate: envelope and STOMP codecs (pure functions).
//! 2. [`transport`]: owns the raw I/O. Either a persistent websocket
//!    ([`transport::DuplexTransport`]) or repeated XHR requests
//!    ([`transport::PollingTransport`]), behind the closed [`Transport`] enum.
//! 3. [`session`]: the connect → authenticate → subscribe → exchange state
//!    machine, driven by transport callbacks.
//! 4. [`client`]: resolves server metadata and a token through an
//!    [`auth::Authenticator`], then builds sessions.
//!
//! Observers hook into session lifecycle through [`events::EventHandlers`].

pub mod auth;
pub mod client;
pub mod events;
pub mod payload;
pub mod session;
pub mod transport;

pub use auth::{AuthError, Authenticator, HttpAuthenticator, ServerInfo};
pub use client::{Client, ClientConfig, ClientError, Credentials};
pub use events::{ChannelMessage, EventHandlers, EventKind, SessionEvent};
pub use frames::CloseReason;
pub use payload::{ChatEvent, JsonPayloadCodec, PayloadCodec, PayloadError};
pub use session::{Session, SessionConfig, SessionError, SessionHandle, SessionState};
pub use transport::{Transport, TransportError, TransportHandle, TransportHandler, TransportKind};

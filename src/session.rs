//! Session — the STOMP conversation on top of one transport.
//!
//! DESIGN
//! ======
//! The state machine lives in `SessionCore`, which is the transport's
//! [`TransportHandler`]. Every transition therefore happens on the single
//! delivery path, one frame at a time, with no locking. Everything that needs
//! to act from elsewhere (event callbacks, other tasks) goes through a
//! cloneable [`SessionHandle`], which can only queue frames or request close.
//!
//! LIFECYCLE
//! =========
//! ```text
//! Idle --connect()--> Connecting
//! Connecting --open--> AwaitingAck                [send CONNECT]
//! AwaitingAck --CONNECTED--> Subscribed           [send SUBSCRIBE]
//! AwaitingAck --ERROR access refused--> AwaitingAck  [resend CONNECT]
//! AwaitingAck --any other ERROR--> Closing        [close]
//! Subscribed --MESSAGE--> Subscribed              [dispatch by action/object]
//! Subscribed --ERROR--> Subscribed                [log]
//! any --close--> Closed
//! any --disconnect()--> Closing --> Closed
//! ```

use std::fmt;
use std::sync::Arc;

use frames::stomp::{self, Headers, StompError, StompFrame};
use frames::CloseReason;
use tracing::{debug, error, info, warn};

use crate::events::{ChannelMessage, EventHandlers, SessionEvent};
use crate::payload::{
    ACTION_ACK, ACTION_ADD, ChatEvent, JsonPayloadCodec, OBJECT_CONVERSATION, OBJECT_MESSAGE,
    PayloadCodec, PayloadError,
};
use crate::transport::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, Transport, TransportError, TransportHandle, TransportHandler,
};

/// `source` stamped on outbound events unless configured otherwise.
pub const DEFAULT_SOURCE: &str = "utalk";

/// Platform announced in the CONNECT frame.
const PLATFORM: &str = "Rust";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Stomp(#[from] StompError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("operation not allowed while session is {0}")]
    InvalidState(SessionState),
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Identity used for routing (`/exchange/<username>.…`).
    pub username: String,
    /// STOMP login, `<domain>:<username>` when a domain is known.
    pub login: String,
    /// OAuth token sent as the STOMP passcode.
    pub token: String,
    pub domain: Option<String>,
    pub source: String,
    /// Maximum CONNECT retries after "access refused". `None` retries forever.
    pub auth_retry_limit: Option<u32>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            login: username.clone(),
            username,
            token: token.into(),
            domain: None,
            source: DEFAULT_SOURCE.to_owned(),
            auth_retry_limit: None,
        }
    }

    /// Set the server domain; the login becomes `<domain>:<username>`.
    #[must_use]
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.login = match &domain {
            Some(domain) => format!("{domain}:{}", self.username),
            None => self.username.clone(),
        };
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn with_auth_retry_limit(mut self, limit: u32) -> Self {
        self.auth_retry_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    AwaitingAck,
    Subscribed,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingAck => "awaiting_ack",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// ROUTING
// =============================================================================

#[must_use]
pub fn subscribe_destination(username: &str) -> String {
    format!("/exchange/{username}.subscribe")
}

#[must_use]
pub fn publish_destination(username: &str, channel: &str) -> String {
    format!("/exchange/{username}.publish/{channel}.messages")
}

/// Channel id of an inbound destination such as `/exchange/abc123.messages`.
///
/// The id is the hex run right before `.messages` or `.notifications`.
#[must_use]
pub fn channel_from_destination(destination: &str) -> Option<&str> {
    let (head, suffix) = destination.rsplit_once('.')?;
    if suffix != "messages" && suffix != "notifications" {
        return None;
    }
    let start = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        .last()
        .map(|(at, _)| at)?;
    Some(&head[start..])
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable access to a running session: publish and disconnect.
#[derive(Clone)]
pub struct SessionHandle {
    config: Arc<SessionConfig>,
    transport: TransportHandle,
    codec: Arc<dyn PayloadCodec>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("username", &self.config.username)
            .field("closing", &self.transport.is_closing())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        transport: TransportHandle,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        Self {
            config,
            transport,
            codec,
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.config.username
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Publish `text` to `channel` and return the event that was sent.
    ///
    /// Only meaningful once the session is subscribed; frames queued earlier
    /// reach the broker before its CONNECTED reply and are rejected there.
    ///
    /// # Errors
    ///
    /// Returns payload encoding failures and [`TransportError::Closed`].
    pub fn send_message(&self, channel: &str, text: &str) -> Result<ChatEvent, SessionError> {
        let config = &self.config;
        let event = ChatEvent::message(&config.username, text, &config.source, config.domain.as_deref());
        let body = self.codec.encode(&event)?;
        let headers =
            Headers::new().with("destination", publish_destination(&config.username, channel));
        self.transport.send(&stomp::send_frame(&headers, &body))?;
        debug!(user = %config.username, %channel, "message sent");
        Ok(event)
    }

    /// Request an orderly close. Idempotent.
    pub fn disconnect(&self) {
        self.transport.close();
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.transport.is_closing()
    }
}

// =============================================================================
// CORE
// =============================================================================

/// State machine driven by transport callbacks.
struct SessionCore {
    state: SessionState,
    handle: SessionHandle,
    events: EventHandlers,
    auth_retries: u32,
}

impl SessionCore {
    fn new(handle: SessionHandle, events: EventHandlers) -> Self {
        Self {
            state: SessionState::Idle,
            handle,
            events,
            auth_retries: 0,
        }
    }

    fn trigger(&mut self, event: &SessionEvent) {
        self.events.trigger(&self.handle, event);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(user = %self.handle.username(), from = %self.state, to = %next, "session state");
            self.state = next;
        }
    }

    /// Track a close requested from outside the delivery path.
    fn sync_closing(&mut self) {
        if self.handle.is_closing() && self.state != SessionState::Closed {
            self.transition(SessionState::Closing);
        }
    }

    fn send_connect(&mut self) {
        let config = self.handle.config();
        let extra = [
            ("product-version", env!("CARGO_PKG_VERSION")),
            ("platform", PLATFORM),
        ];
        let sent = stomp::connect_frame(&config.login, &config.token, &extra)
            .map_err(SessionError::from)
            .and_then(|frame| self.handle.transport.send(&frame).map_err(SessionError::from));
        match sent {
            Ok(_) => info!(user = %config.username, login = %config.login, "started stomp session"),
            Err(e) => {
                error!(error = %e, "CONNECT not sent");
                self.teardown();
            }
        }
    }

    fn send_subscribe(&mut self) {
        let destination = subscribe_destination(self.handle.username());
        match self.handle.transport.send(&stomp::subscribe_frame(&destination)) {
            Ok(_) => info!(%destination, "listening"),
            Err(e) => {
                error!(error = %e, "SUBSCRIBE not sent");
                self.teardown();
            }
        }
    }

    fn teardown(&mut self) {
        self.transition(SessionState::Closing);
        self.handle.disconnect();
    }

    fn disconnect(&mut self) {
        match self.state {
            SessionState::Idle => self.transition(SessionState::Closed),
            SessionState::Closed => {}
            _ => self.teardown(),
        }
    }

    fn handle_frame(&mut self, frame: &StompFrame) {
        match (self.state, frame.command.as_str()) {
            (SessionState::AwaitingAck, "CONNECTED") => {
                self.auth_retries = 0;
                self.send_subscribe();
                if self.state == SessionState::Closing {
                    return;
                }
                self.transition(SessionState::Subscribed);
                self.trigger(&SessionEvent::Connected);
                self.trigger(&SessionEvent::StartListening);
            }
            (SessionState::Subscribed, "MESSAGE") => self.dispatch_message(frame),
            (SessionState::AwaitingAck, "ERROR") => {
                error!(message = ?frame.header("message"), body = %frame.body, "broker rejected session");
                self.teardown();
            }
            (SessionState::Subscribed, "ERROR") => {
                warn!(message = ?frame.header("message"), body = %frame.body, "broker error");
            }
            (state, command) => {
                warn!(%state, %command, "unexpected frame ignored");
            }
        }
    }

    fn handle_error(&mut self, err: &StompError) {
        match (self.state, err) {
            (SessionState::AwaitingAck, StompError::AccessDenied(_)) => {
                self.auth_retries += 1;
                if self
                    .handle
                    .config()
                    .auth_retry_limit
                    .is_some_and(|limit| self.auth_retries > limit)
                {
                    error!(error = %err, retries = self.auth_retries - 1, "giving up on authentication");
                    self.teardown();
                    return;
                }
                warn!(error = %err, attempt = self.auth_retries, "re-authenticating");
                self.send_connect();
            }
            (SessionState::AwaitingAck, _) => {
                error!(error = %err, "fatal broker error");
                self.teardown();
            }
            (state, _) => warn!(%state, error = %err, "broker error"),
        }
    }

    fn dispatch_message(&mut self, frame: &StompFrame) {
        let Some(channel) = frame.header("destination").and_then(channel_from_destination) else {
            warn!(destination = ?frame.header("destination"), "message without channel ignored");
            return;
        };
        let channel = channel.to_owned();
        let event = match self.handle.codec.decode(&frame.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, %channel, "undecodable message ignored");
                return;
            }
        };

        let message = ChannelMessage { channel, event };
        let user = message.event.username().unwrap_or_default();
        if message.event.is(ACTION_ADD, OBJECT_MESSAGE) {
            debug!(%user, channel = %message.channel, text = ?message.event.text(), "message received");
            self.trigger(&SessionEvent::MessageReceived(message));
        } else if message.event.is(ACTION_ACK, OBJECT_MESSAGE) {
            debug!(channel = %message.channel, uuid = ?message.event.uuid, "message acknowledged");
            self.trigger(&SessionEvent::MessageAckd(message));
        } else if message.event.is(ACTION_ADD, OBJECT_CONVERSATION) {
            info!(%user, channel = %message.channel, "conversation started");
            self.trigger(&SessionEvent::ConversationStarted(message));
        } else {
            info!(
                action = %message.event.action,
                object = %message.event.object,
                channel = %message.channel,
                "unhandled event"
            );
        }
    }
}

impl TransportHandler for SessionCore {
    fn on_open(&mut self) {
        self.sync_closing();
        if self.state != SessionState::Connecting {
            warn!(state = %self.state, "open ignored");
            return;
        }
        self.transition(SessionState::AwaitingAck);
        self.send_connect();
    }

    fn on_heartbeat(&mut self) {
        tracing::trace!(user = %self.handle.username(), "heartbeat");
    }

    fn on_message(&mut self, payload: &str) {
        self.sync_closing();
        if self.state == SessionState::Closing {
            return;
        }
        match stomp::decode(payload) {
            Ok(frame) => self.handle_frame(&frame),
            Err(e) => self.handle_error(&e),
        }
    }

    fn on_close(&mut self, reason: &CloseReason) {
        self.transition(SessionState::Closed);
        if reason.code == CLOSE_NORMAL {
            info!(user = %self.handle.username(), %reason, "disconnected");
        } else {
            warn!(user = %self.handle.username(), %reason, "disconnected");
        }
        self.trigger(&SessionEvent::Disconnect(reason.clone()));
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// A session bound to one transport.
pub struct Session {
    transport: Transport,
    core: SessionCore,
    config: Arc<SessionConfig>,
    codec: Arc<dyn PayloadCodec>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.core.state)
            .field("transport", &self.transport)
            .field("events", &self.core.events)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(config: SessionConfig, transport: Transport, events: EventHandlers) -> Self {
        Self::with_codec(config, transport, events, Arc::new(JsonPayloadCodec))
    }

    #[must_use]
    pub fn with_codec(
        config: SessionConfig,
        transport: Transport,
        events: EventHandlers,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        let config = Arc::new(config);
        let handle = SessionHandle::new(Arc::clone(&config), transport.handle(), Arc::clone(&codec));
        Self {
            transport,
            core: SessionCore::new(handle, events),
            config,
            codec,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.core.handle.clone()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Open the physical connection.
    ///
    /// A failed handshake closes the session with a 1006 reason, firing
    /// `disconnect`, and is also returned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless the session is idle, or
    /// the transport's handshake error.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.core.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.core.state));
        }
        self.core.transition(SessionState::Connecting);
        self.core.trigger(&SessionEvent::Connecting);

        if let Err(e) = self.transport.connect().await {
            self.core.on_close(&CloseReason::new(CLOSE_ABNORMAL, e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Run the delivery loop until the session closes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] before [`connect`](Self::connect).
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.transport.start(&mut self.core).await?;
        Ok(())
    }

    /// Publish `text` to `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless subscribed.
    pub fn send_message(&self, channel: &str, text: &str) -> Result<ChatEvent, SessionError> {
        if self.core.state != SessionState::Subscribed {
            return Err(SessionError::InvalidState(self.core.state));
        }
        self.core.handle.send_message(channel, text)
    }

    /// Request an orderly close. Idempotent.
    pub fn disconnect(&mut self) {
        self.core.disconnect();
    }

    /// Prepare a closed session for another `connect()` with fresh session
    /// ids. Callbacks are kept; previously issued handles stop working.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] while a connection is active.
    pub fn renew(&mut self) -> Result<(), SessionError> {
        if !matches!(self.core.state, SessionState::Idle | SessionState::Closed) {
            return Err(SessionError::InvalidState(self.core.state));
        }
        self.transport.renew();
        self.core.handle = SessionHandle::new(
            Arc::clone(&self.config),
            self.transport.handle(),
            Arc::clone(&self.codec),
        );
        self.core.state = SessionState::Idle;
        self.core.auth_retries = 0;
        Ok(())
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

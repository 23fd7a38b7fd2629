//! Session lifecycle events and the callback table that observes them.
//!
//! A session fires events from its delivery loop; each [`EventKind`] has at
//! most one callback. Unbound kinds are a no-op, which is how a bare session
//! runs standalone while a driver (CLI, load test) hooks only what it needs.

use std::collections::HashMap;
use std::fmt;

use frames::CloseReason;

use crate::payload::ChatEvent;
use crate::session::SessionHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    StartListening,
    MessageReceived,
    MessageAckd,
    ConversationStarted,
    Disconnect,
}

impl EventKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::StartListening => "start_listening",
            Self::MessageReceived => "message_received",
            Self::MessageAckd => "message_ackd",
            Self::ConversationStarted => "conversation_started",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A chat event together with the channel it was routed through.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    pub event: ChatEvent,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Connecting,
    Connected,
    StartListening,
    MessageReceived(ChannelMessage),
    MessageAckd(ChannelMessage),
    ConversationStarted(ChannelMessage),
    Disconnect(CloseReason),
}

impl SessionEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connecting => EventKind::Connecting,
            Self::Connected => EventKind::Connected,
            Self::StartListening => EventKind::StartListening,
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::MessageAckd(_) => EventKind::MessageAckd,
            Self::ConversationStarted(_) => EventKind::ConversationStarted,
            Self::Disconnect(_) => EventKind::Disconnect,
        }
    }

    /// The routed chat event, for the message-carrying kinds.
    #[must_use]
    pub fn message(&self) -> Option<&ChannelMessage> {
        match self {
            Self::MessageReceived(message)
            | Self::MessageAckd(message)
            | Self::ConversationStarted(message) => Some(message),
            _ => None,
        }
    }
}

pub type EventCallback = Box<dyn FnMut(&SessionHandle, &SessionEvent) + Send>;

/// One optional callback per [`EventKind`].
#[derive(Default)]
pub struct EventHandlers {
    callbacks: HashMap<EventKind, EventCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<&str> = self.callbacks.keys().map(|kind| kind.name()).collect();
        bound.sort_unstable();
        f.debug_struct("EventHandlers").field("bound", &bound).finish()
    }
}

impl EventHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `callback` to `kind`, replacing any previous binding.
    #[must_use]
    pub fn on<F>(mut self, kind: EventKind, callback: F) -> Self
    where
        F: FnMut(&SessionHandle, &SessionEvent) + Send + 'static,
    {
        self.callbacks.insert(kind, Box::new(callback));
        self
    }

    #[must_use]
    pub fn is_bound(&self, kind: EventKind) -> bool {
        self.callbacks.contains_key(&kind)
    }

    /// Invoke the callback bound to the event's kind, if any.
    pub fn trigger(&mut self, handle: &SessionHandle, event: &SessionEvent) {
        let kind = event.kind();
        match self.callbacks.get_mut(&kind) {
            Some(callback) => {
                tracing::debug!(event = %kind, "trigger");
                callback(handle, event);
            }
            None => tracing::trace!(event = %kind, "no handler bound"),
        }
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;

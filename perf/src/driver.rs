//! Per-user load driver.
//!
//! Each driver owns one session. Once the session is listening and every
//! other driver has reached the same point (shared barrier), it publishes its
//! messages to the conversation. It counts what comes back and disconnects as
//! soon as the expected totals are reached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Barrier, Notify};
use tracing::{info, warn};
use utalk::{Client, EventHandlers, EventKind, SessionHandle};

use crate::PerfError;

/// What one user sends and expects back.
///
/// The broker delivers every conversation message to every member, the
/// sender included, so both totals cover the whole conversation by default.
/// Set the fields directly for brokers that fan out differently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverPlan {
    pub conversation: String,
    /// Messages this user publishes.
    pub send: usize,
    /// `message_received` events expected.
    pub expect_received: usize,
    /// `message_ackd` events expected.
    pub expect_ackd: usize,
}

impl DriverPlan {
    /// Plan for a user sending `send` messages while the other members send
    /// `expect` between them.
    #[must_use]
    pub fn new(conversation: impl Into<String>, send: usize, expect: usize) -> Self {
        Self {
            conversation: conversation.into(),
            send,
            expect_received: send + expect,
            expect_ackd: send + expect,
        }
    }

    /// Plan for one of `members` users each sending `per_user` messages.
    #[must_use]
    pub fn for_group(conversation: impl Into<String>, per_user: usize, members: usize) -> Self {
        Self::new(conversation, per_user, per_user * members.saturating_sub(1))
    }
}

/// Outcome of one driver run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DriverReport {
    pub username: String,
    pub sent: usize,
    pub received: usize,
    pub ackd: usize,
    /// Send → own acknowledgement, one per acknowledged message.
    pub latencies: Vec<Duration>,
}

#[derive(Debug)]
pub(crate) struct DriverState {
    plan: DriverPlan,
    in_flight: HashMap<String, Instant>,
    report: DriverReport,
}

impl DriverState {
    pub(crate) fn new(username: &str, plan: DriverPlan) -> Self {
        Self {
            plan,
            in_flight: HashMap::new(),
            report: DriverReport {
                username: username.to_owned(),
                ..DriverReport::default()
            },
        }
    }

    pub(crate) fn message_text(&self, index: usize) -> String {
        format!("This is Message {index} from {}", self.report.username)
    }

    pub(crate) fn mark_sending(&mut self, text: &str) {
        self.in_flight.insert(text.to_owned(), Instant::now());
    }

    pub(crate) fn mark_sent(&mut self) {
        self.report.sent += 1;
    }

    pub(crate) fn on_received(&mut self) {
        self.report.received += 1;
    }

    pub(crate) fn on_ackd(&mut self, text: Option<&str>) {
        self.report.ackd += 1;
        if let Some(started) = text.and_then(|t| self.in_flight.remove(t)) {
            self.report.latencies.push(started.elapsed());
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.report.sent >= self.plan.send
            && self.report.received >= self.plan.expect_received
            && self.report.ackd >= self.plan.expect_ackd
    }

    pub(crate) fn succeeded(&self) -> bool {
        self.report.sent == self.plan.send
            && self.report.received == self.plan.expect_received
            && self.report.ackd == self.plan.expect_ackd
    }
}

type Shared = Arc<Mutex<DriverState>>;

fn lock(state: &Shared) -> MutexGuard<'_, DriverState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn disconnect_if_finished(state: &Shared, handle: &SessionHandle) {
    if lock(state).finished() {
        handle.disconnect();
    }
}

/// Callbacks that feed `state` and wake `listening` once subscribed.
pub(crate) fn driver_events(state: &Shared, listening: &Arc<Notify>) -> EventHandlers {
    let received = Arc::clone(state);
    let ackd = Arc::clone(state);
    let listening = Arc::clone(listening);
    EventHandlers::new()
        .on(EventKind::StartListening, move |_, _| listening.notify_one())
        .on(EventKind::MessageReceived, move |handle, _| {
            lock(&received).on_received();
            disconnect_if_finished(&received, handle);
        })
        .on(EventKind::MessageAckd, move |handle, event| {
            lock(&ackd).on_ackd(event.message().and_then(|m| m.event.text()));
            disconnect_if_finished(&ackd, handle);
        })
}

async fn publish(state: Shared, handle: SessionHandle, listening: Arc<Notify>, ready: Arc<Barrier>) {
    listening.notified().await;
    ready.wait().await;

    let (conversation, count) = {
        let state = lock(&state);
        (state.plan.conversation.clone(), state.plan.send)
    };
    info!(user = %handle.username(), count, "start sending");
    for index in 0..count {
        let text = {
            let mut state = lock(&state);
            let text = state.message_text(index);
            state.mark_sending(&text);
            text
        };
        if let Err(e) = handle.send_message(&conversation, &text) {
            warn!(user = %handle.username(), error = %e, "send failed");
            return;
        }
        lock(&state).mark_sent();
        tokio::task::yield_now().await;
    }
    disconnect_if_finished(&state, &handle);
}

/// Run one user's session to completion.
///
/// `ready` must be shared by every driver of the run.
///
/// # Errors
///
/// Returns [`PerfError::Timeout`] if the totals are not reached within
/// `timeout`, [`PerfError::Incomplete`] if the session closed early, or the
/// session's connect error.
pub async fn run_driver(
    client: &Client,
    plan: DriverPlan,
    ready: Arc<Barrier>,
    timeout: Duration,
) -> Result<DriverReport, PerfError> {
    let state: Shared = Arc::new(Mutex::new(DriverState::new(
        &client.session_config().username,
        plan,
    )));
    let listening = Arc::new(Notify::new());
    let mut session = client.session(driver_events(&state, &listening))?;
    let sender = tokio::spawn(publish(
        Arc::clone(&state),
        session.handle(),
        listening,
        ready,
    ));

    let outcome = tokio::time::timeout(timeout, async {
        session.connect().await?;
        session.run().await
    })
    .await;
    sender.abort();

    match outcome {
        Err(_) => Err(PerfError::Timeout),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(())) => {
            let state = lock(&state);
            if state.succeeded() {
                Ok(state.report.clone())
            } else {
                Err(PerfError::Incomplete(Box::new(state.report.clone())))
            }
        }
    }
}

#[cfg(test)]
#[path = "driver_test.rs"]
mod tests;

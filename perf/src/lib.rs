//! Load-test harness for utalk conversations.
//!
//! This crate targets live-server benchmarking from the outside: it logs a
//! group of users in, opens one real session per user, has every user publish
//! to a shared conversation at the same moment, and reports delivery counts
//! plus send → acknowledgement latency.

mod driver;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tracing::{info, warn};
use utalk::{Client, ClientConfig, ClientError, Credentials, SessionError, TransportKind};

pub use driver::{DriverPlan, DriverReport, run_driver};

/// Runtime configuration for perf tests, loaded from environment variables.
#[derive(Clone, Debug)]
pub struct PerfConfig {
    /// Server URL (e.g. `"https://max.example.com/demo"`).
    pub server: String,
    /// `(username, password)` pairs; every user joins the conversation.
    pub users: Vec<(String, String)>,
    /// Conversation id the users publish to.
    pub conversation: Option<String>,
    /// Messages each user publishes.
    pub messages_per_user: usize,
    pub transport: TransportKind,
    /// Upper bound for one driver, connect to last acknowledgement.
    pub timeout: Duration,
}

impl PerfConfig {
    /// Load perf config from environment with sane defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let server =
            std::env::var("PERF_SERVER").unwrap_or_else(|_| "http://127.0.0.1:8081".to_owned());
        let users = std::env::var("PERF_USERS")
            .map(|raw| parse_users(&raw))
            .unwrap_or_default();
        let conversation = std::env::var("PERF_CONVERSATION")
            .ok()
            .filter(|s| !s.is_empty());
        let messages_per_user = env_usize("PERF_MESSAGES", 10);
        let transport = std::env::var("PERF_TRANSPORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let timeout = Duration::from_secs(env_u64("PERF_TIMEOUT_SECS", 60));

        Self {
            server,
            users,
            conversation,
            messages_per_user,
            transport,
            timeout,
        }
    }
}

/// Error type for perf harness operations.
#[derive(Debug, thiserror::Error)]
pub enum PerfError {
    /// `PERF_USERS` is empty or malformed.
    #[error("missing users: set PERF_USERS to `user:password,...`")]
    MissingUsers,
    /// `PERF_CONVERSATION` was not provided.
    #[error("missing conversation: set PERF_CONVERSATION")]
    MissingConversation,
    /// Logging in or building a session failed.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The session could not connect.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The expected totals were not reached before the deadline.
    #[error("timed out waiting for messages")]
    Timeout,
    /// The session closed before the expected totals were reached.
    #[error(
        "{} closed early: sent {} received {} ackd {}",
        .0.username, .0.sent, .0.received, .0.ackd
    )]
    Incomplete(Box<DriverReport>),
    /// A driver task panicked or was cancelled.
    #[error("driver task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Aggregated latency metrics in milliseconds.
#[derive(Clone, Debug)]
pub struct LatencyMetrics {
    /// Total number of operations measured.
    pub count: usize,
    /// Minimum observed latency in milliseconds.
    pub min_ms: f64,
    /// Maximum observed latency in milliseconds.
    pub max_ms: f64,
    /// Arithmetic mean latency in milliseconds.
    pub avg_ms: f64,
    /// Median (50th percentile) latency in milliseconds.
    pub p50_ms: f64,
    /// 95th percentile latency in milliseconds.
    pub p95_ms: f64,
    /// 99th percentile latency in milliseconds.
    pub p99_ms: f64,
}

impl LatencyMetrics {
    /// Build latency metrics from operation durations.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_durations(durations: &[Duration]) -> Self {
        let mut ms = durations
            .iter()
            .map(|d| d.as_secs_f64() * 1_000.0)
            .collect::<Vec<_>>();
        ms.sort_by(f64::total_cmp);

        let (Some(&min_ms), Some(&max_ms)) = (ms.first(), ms.last()) else {
            return Self {
                count: 0,
                min_ms: 0.0,
                max_ms: 0.0,
                avg_ms: 0.0,
                p50_ms: 0.0,
                p95_ms: 0.0,
                p99_ms: 0.0,
            };
        };

        let count = ms.len();
        Self {
            count,
            min_ms,
            max_ms,
            avg_ms: ms.iter().sum::<f64>() / count as f64,
            p50_ms: percentile(&ms, 0.50),
            p95_ms: percentile(&ms, 0.95),
            p99_ms: percentile(&ms, 0.99),
        }
    }
}

/// Result of a whole load run.
#[derive(Clone, Debug)]
pub struct LoadReport {
    pub drivers: Vec<DriverReport>,
    pub latency: LatencyMetrics,
    /// Wall-clock time from the first login to the last disconnect.
    pub elapsed: Duration,
}

impl LoadReport {
    /// Acknowledged messages per second of wall-clock time.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn messages_per_sec(&self) -> f64 {
        let ackd = self.drivers.iter().map(|d| d.ackd).sum::<usize>();
        ackd as f64 / self.elapsed.as_secs_f64().max(1e-9)
    }
}

/// Log every configured user in, run one driver each, aggregate the results.
///
/// # Errors
///
/// Returns the first login or driver failure. A failed driver aborts the
/// others.
pub async fn run_load_test(config: &PerfConfig) -> Result<LoadReport, PerfError> {
    if config.users.is_empty() {
        return Err(PerfError::MissingUsers);
    }
    let conversation = config
        .conversation
        .clone()
        .ok_or(PerfError::MissingConversation)?;

    let started = std::time::Instant::now();
    let mut clients = Vec::with_capacity(config.users.len());
    for (username, password) in &config.users {
        let client_config = ClientConfig::new(
            config.server.clone(),
            username.clone(),
            Credentials::Password(password.clone()),
        )
        .with_transport(config.transport);
        clients.push(Client::login(client_config).await?);
    }

    let members = clients.len();
    let plan = DriverPlan::for_group(conversation, config.messages_per_user, members);
    let ready = Arc::new(Barrier::new(members));
    let mut tasks = JoinSet::new();
    for (index, client) in clients.into_iter().enumerate() {
        let plan = plan.clone();
        let ready = Arc::clone(&ready);
        let timeout = config.timeout;
        tasks.spawn(async move { (index, run_driver(&client, plan, ready, timeout).await) });
    }
    let drivers = join_drivers(tasks).await?;

    let latencies = drivers
        .iter()
        .flat_map(|d| d.latencies.iter().copied())
        .collect::<Vec<_>>();
    let report = LoadReport {
        latency: LatencyMetrics::from_durations(&latencies),
        drivers,
        elapsed: started.elapsed(),
    };
    info!(
        users = members,
        messages = report.latency.count,
        elapsed_ms = report.elapsed.as_millis(),
        "load test finished"
    );
    Ok(report)
}

/// Collect every driver report in spawn order.
///
/// The first failure aborts the drivers still running, including those
/// parked at the start barrier.
async fn join_drivers(
    mut tasks: JoinSet<(usize, Result<DriverReport, PerfError>)>,
) -> Result<Vec<DriverReport>, PerfError> {
    let mut drivers = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let (index, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                tasks.abort_all();
                return Err(e.into());
            }
        };
        match outcome {
            Ok(report) => drivers.push((index, report)),
            Err(e) => {
                warn!(driver = index, error = %e, remaining = tasks.len(), "driver failed");
                tasks.abort_all();
                return Err(e);
            }
        }
    }
    drivers.sort_by_key(|(index, _)| *index);
    Ok(drivers.into_iter().map(|(_, report)| report).collect())
}

/// Parse `user:password,user:password`. Entries without a colon are skipped.
#[must_use]
pub fn parse_users(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| entry.trim().split_once(':'))
        .filter(|(user, _)| !user.is_empty())
        .map(|(user, password)| (user.to_owned(), password.to_owned()))
        .collect()
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let index = ((sorted_values.len() - 1) as f64 * p).round() as usize;
    sorted_values[index.min(sorted_values.len() - 1)]
}

#[cfg(test)]
#[path = "e2e_perf_test.rs"]
mod tests;

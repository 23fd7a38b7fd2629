use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use utalk::{
    Client, ClientConfig, ClientError, Credentials, EventHandlers, EventKind, SessionEvent,
    SessionHandle, TransportKind,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to read password: {0}")]
    Prompt(#[from] io::Error),
    #[error("empty password for `{0}`")]
    EmptyPassword(String),
}

#[derive(Parser, Debug)]
#[command(name = "utalk", about = "utalk realtime messaging client", version)]
struct Cli {
    /// Server URL, e.g. `https://max.example.com/demo`.
    #[arg(env = "UTALK_SERVER")]
    server: String,

    #[arg(env = "UTALK_USERNAME")]
    username: String,

    #[arg(long, env = "UTALK_PASSWORD", conflicts_with = "token")]
    password: Option<String>,

    /// Use an existing OAuth token instead of a password.
    #[arg(long, env = "UTALK_TOKEN")]
    token: Option<String>,

    /// `websocket`, `xhr` or `xhr_streaming`.
    #[arg(long, env = "UTALK_TRANSPORT", default_value = "websocket")]
    transport: TransportKind,

    #[arg(long, default_value = utalk::client::DEFAULT_PREFIX)]
    prefix: String,

    /// Publish each line read from stdin to this conversation.
    #[arg(long)]
    channel: Option<String>,

    /// Give up after this many refused logins.
    #[arg(long)]
    auth_retry_limit: Option<u32>,

    /// Only log warnings and errors.
    #[arg(long, short)]
    quiet: bool,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicUsize,
    sent: AtomicUsize,
    ackd: AtomicUsize,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let credentials = match (cli.token, cli.password) {
        (Some(token), _) => Credentials::Token(token),
        (None, Some(password)) => Credentials::Password(password),
        (None, None) => Credentials::Password(prompt_password(&cli.username)?),
    };
    let mut config = ClientConfig::new(cli.server, cli.username, credentials)
        .with_transport(cli.transport)
        .with_prefix(cli.prefix);
    if let Some(limit) = cli.auth_retry_limit {
        config = config.with_auth_retry_limit(limit);
    }

    let client = Client::login(config).await?;
    let counters = Arc::new(Counters::default());
    let listening = Arc::new(Notify::new());
    let mut session = client.session(events(&counters, &listening))?;

    let handle = session.handle();
    tokio::spawn(disconnect_on_ctrl_c(handle.clone()));
    if let Some(channel) = cli.channel {
        tokio::spawn(publish_stdin(handle, channel, Arc::clone(&listening), Arc::clone(&counters)));
    }

    session.connect().await.map_err(ClientError::from)?;
    session.run().await.map_err(ClientError::from)?;

    println!(
        "> received {} message(s), sent {} ({} acknowledged)",
        counters.received.load(Ordering::Relaxed),
        counters.sent.load(Ordering::Relaxed),
        counters.ackd.load(Ordering::Relaxed),
    );
    Ok(())
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn prompt_password(username: &str) -> Result<String, CliError> {
    eprint!("> Enter password for user {username}: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_owned();
    if password.is_empty() {
        return Err(CliError::EmptyPassword(username.to_owned()));
    }
    Ok(password)
}

fn events(counters: &Arc<Counters>, listening: &Arc<Notify>) -> EventHandlers {
    let received = Arc::clone(counters);
    let ackd = Arc::clone(counters);
    let listening = Arc::clone(listening);
    EventHandlers::new()
        .on(EventKind::StartListening, move |handle, _| {
            println!("> Listening on {} messages", handle.username());
            listening.notify_one();
        })
        .on(EventKind::MessageReceived, move |_, event| {
            if let Some(message) = event.message() {
                received.received.fetch_add(1, Ordering::Relaxed);
                println!(
                    "> {}@{}: {}",
                    message.event.username().unwrap_or("?"),
                    message.channel,
                    message.event.text().unwrap_or_default()
                );
            }
        })
        .on(EventKind::MessageAckd, move |_, _| {
            ackd.ackd.fetch_add(1, Ordering::Relaxed);
        })
        .on(EventKind::ConversationStarted, |_, event| {
            if let Some(message) = event.message() {
                println!("> Just started a chat on {}", message.channel);
            }
        })
        .on(EventKind::Disconnect, |_, event| {
            if let SessionEvent::Disconnect(reason) = event {
                println!("> Closed connection ({} {})", reason.code, reason.reason);
            }
        })
}

async fn disconnect_on_ctrl_c(handle: SessionHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        handle.disconnect();
    }
}

async fn publish_stdin(
    handle: SessionHandle,
    channel: String,
    listening: Arc<Notify>,
    counters: Arc<Counters>,
) {
    listening.notified().await;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match handle.send_message(&channel, &line) {
            Ok(_) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "message not sent");
                break;
            }
        }
    }
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::events::{EventKind, SessionEvent};
use crate::session::SessionState;
use crate::transport::test_server::{Behavior, GOOD_PASSWORD, TestServer};

/// Authenticator that never touches the network.
struct Fixed {
    calls: Mutex<Vec<String>>,
}

impl Fixed {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl Authenticator for Fixed {
    async fn resolve_server_info(&self, server_url: &str) -> Result<ServerInfo, AuthError> {
        self.calls.lock().expect("calls lock").push(format!("info {server_url}"));
        ServerInfo::from_json(serde_json::json!({ "max.oauth_server": "https://oauth.test" }))
    }

    async fn fetch_token(
        &self,
        oauth_server: &str,
        username: &str,
        password: &str,
    ) -> Result<String, AuthError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(format!("token {oauth_server} {username} {password}"));
        if password == "wrong" {
            return Err(AuthError::Rejected {
                error: "invalid_grant".to_owned(),
                description: "Bad credentials".to_owned(),
            });
        }
        Ok(format!("t-{username}"))
    }
}

#[test]
fn config_defaults() {
    let config = ClientConfig::new("https://max.test/demo", "alice", Credentials::Token("t".into()));
    assert_eq!(config.transport, TransportKind::Websocket);
    assert_eq!(config.prefix, "stomp");
    assert_eq!(config.auth_retry_limit, None);

    let config = config
        .with_transport(TransportKind::XhrStreaming)
        .with_prefix("sockjs")
        .with_auth_retry_limit(3);
    assert_eq!(config.transport, TransportKind::XhrStreaming);
    assert_eq!(config.prefix, "sockjs");
    assert_eq!(config.auth_retry_limit, Some(3));
}

#[test]
fn credentials_debug_hides_secrets() {
    let debug = format!("{:?}", Credentials::Password("hunter2".into()));
    assert!(!debug.contains("hunter2"));
}

#[tokio::test]
async fn password_login_discovers_and_fetches_token() {
    let auth = Fixed::new();
    let config = ClientConfig::new("https://max.test/demo", "alice", Credentials::Password("pw".into()))
        .with_auth_retry_limit(2);
    let client = Client::login_with(config, &auth).await.expect("login");

    assert_eq!(
        *auth.calls.lock().expect("calls lock"),
        vec![
            "info https://max.test/demo".to_owned(),
            "token https://oauth.test alice pw".to_owned(),
        ]
    );
    let session = client.session_config();
    assert_eq!(session.token, "t-alice");
    assert_eq!(session.login, "demo:alice");
    assert_eq!(session.domain.as_deref(), Some("demo"));
    assert_eq!(session.auth_retry_limit, Some(2));
    assert_eq!(
        client.server_info().map(|i| i.oauth_server.as_str()),
        Some("https://oauth.test")
    );
}

#[tokio::test]
async fn token_login_skips_the_authenticator() {
    let auth = Fixed::new();
    let config = ClientConfig::new("https://max.test", "bob", Credentials::Token("given".into()));
    let client = Client::login_with(config, &auth).await.expect("login");

    assert!(auth.calls.lock().expect("calls lock").is_empty());
    assert_eq!(client.session_config().token, "given");
    assert_eq!(client.session_config().login, "bob");
    assert!(client.server_info().is_none());
}

#[tokio::test]
async fn rejected_password_is_an_auth_error() {
    let config = ClientConfig::new("https://max.test", "alice", Credentials::Password("wrong".into()));
    let err = Client::login_with(config, &Fixed::new()).await.expect_err("rejected");
    assert!(matches!(err, ClientError::Auth(AuthError::Rejected { .. })));
    assert_eq!(err.to_string(), "authentication failed: invalid_grant: Bad credentials");
}

#[tokio::test]
async fn invalid_server_url_fails_session_construction() {
    let config = ClientConfig::new("ftp://max.test", "alice", Credentials::Token("t".into()));
    let client = Client::login_with(config, &Fixed::new()).await.expect("login");
    assert!(matches!(
        client.session(EventHandlers::new()),
        Err(ClientError::Transport(TransportError::InvalidUrl(_)))
    ));
}

#[tokio::test]
async fn logs_in_and_converses_against_a_live_server() {
    let server = TestServer::spawn(Behavior::default()).await;
    let config = ClientConfig::new(server.url(), "alice", Credentials::Password(GOOD_PASSWORD.into()))
        .with_transport(TransportKind::XhrPolling);
    let client = Client::login(config).await.expect("login");
    assert_eq!(client.session_config().token, "token-alice");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let events = EventHandlers::new()
        .on(EventKind::StartListening, |handle, _| {
            handle.send_message("abc123", "hello").expect("send");
        })
        .on(EventKind::MessageAckd, move |handle, event| {
            if let SessionEvent::MessageAckd(message) = event {
                sink.lock().expect("seen lock").push(message.event.text().map(ToOwned::to_owned));
            }
            handle.disconnect();
        });

    tokio::time::timeout(Duration::from_secs(5), client.run(events))
        .await
        .expect("run finished")
        .expect("run");

    assert_eq!(*seen.lock().expect("seen lock"), vec![Some("hello".to_owned())]);
    assert!(
        server
            .received()
            .iter()
            .any(|frame| frame.starts_with("CONNECT") && frame.contains("passcode:token-alice"))
    );

    let session = client.session(EventHandlers::new()).expect("session");
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn wrong_password_against_a_live_server() {
    let server = TestServer::spawn(Behavior::default()).await;
    let config = ClientConfig::new(server.url(), "alice", Credentials::Password("nope".into()));
    assert!(matches!(
        Client::login(config).await,
        Err(ClientError::Auth(AuthError::Rejected { .. }))
    ));
}

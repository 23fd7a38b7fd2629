//! Client facade — credentials in, ready-to-connect sessions out.
//!
//! LIFECYCLE
//! =========
//! 1. [`Client::login`] resolves the server's `/info`, exchanges the password
//!    for a token (skipped when a token is supplied) and derives the STOMP
//!    login from the server URL's domain segment.
//! 2. [`Client::session`] builds a fresh [`Session`] on the configured
//!    transport kind; [`Client::run`] also connects it and drives it to the
//!    end.

use tracing::info;

use crate::auth::{AuthError, Authenticator, HttpAuthenticator, ServerInfo, domain_from_server_url};
use crate::events::EventHandlers;
use crate::session::{Session, SessionConfig, SessionError};
use crate::transport::{Transport, TransportError, TransportKind};

/// Envelope endpoint prefix under the server URL.
pub const DEFAULT_PREFIX: &str = "stomp";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::Token(_) => f.write_str("Token(***)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub username: String,
    pub credentials: Credentials,
    pub transport: TransportKind,
    pub prefix: String,
    pub auth_retry_limit: Option<u32>,
}

impl ClientConfig {
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        username: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            username: username.into(),
            credentials,
            transport: TransportKind::Websocket,
            prefix: DEFAULT_PREFIX.to_owned(),
            auth_retry_limit: None,
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_auth_retry_limit(mut self, limit: u32) -> Self {
        self.auth_retry_limit = Some(limit);
        self
    }
}

/// An authenticated user on one server.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    session_config: SessionConfig,
    server_info: Option<ServerInfo>,
}

impl Client {
    /// Authenticate over HTTP.
    ///
    /// # Errors
    ///
    /// See [`Client::login_with`].
    pub async fn login(config: ClientConfig) -> Result<Self, ClientError> {
        Self::login_with(config, &HttpAuthenticator::new()).await
    }

    /// Authenticate through `auth`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Auth`] if discovery or the token exchange fails.
    pub async fn login_with(
        config: ClientConfig,
        auth: &impl Authenticator,
    ) -> Result<Self, ClientError> {
        let (token, server_info) = match &config.credentials {
            Credentials::Token(token) => (token.clone(), None),
            Credentials::Password(password) => {
                let server_info = auth.resolve_server_info(&config.server_url).await?;
                let token = auth
                    .fetch_token(&server_info.oauth_server, &config.username, password)
                    .await?;
                (token, Some(server_info))
            }
        };

        let domain = domain_from_server_url(&config.server_url);
        let mut session_config =
            SessionConfig::new(config.username.clone(), token).with_domain(domain);
        if let Some(limit) = config.auth_retry_limit {
            session_config = session_config.with_auth_retry_limit(limit);
        }
        info!(user = %session_config.username, login = %session_config.login, "logged in");

        Ok(Self {
            config,
            session_config,
            server_info,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    /// Discovery document, present when logging in with a password.
    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Build an idle session on a fresh transport.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the server URL is invalid.
    pub fn session(&self, events: EventHandlers) -> Result<Session, ClientError> {
        let transport = Transport::new(
            self.config.transport,
            &self.config.server_url,
            &self.config.prefix,
        )?;
        Ok(Session::new(self.session_config.clone(), transport, events))
    }

    /// Connect a new session and drive it until it closes.
    ///
    /// # Errors
    ///
    /// Returns the handshake error, or a transport misuse error.
    pub async fn run(&self, events: EventHandlers) -> Result<(), ClientError> {
        let mut session = self.session(events)?;
        session.connect().await?;
        session.run().await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;

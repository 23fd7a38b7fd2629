//! Authentication collaborator — server discovery and OAuth token fetch.
//!
//! The [`Authenticator`] trait is the narrow seam the client facade depends
//! on. [`HttpAuthenticator`] talks to the real endpoints:
//!
//! - `GET <server>/info` → JSON carrying the OAuth server URL
//! - `POST <oauth>/token` (password grant) → access token
//! - `GET <server>/info/settings` with OAuth headers → private settings

use std::future::Future;

use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;

pub const OAUTH_CLIENT_ID: &str = "MAX";
pub const OAUTH_SCOPE: &str = "widgetcli";

/// Discovery keys for the OAuth server, in lookup order.
const OAUTH_SERVER_KEYS: [&str; 2] = ["max.oauth_server", "oauth_server"];

/// Token fields, current name first, legacy name second.
const TOKEN_KEYS: [&str; 2] = ["access_token", "oauth_token"];

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The token endpoint refused the credentials.
    #[error("{error}: {description}")]
    Rejected { error: String, description: String },
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("invalid JSON response: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// Public server metadata from `/info`.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerInfo {
    pub oauth_server: String,
    pub raw: Value,
}

impl ServerInfo {
    /// # Errors
    ///
    /// Returns [`AuthError::MissingField`] when no OAuth server is advertised.
    pub fn from_json(raw: Value) -> Result<Self, AuthError> {
        let oauth_server = OAUTH_SERVER_KEYS
            .iter()
            .find_map(|key| raw.get(key).and_then(Value::as_str))
            .ok_or(AuthError::MissingField("max.oauth_server"))?
            .trim_end_matches('/')
            .to_owned();
        Ok(Self { oauth_server, raw })
    }
}

pub trait Authenticator {
    /// Fetch `/info` from the server.
    fn resolve_server_info(
        &self,
        server_url: &str,
    ) -> impl Future<Output = Result<ServerInfo, AuthError>> + Send;

    /// Exchange a password for an access token.
    fn fetch_token(
        &self,
        oauth_server: &str,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<String, AuthError>> + Send;
}

#[derive(Clone, Debug, Default)]
pub struct HttpAuthenticator {
    http: reqwest::Client,
}

impl HttpAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch the private settings of `username`.
    ///
    /// # Errors
    ///
    /// Returns HTTP, header, status and JSON failures.
    pub async fn fetch_settings(
        &self,
        server_url: &str,
        username: &str,
        token: &str,
    ) -> Result<Value, AuthError> {
        let url = format!("{}/info/settings", server_url.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .headers(oauth2_headers(username, token, OAUTH_SCOPE)?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::UnexpectedStatus(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

impl Authenticator for HttpAuthenticator {
    async fn resolve_server_info(&self, server_url: &str) -> Result<ServerInfo, AuthError> {
        let url = format!("{}/info", server_url.trim_end_matches('/'));
        let raw = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        ServerInfo::from_json(raw)
    }

    async fn fetch_token(
        &self,
        oauth_server: &str,
        username: &str,
        password: &str,
    ) -> Result<String, AuthError> {
        let url = format!("{}/token", oauth_server.trim_end_matches('/'));
        let form = [
            ("grant_type", "password"),
            ("client_id", OAUTH_CLIENT_ID),
            ("scope", OAUTH_SCOPE),
            ("username", username),
            ("password", password),
        ];
        let response = self.http.post(url).form(&form).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        let token = parse_token_response(status, &body)?;
        tracing::debug!(%username, "token acquired");
        Ok(token)
    }
}

/// Headers authenticating a request as `username`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidHeader`] for values that are not valid header
/// text.
pub fn oauth2_headers(username: &str, token: &str, scope: &str) -> Result<HeaderMap, AuthError> {
    let mut headers = HeaderMap::new();
    headers.insert("X-Oauth-Token", HeaderValue::from_str(token)?);
    headers.insert("X-Oauth-Username", HeaderValue::from_str(username)?);
    headers.insert("X-Oauth-Scope", HeaderValue::from_str(scope)?);
    Ok(headers)
}

#[derive(Deserialize)]
struct Rejection {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Interpret the token endpoint's reply.
///
/// # Errors
///
/// - [`AuthError::Rejected`] on 400/401 with the endpoint's error text.
/// - [`AuthError::MissingField`] on 200 without a token.
/// - [`AuthError::UnexpectedStatus`] on any other status.
pub fn parse_token_response(status: u16, body: &str) -> Result<String, AuthError> {
    match status {
        200 => {
            let value: Value = serde_json::from_str(body)?;
            TOKEN_KEYS
                .iter()
                .find_map(|key| value.get(key).and_then(Value::as_str))
                .map(ToOwned::to_owned)
                .ok_or(AuthError::MissingField("access_token"))
        }
        400 | 401 => {
            let rejection: Rejection = serde_json::from_str(body)?;
            Err(AuthError::Rejected {
                error: rejection.error,
                description: rejection.error_description,
            })
        }
        other => Err(AuthError::UnexpectedStatus(other)),
    }
}

/// Domain encoded as the last path segment of the server URL.
///
/// `https://host/demo` → `demo`. Segments containing a dot are not domains.
#[must_use]
pub fn domain_from_server_url(server_url: &str) -> Option<String> {
    let trimmed = server_url.trim();
    let url = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("http://{trimmed}"))
    }
    .ok()?;
    let last = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    if last.contains('.') {
        return None;
    }
    Some(last.to_owned())
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;

//! Connection descriptor — where one physical connection points.
//!
//! The envelope endpoint lives at
//! `<scheme>://<host>[:<port>]/<path>/<prefix>/<server_id>/<client_id>/<transport>`.
//! `server_id` and `client_id` are generated per connection; [`renew`]
//! produces a descriptor for a fresh connection to the same endpoint.
//!
//! [`renew`]: ConnectionDescriptor::renew

use rand::Rng;
use reqwest::Url;

use super::{TransportError, TransportKind};

const CLIENT_ID_LEN: usize = 8;
const CLIENT_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_SERVER_ID: u32 = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    kind: TransportKind,
    secure: bool,
    host: String,
    port: u16,
    base_path: String,
    server_id: String,
    client_id: String,
}

impl ConnectionDescriptor {
    /// Resolve a descriptor from a server URL such as `https://host/demo`.
    ///
    /// The URL scheme may be `http`, `https`, `ws` or `wss`; it only decides
    /// whether TLS is used. Without a scheme, port 443 implies TLS.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for unparseable URLs, missing
    /// hosts and unsupported schemes.
    pub fn new(kind: TransportKind, server_url: &str, prefix: &str) -> Result<Self, TransportError> {
        let trimmed = server_url.trim();
        let explicit_scheme = trimmed.contains("://");
        let candidate = if explicit_scheme {
            trimmed.to_owned()
        } else {
            format!("http://{trimmed}")
        };

        let url = Url::parse(&candidate)
            .map_err(|error| TransportError::InvalidUrl(format!("{server_url}: {error}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{server_url}: missing host")))?
            .to_owned();

        let secure = match url.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => !explicit_scheme && url.port() == Some(443),
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "{server_url}: unsupported scheme `{other}`"
                )));
            }
        };
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self {
            kind,
            secure,
            host,
            port,
            base_path: join_path(url.path(), prefix),
            server_id: random_server_id(),
            client_id: random_client_id(),
        })
    }

    /// Same endpoint, freshly generated session ids.
    #[must_use]
    pub fn renew(&self) -> Self {
        Self {
            server_id: random_server_id(),
            client_id: random_client_id(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// URL scheme used by this transport kind.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        scheme_for(self.kind.is_duplex(), self.secure)
    }

    /// Endpoint root in this transport's scheme, e.g. `wss://host/demo/stomp`.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.root_url(self.scheme())
    }

    /// Endpoint root over plain HTTP(S), used for `/info`.
    #[must_use]
    pub fn http_base_url(&self) -> String {
        self.root_url(scheme_for(false, self.secure))
    }

    /// `<base_path>/<server_id>/<client_id>`.
    #[must_use]
    pub fn session_path(&self) -> String {
        if self.base_path.is_empty() {
            format!("{}/{}", self.server_id, self.client_id)
        } else {
            format!("{}/{}/{}", self.base_path, self.server_id, self.client_id)
        }
    }

    /// Receive endpoint (websocket URL or XHR poll URL).
    #[must_use]
    pub fn receive_url(&self) -> String {
        self.session_url(self.kind.transport_id())
    }

    /// XHR send endpoint; `None` for duplex transports.
    #[must_use]
    pub fn send_url(&self) -> Option<String> {
        self.kind.send_id().map(|id| self.session_url(id))
    }

    fn session_url(&self, endpoint: &str) -> String {
        format!(
            "{}://{}/{}/{endpoint}",
            self.scheme(),
            self.authority(),
            self.session_path()
        )
    }

    fn root_url(&self, scheme: &str) -> String {
        if self.base_path.is_empty() {
            format!("{scheme}://{}", self.authority())
        } else {
            format!("{scheme}://{}/{}", self.authority(), self.base_path)
        }
    }

    fn authority(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn scheme_for(duplex: bool, secure: bool) -> &'static str {
    match (duplex, secure) {
        (true, false) => "ws",
        (true, true) => "wss",
        (false, false) => "http",
        (false, true) => "https",
    }
}

fn join_path(path: &str, prefix: &str) -> String {
    path.split('/')
        .chain(prefix.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn random_server_id() -> String {
    rand::random_range(0..=MAX_SERVER_ID).to_string()
}

fn random_client_id() -> String {
    let mut rng = rand::rng();
    (0..CLIENT_ID_LEN)
        .map(|_| char::from(CLIENT_ID_CHARSET[rng.random_range(0..CLIENT_ID_CHARSET.len())]))
        .collect()
}

#[cfg(test)]
#[path = "descriptor_test.rs"]
mod tests;

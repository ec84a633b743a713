//! SockJS endpoint URLs.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// TransportType
// ============================================================================

/// SockJS transport types supported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    WebSocket,
    XhrStreaming,
    Xhr,
}

impl TransportType {
    /// Returns the URL path segment, e.g. `xhr_streaming`.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::XhrStreaming => "xhr_streaming",
            Self::Xhr => "xhr",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SockJsUrlInfo
// ============================================================================

/// Base URL plus the random server and session ids of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockJsUrlInfo {
    url: Url,
    server_id: String,
    session_id: String,
}

impl SockJsUrlInfo {
    /// Creates URL info with fresh ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the scheme is one of
    /// `http`, `https`, `ws` or `wss`.
    pub fn new(url: Url) -> Result<Self> {
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(Error::invalid_argument(format!(
                "Unsupported SockJS URL scheme: {url}"
            )));
        }
        let random = Uuid::new_v4();
        let server_id = (random.as_u128() % 1000).to_string();
        let session_id = Uuid::new_v4().simple().to_string();
        Ok(Self {
            url,
            server_id,
            session_id,
        })
    }

    /// Returns the base URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the random server id, `0` to `999`.
    #[inline]
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Returns the random session id.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns `true` for `https` and `wss` base URLs.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self.url.scheme(), "https" | "wss")
    }

    /// Returns `{base}/info` with an HTTP scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the resulting URL is invalid.
    pub fn info_url(&self) -> Result<Url> {
        self.build(self.http_scheme(), "info")
    }

    /// Returns `{base}/{server}/{session}/{type}`; WebSocket uses a `ws` or
    /// `wss` scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the resulting URL is invalid.
    pub fn transport_url(&self, transport_type: TransportType) -> Result<Url> {
        let scheme = match transport_type {
            TransportType::WebSocket if self.is_secure() => "wss",
            TransportType::WebSocket => "ws",
            _ => self.http_scheme(),
        };
        self.build(
            scheme,
            &format!("{}/{}/{}", self.server_id, self.session_id, transport_type),
        )
    }

    /// Returns `{base}/{server}/{session}/xhr_send`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the resulting URL is invalid.
    pub fn xhr_send_url(&self) -> Result<Url> {
        self.build(
            self.http_scheme(),
            &format!("{}/{}/xhr_send", self.server_id, self.session_id),
        )
    }

    fn http_scheme(&self) -> &'static str {
        if self.is_secure() { "https" } else { "http" }
    }

    fn build(&self, scheme: &str, suffix: &str) -> Result<Url> {
        let base = self.url.as_str().trim_end_matches('/');
        let rest = base
            .split_once("://")
            .map_or(base, |(_, rest)| rest);
        Ok(Url::parse(&format!("{scheme}://{rest}/{suffix}"))?)
    }
}

impl fmt::Display for SockJsUrlInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SockJsUrlInfo[url={}, server={}, session={}]",
            self.url, self.server_id, self.session_id
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

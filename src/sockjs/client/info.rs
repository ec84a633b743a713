//! SockJS `/info` request.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Lower bound added to the round-trip time when computing connect
/// timeouts.
const MIN_RETRANSMISSION_DELAY: Duration = Duration::from_millis(300);

// ============================================================================
// ServerInfo
// ============================================================================

/// Body of a SockJS `/info` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// `false` when the server disabled the WebSocket transport.
    #[serde(default = "default_websocket")]
    pub websocket: bool,
    #[serde(default)]
    pub cookie_needed: bool,
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default)]
    pub entropy: i64,
}

fn default_websocket() -> bool {
    true
}

/// Server info plus the round-trip time of the request that fetched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfoEntry {
    pub info: ServerInfo,
    pub response_time: Duration,
}

impl ServerInfoEntry {
    /// Parses an `/info` response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for a malformed body.
    pub fn parse(body: &str, response_time: Duration) -> Result<Self> {
        Ok(Self {
            info: serde_json::from_str(body)?,
            response_time,
        })
    }

    /// Returns `true` unless the server disabled WebSocket.
    #[inline]
    #[must_use]
    pub fn is_websocket_enabled(&self) -> bool {
        self.info.websocket
    }

    /// Connect timeout for one transport attempt: the larger of four round
    /// trips and one round trip plus 300ms.
    #[must_use]
    pub fn retransmission_timeout(&self) -> Duration {
        let rtt = self.response_time;
        (rtt * 4).max(rtt + MIN_RETRANSMISSION_DELAY)
    }
}

// ============================================================================
// InfoReceiver
// ============================================================================

/// Performs the `/info` request.
#[async_trait]
pub trait InfoReceiver: Send + Sync {
    /// Fetches `info_url` and returns the response body.
    async fn execute_info_request(&self, info_url: &Url, headers: &HeaderMap) -> Result<String>;
}

/// [`InfoReceiver`] backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct RestInfoReceiver {
    client: reqwest::Client,
}

impl RestInfoReceiver {
    /// Creates a receiver with a shared client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InfoReceiver for RestInfoReceiver {
    async fn execute_info_request(&self, info_url: &Url, headers: &HeaderMap) -> Result<String> {
        trace!(url = %info_url, "Executing SockJS info request");
        let response = self
            .client
            .get(info_url.clone())
            .headers(headers.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::connection(format!(
                "SockJS info request to {info_url} failed with {status}"
            )));
        }
        Ok(response.text().await?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info() {
        let entry = ServerInfoEntry::parse(
            r#"{"entropy":-1,"origins":["*:*"],"cookie_needed":true,"websocket":false}"#,
            Duration::from_millis(20),
        )
        .unwrap();

        assert!(!entry.is_websocket_enabled());
        assert!(entry.info.cookie_needed);

        let minimal = ServerInfoEntry::parse("{}", Duration::ZERO).unwrap();
        assert!(minimal.is_websocket_enabled());
    }

    #[test]
    fn test_retransmission_timeout() {
        let entry = |ms| ServerInfoEntry::parse("{}", Duration::from_millis(ms)).unwrap();

        assert_eq!(entry(50).retransmission_timeout(), Duration::from_millis(350));
        assert_eq!(entry(100).retransmission_timeout(), Duration::from_millis(400));
        assert_eq!(entry(200).retransmission_timeout(), Duration::from_millis(800));
    }
}

//! WebSocket client seam.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{ConnectionInfo, WebSocketConnection, WebSocketHandler, WebSocketSession};

// ============================================================================
// WebSocketClient
// ============================================================================

/// Opens WebSocket-like sessions.
#[async_trait]
pub trait WebSocketClient: Send + Sync {
    /// Performs the handshake and starts delivering events to `handler`.
    async fn execute(
        &self,
        handler: Arc<dyn WebSocketHandler>,
        headers: HeaderMap,
        url: &Url,
    ) -> Result<Arc<dyn WebSocketSession>>;
}

// ============================================================================
// StandardWebSocketClient
// ============================================================================

/// [`WebSocketClient`] over a native tokio-tungstenite connection.
#[derive(Debug, Default, Clone)]
pub struct StandardWebSocketClient {
    sub_protocols: Vec<String>,
}

impl StandardWebSocketClient {
    /// Creates a client that requests no sub-protocol.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sub-protocols offered in `Sec-WebSocket-Protocol`, unless
    /// the handshake headers already carry one.
    #[must_use]
    pub fn with_sub_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl WebSocketClient for StandardWebSocketClient {
    async fn execute(
        &self,
        handler: Arc<dyn WebSocketHandler>,
        headers: HeaderMap,
        url: &Url,
    ) -> Result<Arc<dyn WebSocketSession>> {
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().extend(headers);
        if !self.sub_protocols.is_empty() && !request.headers().contains_key(SEC_WEBSOCKET_PROTOCOL) {
            let offered = HeaderValue::from_str(&self.sub_protocols.join(", "))
                .map_err(|e| Error::invalid_argument(format!("Invalid sub-protocol list: {e}")))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
        }

        let (stream, response) = connect_async(request).await?;
        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        debug!(%url, ?protocol, "WebSocket handshake completed");

        let connection = WebSocketConnection::spawn(
            stream,
            ConnectionInfo {
                protocol,
                ..ConnectionInfo::default()
            },
            handler,
        );
        Ok(connection as Arc<dyn WebSocketSession>)
    }
}

// ============================================================================
// Tests
// ============================================================================

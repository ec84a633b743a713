//! Transport-neutral WebSocket session abstraction.
//!
//! Native WebSocket connections, SockJS sessions and the back-pressure
//! decorator all implement [`WebSocketSession`], so protocol handlers never
//! see which transport carries a session.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identifiers::{Principal, SessionAttributes, SessionId};

use super::message::{CloseStatus, WebSocketMessage};

// ============================================================================
// SessionKind
// ============================================================================

/// Transport kind behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Native WebSocket.
    WebSocket,
    /// SockJS over WebSocket.
    SockJsWebSocket,
    /// SockJS over HTTP streaming.
    HttpStreaming,
    /// SockJS over HTTP long polling.
    HttpPolling,
}

impl SessionKind {
    /// Returns `true` for any SockJS session.
    #[inline]
    #[must_use]
    pub const fn is_sockjs(self) -> bool {
        !matches!(self, Self::WebSocket)
    }

    /// Returns `true` for HTTP fallback sessions, which are text-only.
    #[inline]
    #[must_use]
    pub const fn is_http_fallback(self) -> bool {
        matches!(self, Self::HttpStreaming | Self::HttpPolling)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WebSocket => "websocket",
            Self::SockJsWebSocket => "sockjs-websocket",
            Self::HttpStreaming => "http-streaming",
            Self::HttpPolling => "http-polling",
        };
        f.write_str(name)
    }
}

// ============================================================================
// WebSocketSession
// ============================================================================

/// A bidirectional message session.
///
/// Implementations must be safe to share across tasks. Sends on a raw
/// session are not required to be safe to call concurrently; wrap the
/// session in a [`ConcurrentSendSession`](super::ConcurrentSendSession) for
/// that.
#[async_trait]
pub trait WebSocketSession: Send + Sync {
    /// Returns the session id.
    fn id(&self) -> &SessionId;

    /// Returns the transport kind.
    fn kind(&self) -> SessionKind;

    /// Returns the negotiated sub-protocol, if any.
    fn accepted_protocol(&self) -> Option<&str>;

    /// Returns the transport-level principal.
    fn principal(&self) -> Option<Principal>;

    /// Returns the session attributes.
    fn attributes(&self) -> &SessionAttributes;

    /// Returns `true` while the session is open.
    fn is_open(&self) -> bool;

    /// Returns the inbound text message size limit in bytes.
    fn text_message_size_limit(&self) -> usize;

    /// Sets the inbound text message size limit in bytes.
    fn set_text_message_size_limit(&self, limit: usize);

    /// Returns the inbound binary message size limit in bytes.
    fn binary_message_size_limit(&self) -> usize;

    /// Sets the inbound binary message size limit in bytes.
    fn set_binary_message_size_limit(&self, limit: usize);

    /// Disables transport-level keep-alive.
    ///
    /// No-op for transports without one.
    fn disable_heartbeat(&self) {}

    /// Sends a message.
    async fn send_message(&self, message: WebSocketMessage) -> Result<()>;

    /// Closes the session with the given status.
    async fn close(&self, status: CloseStatus) -> Result<()>;
}

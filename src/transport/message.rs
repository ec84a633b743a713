//! Transport-level messages and close statuses.

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

// ============================================================================
// WebSocketMessage
// ============================================================================

/// A message exchanged over a WebSocket session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketMessage {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
}

impl WebSocketMessage {
    /// Creates a text message.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Creates a binary message.
    #[inline]
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Returns the payload size in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
        }
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data,
        }
    }

    /// Returns the text payload, if this is a text message.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns `true` for text and binary messages.
    #[inline]
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Binary(_))
    }
}

impl From<WebSocketMessage> for WsMessage {
    fn from(message: WebSocketMessage) -> Self {
        match message {
            WebSocketMessage::Text(text) => Self::Text(text.into()),
            WebSocketMessage::Binary(data) => Self::Binary(data),
            WebSocketMessage::Ping(data) => Self::Ping(data),
            WebSocketMessage::Pong(data) => Self::Pong(data),
        }
    }
}

// ============================================================================
// CloseStatus
// ============================================================================

/// WebSocket close status code and reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseStatus {
    /// Close code.
    pub code: u16,
    /// Optional reason text.
    pub reason: Option<Cow<'static, str>>,
}

impl CloseStatus {
    /// Normal closure.
    pub const NORMAL: Self = Self::new(1000);
    /// Endpoint going away, e.g. server shutdown.
    pub const GOING_AWAY: Self = Self::new(1001);
    /// Protocol error.
    pub const PROTOCOL_ERROR: Self = Self::new(1002);
    /// Unsupported data.
    pub const NOT_ACCEPTABLE: Self = Self::new(1003);
    /// No status code was present.
    pub const NO_STATUS_CODE: Self = Self::new(1005);
    /// Connection closed without a close frame.
    pub const NO_CLOSE_FRAME: Self = Self::new(1006);
    /// Inconsistent message data.
    pub const BAD_DATA: Self = Self::new(1007);
    /// Policy violation.
    pub const POLICY_VIOLATION: Self = Self::new(1008);
    /// Message too big to process.
    pub const TOO_BIG_TO_PROCESS: Self = Self::new(1009);
    /// Unexpected server condition.
    pub const SERVER_ERROR: Self = Self::new(1011);
    /// Session is unreliable, e.g. a slow or silent client.
    ///
    /// Not a standard code; no close frame should be attempted.
    pub const SESSION_NOT_RELIABLE: Self = Self::new(4500);

    /// Creates a status without reason.
    #[inline]
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self { code, reason: None }
    }

    /// Returns a copy with the given reason.
    #[must_use]
    pub fn with_reason(&self, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: self.code,
            reason: Some(reason.into()),
        }
    }

    /// Returns the reason, or an empty string.
    #[inline]
    #[must_use]
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }

    /// Returns `true` if the codes match, ignoring the reason.
    #[inline]
    #[must_use]
    pub fn equals_code(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Default for CloseStatus {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "CloseStatus[code={}, reason={reason}]", self.code),
            None => write!(f, "CloseStatus[code={}]", self.code),
        }
    }
}

impl From<CloseStatus> for CloseFrame {
    fn from(status: CloseStatus) -> Self {
        Self {
            code: CloseCode::from(status.code),
            reason: status.reason.map(|r| r.into_owned()).unwrap_or_default().into(),
        }
    }
}

impl From<&CloseFrame> for CloseStatus {
    fn from(frame: &CloseFrame) -> Self {
        let code = u16::from(frame.code);
        if frame.reason.is_empty() {
            Self::new(code)
        } else {
            Self::new(code).with_reason(frame.reason.as_str().to_owned())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

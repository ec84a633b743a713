//! STOMP commands and the routing-layer message types they map to.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// MessageType
// ============================================================================

/// Message type understood by the external routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Client connect request.
    Connect,
    /// Routing-layer acknowledgement of a connect.
    ConnectAck,
    /// Application message.
    Message,
    /// Subscription request.
    Subscribe,
    /// Unsubscribe request.
    Unsubscribe,
    /// Heartbeat.
    Heartbeat,
    /// Client disconnect or session end.
    Disconnect,
    /// Routing-layer acknowledgement of a disconnect.
    DisconnectAck,
    /// Anything else.
    #[default]
    Other,
}

// ============================================================================
// StompCommand
// ============================================================================

/// STOMP frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StompCommand {
    // client
    /// STOMP 1.2 alias of CONNECT.
    Stomp,
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    Send,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,

    // server
    Connected,
    Receipt,
    Message,
    Error,
}

impl StompCommand {
    /// All commands.
    pub const ALL: [Self; 15] = [
        Self::Stomp,
        Self::Connect,
        Self::Disconnect,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Send,
        Self::Ack,
        Self::Nack,
        Self::Begin,
        Self::Commit,
        Self::Abort,
        Self::Connected,
        Self::Receipt,
        Self::Message,
        Self::Error,
    ];

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stomp => "STOMP",
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Connected => "CONNECTED",
            Self::Receipt => "RECEIPT",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
        }
    }

    /// Maps the command to the routing-layer message type.
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            Self::Stomp | Self::Connect => MessageType::Connect,
            Self::Disconnect => MessageType::Disconnect,
            Self::Subscribe => MessageType::Subscribe,
            Self::Unsubscribe => MessageType::Unsubscribe,
            Self::Send | Self::Message => MessageType::Message,
            _ => MessageType::Other,
        }
    }

    /// Returns `true` for CONNECT and STOMP.
    #[inline]
    #[must_use]
    pub const fn is_connect(self) -> bool {
        matches!(self, Self::Stomp | Self::Connect)
    }

    /// Returns `true` if frames with this command may carry a body.
    #[inline]
    #[must_use]
    pub const fn is_body_allowed(self) -> bool {
        matches!(self, Self::Send | Self::Message | Self::Error)
    }

    /// Returns `true` if the encoder always writes `content-length`.
    #[inline]
    #[must_use]
    pub const fn requires_content_length(self) -> bool {
        self.is_body_allowed()
    }

    /// Returns `true` if a `destination` header is mandatory.
    #[inline]
    #[must_use]
    pub const fn requires_destination(self) -> bool {
        matches!(self, Self::Send | Self::Message | Self::Subscribe)
    }

    /// Returns `true` if a `subscription`/`id` header is mandatory.
    #[inline]
    #[must_use]
    pub const fn requires_subscription_id(self) -> bool {
        matches!(self, Self::Message | Self::Subscribe | Self::Unsubscribe)
    }

    /// Returns `true` if header escaping applies to frames with this command.
    #[inline]
    #[must_use]
    pub const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| Error::framing(format!("Unknown STOMP command '{s}'")))
    }
}

// ============================================================================
// Tests
// ============================================================================

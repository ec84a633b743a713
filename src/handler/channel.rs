//! Channels connecting protocol handlers to the external routing layer.

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::Message;

// ============================================================================
// MessageChannel
// ============================================================================

/// Destination for decoded messages.
///
/// The inbound channel receives messages decoded from clients; the routing
/// layer answers through an outbound channel consumed by
/// [`SubProtocolWebSocketHandler::start`](super::SubProtocolWebSocketHandler::start).
pub trait MessageChannel: Send + Sync {
    /// Sends a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the routing layer rejected the message.
    fn send(&self, message: Message) -> Result<()>;

    /// Returns `true` if downstream interceptors modify headers, so
    /// messages must not be frozen before sending.
    fn keeps_headers_mutable(&self) -> bool {
        false
    }
}

// ============================================================================
// UnboundedMessageChannel
// ============================================================================

/// [`MessageChannel`] backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct UnboundedMessageChannel {
    tx: mpsc::UnboundedSender<Message>,
    keep_mutable: bool,
}

impl UnboundedMessageChannel {
    /// Creates a channel and its receiving end.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                keep_mutable: false,
            },
            rx,
        )
    }

    /// Declares that receivers modify message headers.
    #[must_use]
    pub fn with_mutable_headers(mut self) -> Self {
        self.keep_mutable = true;
        self
    }
}

impl MessageChannel for UnboundedMessageChannel {
    fn send(&self, message: Message) -> Result<()> {
        trace!(message_type = ?message.headers().message_type(), "Sending to channel");
        self.tx
            .send(message)
            .map_err(|_| Error::processing("Message channel receiver dropped"))
    }

    fn keeps_headers_mutable(&self) -> bool {
        self.keep_mutable
    }
}

// ============================================================================
// Tests
// ============================================================================

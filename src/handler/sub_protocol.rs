//! Contract between the multiplexing handler and protocol adapters.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::identifiers::SessionId;
use crate::protocol::Message;
use crate::transport::{CloseStatus, WebSocketMessage, WebSocketSession};

use super::channel::MessageChannel;

// ============================================================================
// SubProtocolHandler
// ============================================================================

/// Translates between raw WebSocket messages and decoded messages for one
/// sub-protocol.
///
/// Transports invoke the hooks in order: `after_session_started`, any
/// number of `handle_message_from_client` / `handle_message_to_client`,
/// then `after_session_ended` once.
#[async_trait]
pub trait SubProtocolHandler: Send + Sync {
    /// Protocol names this handler serves, e.g. `v12.stomp`.
    fn supported_protocols(&self) -> Vec<String>;

    /// Prepares per-session state.
    async fn after_session_started(
        &self,
        session: Arc<dyn WebSocketSession>,
        output: &dyn MessageChannel,
    ) -> Result<()>;

    /// Decodes a client message and forwards the result to `output`.
    async fn handle_message_from_client(
        &self,
        session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
        output: &dyn MessageChannel,
    ) -> Result<()>;

    /// Encodes a routing-layer message and writes it to the client.
    ///
    /// # Errors
    ///
    /// [`Error::SessionLimitExceeded`](crate::Error::SessionLimitExceeded)
    /// is propagated so the caller can close the session.
    async fn handle_message_to_client(
        &self,
        session: Arc<dyn WebSocketSession>,
        message: Message,
    ) -> Result<()>;

    /// Extracts the target session id of an outbound message.
    fn resolve_session_id(&self, message: &Message) -> Option<SessionId>;

    /// Releases per-session state and notifies the routing layer.
    async fn after_session_ended(
        &self,
        session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
        output: &dyn MessageChannel,
    ) -> Result<()>;
}

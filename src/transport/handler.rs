//! WebSocket lifecycle callbacks.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::message::{CloseStatus, WebSocketMessage};
use super::session::WebSocketSession;

// ============================================================================
// WebSocketHandler
// ============================================================================

/// Receives session lifecycle events and inbound messages.
///
/// Transports call the methods in order: `after_connection_established`
/// once, then any number of `handle_message` / `handle_transport_error`,
/// then `after_connection_closed` once.
#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    /// Called after the session is open and ready for use.
    async fn after_connection_established(&self, session: Arc<dyn WebSocketSession>) -> Result<()>;

    /// Called for each inbound message.
    async fn handle_message(
        &self,
        session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
    ) -> Result<()>;

    /// Called when the transport reports an error.
    async fn handle_transport_error(
        &self,
        session: Arc<dyn WebSocketSession>,
        error: &Error,
    ) -> Result<()>;

    /// Called after the session was closed by either side.
    async fn after_connection_closed(
        &self,
        session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
    ) -> Result<()>;
}

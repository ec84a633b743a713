//! Connection seams between a STOMP client and its transport.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Callback fired when a connection has been inactive too long.
pub type InactivityCallback = Box<dyn Fn() + Send + Sync + 'static>;

// ============================================================================
// TcpConnection
// ============================================================================

/// A message-level connection to a STOMP server.
#[async_trait]
pub trait TcpConnection: Send + Sync {
    /// Encodes and sends a message.
    async fn send(&self, message: Message) -> Result<()>;

    /// Fires `callback` whenever nothing was read for longer than
    /// `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] without a task scheduler.
    fn on_read_inactivity(&self, callback: InactivityCallback, duration: Duration) -> Result<()>;

    /// Fires `callback` whenever nothing was written for longer than
    /// `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] without a task scheduler.
    fn on_write_inactivity(&self, callback: InactivityCallback, duration: Duration) -> Result<()>;

    /// Closes the connection and cancels inactivity checks.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// ConnectionHandler
// ============================================================================

/// Receives connection lifecycle events and decoded messages.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// The transport is open. The CONNECT frame follows immediately.
    async fn after_connected(&self, connection: Arc<dyn TcpConnection>);

    /// The transport handshake failed.
    async fn after_connect_failure(&self, error: &Error);

    /// A frame was decoded.
    async fn handle_message(&self, message: Message);

    /// Decoding, transport or heartbeat failure.
    async fn handle_failure(&self, error: &Error);

    /// The connection is closed.
    async fn after_connection_closed(&self);
}

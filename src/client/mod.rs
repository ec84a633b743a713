//! STOMP client over WebSocket and SockJS.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | [`TcpConnection`] and [`ConnectionHandler`] seams |
//! | `adapter` | STOMP connection over a WebSocket session |
//! | `websocket` | [`WebSocketClient`] and the native client |
//! | `stomp_client` | [`WebSocketStompClient`] |

// ============================================================================
// Submodules
// ============================================================================

/// STOMP connection over a WebSocket session.
pub mod adapter;

/// Connection seams.
pub mod connection;

/// STOMP client entry point.
pub mod stomp_client;

/// WebSocket client seam and native implementation.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use adapter::WebSocketTcpConnectionAdapter;
pub use connection::{ConnectionHandler, InactivityCallback, TcpConnection};
pub use stomp_client::{
    DEFAULT_INBOUND_MESSAGE_SIZE_LIMIT, DEFAULT_SCHEDULED_HEARTBEAT, WebSocketStompClient,
};
pub use websocket::{StandardWebSocketClient, WebSocketClient};

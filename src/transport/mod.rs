//! WebSocket transport layer.
//!
//! Everything above this module talks to a [`WebSocketSession`] and
//! implements [`WebSocketHandler`]; this module supplies the native
//! tokio-tungstenite implementations and the back-pressure decorator.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   upgrade   ┌─────────────────────┐
//! │ WebSocket    │────────────►│ WebSocketConnection │
//! │ Server       │             │  reader ─► handler  │
//! └──────────────┘             │  writer ◄─ session  │
//!                              └─────────────────────┘
//!                                        ▲
//!                              ┌─────────┴───────────┐
//!                              │ ConcurrentSend      │
//!                              │ Session (decorator) │
//!                              └─────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Transport messages and close statuses |
//! | `session` | Session trait and transport kinds |
//! | `handler` | Lifecycle callback trait |
//! | `decorator` | Send serialization and back-pressure |
//! | `connection` | Session over a tungstenite stream |
//! | `server` | Accept loop and sub-protocol negotiation |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket session over a tungstenite stream.
pub mod connection;

/// Send-serializing session decorator.
pub mod decorator;

/// WebSocket lifecycle callbacks.
pub mod handler;

/// Transport messages and close statuses.
pub mod message;

/// WebSocket server.
pub mod server;

/// Session abstraction.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{ConnectionInfo, DEFAULT_MESSAGE_SIZE_LIMIT, WebSocketConnection};
pub use decorator::{ConcurrentSendSession, OverflowStrategy};
pub use handler::WebSocketHandler;
pub use message::{CloseStatus, WebSocketMessage};
pub use server::{PrincipalResolver, WebSocketServer, WebSocketServerBuilder};
pub use session::{SessionKind, WebSocketSession};

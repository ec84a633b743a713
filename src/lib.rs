//! STOMP over WebSocket and SockJS.
//!
//! This library implements the STOMP sub-protocol layer that sits between
//! WebSocket sessions and an external message-routing layer, plus a client
//! that reaches STOMP servers over a native WebSocket or SockJS fallback
//! transports.
//!
//! # Architecture
//!
//! The server side is a pipeline of handlers:
//!
//! - **Transport**: [`WebSocketServer`] accepts connections and negotiates a
//!   sub-protocol; sessions are decorated with a send-serializing
//!   [`ConcurrentSendSession`]
//! - **Multiplexer**: [`SubProtocolWebSocketHandler`] keeps the session
//!   registry, routes outbound messages and closes silent sessions
//! - **Protocol**: [`StompSubProtocolHandler`] decodes frames into
//!   [`Message`]s for the routing layer and encodes replies
//!
//! The client side connects through a [`WebSocketClient`], either
//! [`StandardWebSocketClient`] or [`SockJsClient`]:
//!
//! - **STOMP**: [`WebSocketStompClient`] sends CONNECT and negotiates
//!   heartbeats
//! - **SockJS**: [`SockJsClient`] fetches `/info` and tries WebSocket, then
//!   XHR streaming, then XHR polling, falling back on failure or timeout
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use stomp_websocket::{
//!     Result, StompSubProtocolHandler, SubProtocolWebSocketHandler, UnboundedMessageChannel,
//!     WebSocketHandler, WebSocketServer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Messages decoded from clients arrive on `inbound_rx`
//!     let (inbound, mut inbound_rx) = UnboundedMessageChannel::new();
//!     let handler = SubProtocolWebSocketHandler::builder(Arc::new(inbound))
//!         .with_handler(Arc::new(StompSubProtocolHandler::new()))
//!         .build()?;
//!
//!     // Replies from the routing layer are sent to `outbound_tx`
//!     let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
//!     handler.start(outbound_rx);
//!
//!     let addr: SocketAddr = "127.0.0.1:61613".parse().expect("valid address");
//!     let server = WebSocketServer::builder(Arc::clone(&handler) as Arc<dyn WebSocketHandler>)
//!         .with_sub_protocols(handler.sub_protocols())
//!         .bind(addr)
//!         .await?;
//!     println!("Listening on {}", server.ws_url("/stomp"));
//!
//!     while let Some(message) = inbound_rx.recv().await {
//!         println!("{:?}", message.headers().command());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | STOMP client and WebSocket client seam |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`handler`] | Sub-protocol handlers and the session multiplexer |
//! | [`identifiers`] | Session ids, principals and attributes |
//! | [`protocol`] | STOMP frame model and codec |
//! | [`scheduler`] | Task scheduling for heartbeats and timeouts |
//! | [`sockjs`] | SockJS framing, server session and client |
//! | [`transport`] | WebSocket sessions, decorator and server |

// ============================================================================
// Modules
// ============================================================================

/// STOMP client over WebSocket and SockJS.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Sub-protocol handlers and the session multiplexer.
pub mod handler;

/// Session ids, principals and attributes.
pub mod identifiers;

/// STOMP frame model and codec.
pub mod protocol;

/// Task scheduling.
pub mod scheduler;

/// SockJS framing, server session and client.
pub mod sockjs;

/// WebSocket transport layer.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    ConnectionHandler, StandardWebSocketClient, TcpConnection, WebSocketClient,
    WebSocketStompClient, WebSocketTcpConnectionAdapter,
};

// Error types
pub use error::{Error, Result};

// Handler types
pub use handler::{
    MessageChannel, StompSubProtocolHandler, SubProtocolHandler, SubProtocolWebSocketHandler,
    TransportOptions, UnboundedMessageChannel,
};

// Identifier types
pub use identifiers::{Principal, SessionAttributes, SessionId};

// Protocol types
pub use protocol::{
    BufferingStompDecoder, HeartBeat, Message, MessageHeaders, MessageType, StompCommand,
    StompDecoder, StompEncoder, StompHeaders,
};

// Scheduling types
pub use scheduler::{ScheduledTask, TaskScheduler, TokioTaskScheduler};

// SockJS types
pub use sockjs::{SockJsClient, WebSocketTransport, XhrTransport};

// Transport types
pub use transport::{
    CloseStatus, ConcurrentSendSession, SessionKind, WebSocketConnection, WebSocketHandler,
    WebSocketMessage, WebSocketServer, WebSocketSession,
};

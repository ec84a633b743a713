//! SockJS client.
//!
//! [`SockJsClient`] fetches `/info`, builds an ordered chain of
//! [`TransportRequest`]s and resolves with the first transport that
//! connects:
//!
//! | Transport | Types |
//! |-----------|-------|
//! | [`WebSocketTransport`] | `websocket` |
//! | [`XhrTransport`] | `xhr_streaming`, `xhr` |

// ============================================================================
// Submodules
// ============================================================================

pub mod info;
pub mod request;
pub mod session;
pub mod sockjs_client;
pub mod transport;
pub mod url;
pub mod websocket;
pub mod xhr;

// ============================================================================
// Re-exports
// ============================================================================

pub use info::{InfoReceiver, RestInfoReceiver, ServerInfo, ServerInfoEntry};
pub use request::{ConnectResult, TransportRequest};
pub use session::ClientSockJsSession;
pub use sockjs_client::{SockJsClient, SockJsClientBuilder};
pub use transport::Transport;
pub use url::{SockJsUrlInfo, TransportType};
pub use websocket::WebSocketTransport;
pub use xhr::XhrTransport;

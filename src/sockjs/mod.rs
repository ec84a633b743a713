//! SockJS support.
//!
//! SockJS emulates a WebSocket over a set of transports. Every transport
//! carries the same frames:
//!
//! | Frame | Meaning |
//! |-------|---------|
//! | `o` | Session open |
//! | `h` | Heartbeat |
//! | `a["m1","m2"]` | Messages |
//! | `c[3000,"Go away!"]` | Close with status |

// ============================================================================
// Submodules
// ============================================================================

pub mod client;
pub mod frame;
pub mod server_session;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{
    ClientSockJsSession, InfoReceiver, RestInfoReceiver, SockJsClient, SockJsClientBuilder,
    SockJsUrlInfo, Transport, TransportRequest, TransportType, WebSocketTransport, XhrTransport,
};
pub use frame::{SockJsFrame, SockJsFrameType};
pub use server_session::{DEFAULT_HEARTBEAT_TIME, SockJsServerSession, SockJsWebSocketHandler};

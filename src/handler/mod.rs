//! Sub-protocol handling on top of the transport layer.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | Message channels to the routing layer |
//! | `sub_protocol` | Protocol adapter trait |
//! | `stomp` | STOMP adapter |
//! | `multiplex` | Session registry and protocol dispatch |

// ============================================================================
// Submodules
// ============================================================================

/// Message channels to the routing layer.
pub mod channel;

/// Session registry and protocol dispatch.
pub mod multiplex;

/// STOMP adapter.
pub mod stomp;

/// Protocol adapter trait.
pub mod sub_protocol;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{MessageChannel, UnboundedMessageChannel};
pub use multiplex::{
    HandlerStats, HandlerStatsSnapshot, SubProtocolWebSocketHandler,
    SubProtocolWebSocketHandlerBuilder, TransportOptions,
};
pub use stomp::{
    DefaultStompErrorHandler, StompErrorHandler, StompSessionEvent, StompSessionEventListener,
    StompStats, StompStatsSnapshot, StompSubProtocolHandler,
};
pub use sub_protocol::SubProtocolHandler;

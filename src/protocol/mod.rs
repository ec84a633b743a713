//! STOMP frame model and codec.
//!
//! # Wire Format
//!
//! ```text
//! COMMAND
//! name:value
//! ...
//!
//! payload^@
//! ```
//!
//! | Frame part | Rule |
//! |------------|------|
//! | Command | One line, case-sensitive |
//! | Headers | Ordered, multi-valued, case-sensitive |
//! | Escaping | `\\`, `\n`, `\r`, `\c` except for CONNECT, STOMP and CONNECTED |
//! | Body | `content-length` bytes, or up to the first NUL |
//! | Heartbeat | A lone `\n` or `\r\n` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Commands and routing-layer message types |
//! | `headers` | Native header list and heartbeat values |
//! | `message` | Decoded message with out-of-band metadata |
//! | `codec` | Frame encoder and decoder |
//! | `buffering` | Size-bounded reassembling decoder |

// ============================================================================
// Submodules
// ============================================================================

/// Size-bounded reassembling decoder.
pub mod buffering;

/// Frame encoder and decoder.
pub mod codec;

/// STOMP commands and message types.
pub mod command;

/// Native STOMP headers.
pub mod headers;

/// Decoded messages.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use buffering::BufferingStompDecoder;
pub use codec::{StompDecoder, StompEncoder};
pub use command::{MessageType, StompCommand};
pub use headers::{HeartBeat, StompHeaders};
pub use message::{Message, MessageHeaders, UserChangeCallback};

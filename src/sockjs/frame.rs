//! SockJS frames and message codec.
//!
//! | Frame | Content |
//! |-------|---------|
//! | Open | `o` |
//! | Heartbeat | `h` |
//! | Message | `a["msg1","msg2"]` |
//! | Close | `c[3000,"Go away!"]` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::transport::CloseStatus;

// ============================================================================
// SockJsFrameType
// ============================================================================

/// Kind of a SockJS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockJsFrameType {
    Open,
    Heartbeat,
    Message,
    Close,
}

// ============================================================================
// SockJsFrame
// ============================================================================

/// A SockJS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockJsFrame {
    frame_type: SockJsFrameType,
    content: String,
}

impl SockJsFrame {
    /// Open frame.
    #[must_use]
    pub fn open() -> Self {
        Self {
            frame_type: SockJsFrameType::Open,
            content: "o".to_owned(),
        }
    }

    /// Heartbeat frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            frame_type: SockJsFrameType::Heartbeat,
            content: "h".to_owned(),
        }
    }

    /// Message frame carrying `messages` as an escaped JSON array.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if encoding fails.
    pub fn message<S: AsRef<str>>(messages: &[S]) -> Result<Self> {
        Ok(Self {
            frame_type: SockJsFrameType::Message,
            content: format!("a{}", encode_messages(messages)?),
        })
    }

    /// Close frame for `status`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if encoding the reason fails.
    pub fn close(status: &CloseStatus) -> Result<Self> {
        let reason = serde_json::to_string(status.reason())?;
        Ok(Self {
            frame_type: SockJsFrameType::Close,
            content: format!("c[{},{reason}]", status.code),
        })
    }

    /// Parses a received frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] for an empty or unknown frame.
    pub fn parse(content: &str) -> Result<Self> {
        let frame_type = match content.as_bytes().first() {
            Some(b'o') if content.len() == 1 => SockJsFrameType::Open,
            Some(b'h') if content.len() == 1 => SockJsFrameType::Heartbeat,
            Some(b'a') => SockJsFrameType::Message,
            Some(b'c') => SockJsFrameType::Close,
            _ => {
                return Err(Error::framing(format!("Unexpected SockJS frame: {content:?}")));
            }
        };
        Ok(Self {
            frame_type,
            content: content.to_owned(),
        })
    }

    /// Returns the frame type.
    #[inline]
    #[must_use]
    pub fn frame_type(&self) -> SockJsFrameType {
        self.frame_type
    }

    /// Returns the full frame content.
    #[inline]
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns the content after the type character.
    #[must_use]
    pub fn frame_data(&self) -> Option<&str> {
        match self.frame_type {
            SockJsFrameType::Message | SockJsFrameType::Close => self.content.get(1..),
            _ => None,
        }
    }

    /// Decodes the messages of a message frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] if this is not a message frame and
    /// [`Error::Json`] for a malformed array.
    pub fn messages(&self) -> Result<Vec<String>> {
        match (self.frame_type, self.frame_data()) {
            (SockJsFrameType::Message, Some(data)) => decode_messages(data),
            _ => Err(Error::framing("Not a SockJS message frame")),
        }
    }

    /// Decodes the status of a close frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] if this is not a close frame.
    pub fn close_status(&self) -> Result<CloseStatus> {
        let data = match (self.frame_type, self.frame_data()) {
            (SockJsFrameType::Close, Some(data)) => data,
            _ => return Err(Error::framing("Not a SockJS close frame")),
        };
        let (code, reason): (u16, Option<String>) = serde_json::from_str(data)
            .map_err(|e| Error::framing(format!("Invalid SockJS close frame {data:?}: {e}")))?;
        Ok(match reason.filter(|r| !r.is_empty()) {
            Some(reason) => CloseStatus::new(code).with_reason(reason),
            None => CloseStatus::new(code),
        })
    }
}

impl fmt::Display for SockJsFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

// ============================================================================
// Message Codec
// ============================================================================

/// Encodes messages as a JSON array, escaping characters some browsers
/// mangle.
///
/// # Errors
///
/// Returns [`Error::Json`] if serialization fails.
pub fn encode_messages<S: AsRef<str>>(messages: &[S]) -> Result<String> {
    let strings: Vec<&str> = messages.iter().map(AsRef::as_ref).collect();
    let json = serde_json::to_string(&strings)?;

    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if needs_escape(c) {
            let _ = write!(out, "\\u{:04x}", c as u32);
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Decodes a JSON array of strings.
///
/// # Errors
///
/// Returns [`Error::Json`] for anything but an array of strings.
pub fn decode_messages(content: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(content)?)
}

fn needs_escape(c: char) -> bool {
    matches!(c,
        '\u{0000}'..='\u{001F}'
        | '\u{200C}'..='\u{200F}'
        | '\u{2028}'..='\u{202F}'
        | '\u{2060}'..='\u{206F}'
        | '\u{FFF0}'..='\u{FFFF}')
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frames() {
        assert_eq!(SockJsFrame::open().content(), "o");
        assert_eq!(SockJsFrame::heartbeat().content(), "h");
        assert_eq!(
            SockJsFrame::close(&CloseStatus::new(3000).with_reason("Go away!"))
                .unwrap()
                .content(),
            "c[3000,\"Go away!\"]"
        );
        assert_eq!(
            SockJsFrame::close(&CloseStatus::NORMAL).unwrap().content(),
            "c[1000,\"\"]"
        );
    }

    #[test]
    fn test_message_frame_escapes() {
        let frame = SockJsFrame::message(&["a\u{2028}b", "CONNECT\n\n\0"]).unwrap();

        assert_eq!(frame.content(), "a[\"a\\u2028b\",\"CONNECT\\n\\n\\u0000\"]");
        assert_eq!(frame.messages().unwrap(), vec!["a\u{2028}b", "CONNECT\n\n\0"]);
    }

    #[test]
    fn test_parse() {
        assert_eq!(SockJsFrame::parse("o").unwrap().frame_type(), SockJsFrameType::Open);
        assert_eq!(SockJsFrame::parse("h").unwrap().frame_type(), SockJsFrameType::Heartbeat);

        let close = SockJsFrame::parse("c[3000,\"Go away!\"]").unwrap();
        let status = close.close_status().unwrap();
        assert_eq!(status.code, 3000);
        assert_eq!(status.reason(), "Go away!");

        assert!(SockJsFrame::parse("").is_err());
        assert!(SockJsFrame::parse("x").is_err());
        assert!(SockJsFrame::parse("a[1,2]").unwrap().messages().is_err());
    }
}

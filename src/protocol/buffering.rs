//! Size-bounded decoder that reassembles frames split across chunks.

// ============================================================================
// Imports
// ============================================================================

use bytes::BytesMut;
use tracing::trace;

use crate::error::{Error, Result};

use super::codec::StompDecoder;
use super::message::Message;

// ============================================================================
// BufferingStompDecoder
// ============================================================================

/// Per-session decoder that buffers partial frames up to a byte limit.
///
/// Chunks are appended to an internal buffer and complete frames are
/// returned as soon as they are available. Exceeding the limit is fatal to
/// the session; the decoder keeps no recovery state.
#[derive(Debug)]
pub struct BufferingStompDecoder {
    decoder: StompDecoder,
    buffer_size_limit: usize,
    buffer: BytesMut,
    expected_content_length: Option<usize>,
}

impl BufferingStompDecoder {
    /// Creates a decoder with the given buffer limit in bytes.
    #[must_use]
    pub fn new(decoder: StompDecoder, buffer_size_limit: usize) -> Self {
        Self {
            decoder,
            buffer_size_limit,
            buffer: BytesMut::new(),
            expected_content_length: None,
        }
    }

    /// Returns the buffer limit in bytes.
    #[inline]
    #[must_use]
    pub fn buffer_size_limit(&self) -> usize {
        self.buffer_size_limit
    }

    /// Returns the number of bytes currently buffered.
    #[inline]
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the `content-length` of the buffered partial frame, if known.
    #[inline]
    #[must_use]
    pub fn expected_content_length(&self) -> Option<usize> {
        self.expected_content_length
    }

    /// Appends a chunk and decodes every frame it completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] when the buffered data or an announced
    /// `content-length` exceeds the limit, or when the data is malformed.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(chunk);
        self.check_buffer_limits()?;

        if let Some(expected) = self.expected_content_length
            && self.buffer.len() < expected
        {
            trace!(
                buffered = self.buffer.len(),
                expected, "Waiting for remaining frame body"
            );
            return Ok(Vec::new());
        }

        let mut partial = None;
        let messages = self.decoder.decode_partial(&mut self.buffer, &mut partial)?;
        self.expected_content_length = partial.and_then(|headers| headers.content_length());
        self.check_buffer_limits()?;

        Ok(messages)
    }

    fn check_buffer_limits(&self) -> Result<()> {
        if let Some(expected) = self.expected_content_length
            && expected > self.buffer_size_limit
        {
            return Err(Error::framing(format!(
                "STOMP 'content-length' header value {expected} exceeds configured buffer size limit {}",
                self.buffer_size_limit
            )));
        }
        if self.buffer.len() > self.buffer_size_limit {
            return Err(Error::framing(format!(
                "The configured STOMP buffer size limit of {} bytes has been exceeded",
                self.buffer_size_limit
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::StompCommand;

    fn decoder(limit: usize) -> BufferingStompDecoder {
        BufferingStompDecoder::new(StompDecoder::new(), limit)
    }

    #[test]
    fn test_announced_content_length_over_limit() {
        let error = decoder(64 * 1024)
            .decode(b"SEND\ncontent-length:18446744073709551615\n\nabc")
            .unwrap_err();
        assert!(error.is_framing_error());

        let mut decoder = decoder(64 * 1024);
        let error = decoder
            .decode(b"SEND\ncontent-length:1000000\n\nabc")
            .unwrap_err();
        assert!(error.is_framing_error());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut decoder = decoder(1024);

        assert!(decoder.decode(b"SEND\ndestina").unwrap().is_empty());
        assert!(decoder.decode(b"tion:/q\n\nhel").unwrap().is_empty());
        let messages = decoder.decode(b"lo\0").unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].headers().command(), Some(StompCommand::Send));
        assert_eq!(&messages[0].payload()[..], b"hello");
        assert_eq!(decoder.buffer_size(), 0);
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let mut decoder = decoder(1024);
        let messages = decoder
            .decode(b"SEND\ndestination:/a\n\n1\0SEND\ndestination:/b\n\n2\0SEND\n")
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(decoder.buffer_size(), 5);
    }

    #[test]
    fn test_waits_for_announced_content_length() {
        let mut decoder = decoder(1024);

        assert!(decoder.decode(b"SEND\ncontent-length:8\n\nab").unwrap().is_empty());
        assert_eq!(decoder.expected_content_length(), Some(8));
        assert!(decoder.decode(b"cd").unwrap().is_empty());

        let messages = decoder.decode(b"efgh\0").unwrap();
        assert_eq!(&messages[0].payload()[..], b"abcdefgh");
        assert_eq!(decoder.expected_content_length(), None);
    }

    #[test]
    fn test_partial_frame_over_limit_fails() {
        let mut decoder = decoder(32);
        let partial = b"SEND\ndestination:/queue/a-very-long-name\n";

        let err = decoder.decode(partial).unwrap_err();
        assert!(err.is_framing_error());
    }

    #[test]
    fn test_partial_frame_under_limit_is_buffered() {
        let mut decoder = decoder(64);
        let partial = b"SEND\ndestination:/queue/a-very-long-name\n";

        assert!(decoder.decode(partial).unwrap().is_empty());
        assert_eq!(decoder.buffer_size(), partial.len());
    }

    #[test]
    fn test_content_length_over_limit_fails() {
        let mut decoder = decoder(64);

        let err = decoder
            .decode(b"SEND\ncontent-length:65\n\nabc")
            .unwrap_err();
        assert!(err.is_framing_error());
    }
}

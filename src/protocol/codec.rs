//! STOMP frame encoder and decoder.
//!
//! Wire format: `COMMAND\nname:value\n...\n\npayload\0`. A lone EOL is a
//! heartbeat. Bodies are delimited by `content-length` when present,
//! otherwise by the first NUL octet.
//!
//! Decoding consumes every complete frame at the front of the buffer and
//! leaves a trailing partial frame in place for the next call.

// ============================================================================
// Imports
// ============================================================================

use std::str;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};

use super::command::StompCommand;
use super::headers::{CONTENT_LENGTH, StompHeaders};
use super::message::{Message, MessageHeaders};

// ============================================================================
// Constants
// ============================================================================

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const COLON: u8 = b':';
const NUL: u8 = 0;

/// Encoded heartbeat frame.
pub const HEARTBEAT_PAYLOAD: &[u8] = b"\n";

// ============================================================================
// Line Scanning
// ============================================================================

/// Result of looking for an end-of-line at a position.
enum Eol {
    /// EOL of the given length.
    Found(usize),
    /// Some other byte.
    None,
    /// Buffer ends in the middle of a possible EOL.
    Incomplete,
}

fn eol_at(data: &[u8], pos: usize) -> Result<Eol> {
    match data.get(pos) {
        Some(&LF) => Ok(Eol::Found(1)),
        Some(&CR) => match data.get(pos + 1) {
            Some(&LF) => Ok(Eol::Found(2)),
            Some(_) => Err(Error::framing("'\\r' must be followed by '\\n'")),
            None => Ok(Eol::Incomplete),
        },
        Some(_) => Ok(Eol::None),
        None => Ok(Eol::Incomplete),
    }
}

/// Skips consecutive EOLs starting at `pos`.
fn skip_eols(data: &[u8], mut pos: usize) -> Result<usize> {
    while let Eol::Found(len) = eol_at(data, pos)? {
        pos += len;
    }
    Ok(pos)
}

/// Reads one line, returning `(line, position after EOL)`.
fn read_line(data: &[u8], start: usize) -> Result<Option<(&[u8], usize)>> {
    let mut pos = start;
    while pos < data.len() {
        match eol_at(data, pos)? {
            Eol::Found(len) => return Ok(Some((&data[start..pos], pos + len))),
            Eol::Incomplete => return Ok(None),
            Eol::None => pos += 1,
        }
    }
    Ok(None)
}

// ============================================================================
// Escaping
// ============================================================================

fn unescape(input: &str) -> Result<String> {
    if !input.contains('\\') {
        return Ok(input.to_owned());
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices();
    while let Some((index, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next().map(|(_, c)| c) {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => {
                return Err(Error::framing(format!(
                    "Illegal escape sequence at index {index}: {input}"
                )));
            }
        }
    }
    Ok(out)
}

fn put_escaped(out: &mut BytesMut, input: &str, escape: bool) {
    if !escape {
        out.put_slice(input.as_bytes());
        return;
    }
    for byte in input.bytes() {
        match byte {
            b'\\' => out.put_slice(b"\\\\"),
            b':' => out.put_slice(b"\\c"),
            b'\n' => out.put_slice(b"\\n"),
            b'\r' => out.put_slice(b"\\r"),
            other => out.put_u8(other),
        }
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| Error::framing(format!("Invalid UTF-8 in STOMP {what}: {e}")))
}

// ============================================================================
// StompDecoder
// ============================================================================

/// Outcome of decoding a single frame.
enum Step {
    /// A complete message and the number of bytes it occupied.
    Frame(Message),
    /// Not enough data; headers parsed so far, if any.
    Incomplete(Option<StompHeaders>),
}

/// Decodes STOMP frames from a byte buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct StompDecoder;

impl StompDecoder {
    /// Creates a decoder.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decodes all complete frames at the front of `buffer`.
    ///
    /// Consumed bytes are removed from the buffer; a trailing partial frame
    /// is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] for malformed frame data.
    pub fn decode(&self, buffer: &mut BytesMut) -> Result<Vec<Message>> {
        self.decode_partial(buffer, &mut None)
    }

    /// Like [`decode`](Self::decode), also reporting the headers of a
    /// trailing partial frame through `partial_headers`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] for malformed frame data.
    pub fn decode_partial(
        &self,
        buffer: &mut BytesMut,
        partial_headers: &mut Option<StompHeaders>,
    ) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        while !buffer.is_empty() {
            match Self::decode_message(buffer)? {
                Step::Frame(message) => {
                    messages.push(message);
                    let skip = skip_eols(buffer, 0)?;
                    let _ = buffer.split_to(skip);
                    *partial_headers = None;
                }
                Step::Incomplete(headers) => {
                    trace!(buffered = buffer.len(), "Incomplete frame, waiting for more data");
                    *partial_headers = headers;
                    break;
                }
            }
        }

        Ok(messages)
    }

    fn decode_message(buffer: &mut BytesMut) -> Result<Step> {
        let data: &[u8] = buffer;
        let start = skip_eols(data, 0)?;

        if start == data.len() {
            let _ = buffer.split_to(start);
            trace!("Decoded heartbeat");
            return Ok(Step::Frame(Message::heartbeat()));
        }

        let Some((command_line, mut pos)) = read_line(data, start)? else {
            let _ = buffer.split_to(start);
            return Ok(Step::Incomplete(None));
        };
        let command: StompCommand = utf8(command_line, "command")?.parse()?;
        let escaped = command.escapes_headers();

        let mut native = StompHeaders::new();
        loop {
            let Some((line, next)) = read_line(data, pos)? else {
                return Ok(Step::Incomplete(Some(native)));
            };
            pos = next;
            if line.is_empty() {
                break;
            }

            let line = utf8(line, "header")?;
            let colon = line.find(':').filter(|&i| i > 0).ok_or_else(|| {
                Error::framing(format!(
                    "Illegal header: '{line}'. A header must be of the form <name>:[<value>]."
                ))
            })?;
            let (name, value) = (&line[..colon], &line[colon + 1..]);
            if escaped {
                native.add(unescape(name)?, unescape(value)?);
            } else {
                native.add(name, value);
            }
        }

        let body = match native.content_length() {
            Some(length) => {
                let end = pos.checked_add(length).ok_or_else(|| {
                    Error::framing(format!("Invalid content-length: {length}"))
                })?;
                if data.len() <= end {
                    return Ok(Step::Incomplete(Some(native)));
                }
                if data[end] != NUL {
                    return Err(Error::framing("Frame must be terminated with a null octet"));
                }
                pos..end
            }
            None => match data[pos..].iter().position(|&b| b == NUL) {
                Some(offset) => pos..pos + offset,
                None => return Ok(Step::Incomplete(Some(native))),
            },
        };

        if !body.is_empty() && !command.is_body_allowed() {
            return Err(Error::framing(format!(
                "{command} shouldn't have a payload: length={}",
                body.len()
            )));
        }

        let consumed = body.end + 1;
        let frame = buffer.split_to(consumed).freeze();
        let payload = frame.slice(body);

        let mut headers = MessageHeaders::with_native(command, native);
        if command.is_connect() || command == StompCommand::Connected {
            let heartbeat = headers.native().heartbeat();
            if let Some(heartbeat) = heartbeat {
                headers.set_heartbeat(heartbeat);
            }
        }

        Ok(Step::Frame(Message::new(headers, payload)))
    }
}

// ============================================================================
// StompEncoder
// ============================================================================

/// Encodes messages into STOMP frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct StompEncoder;

impl StompEncoder {
    /// Creates an encoder.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encodes a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Processing`] if the headers carry no command.
    pub fn encode_message(&self, message: &Message) -> Result<Bytes> {
        self.encode(message.headers(), message.payload())
    }

    /// Encodes headers and payload into a frame.
    ///
    /// Header order is preserved. For SEND, MESSAGE and ERROR the
    /// `content-length` header always reflects the payload: an existing
    /// header is rewritten in place, otherwise one is appended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Processing`] if the headers carry no command.
    pub fn encode(&self, headers: &MessageHeaders, payload: &[u8]) -> Result<Bytes> {
        if headers.is_heartbeat() {
            trace!("Encoding heartbeat");
            return Ok(Bytes::from_static(HEARTBEAT_PAYLOAD));
        }

        let command = headers
            .command()
            .ok_or_else(|| Error::processing(format!("No STOMP command in {headers:?}")))?;

        let native = headers.native();
        let mut out = BytesMut::with_capacity(128 + payload.len());
        out.put_slice(command.as_str().as_bytes());
        out.put_u8(LF);

        let escape = command.escapes_headers();
        let mut length_written = false;
        for (name, value) in native.iter() {
            if command.requires_content_length() && name == CONTENT_LENGTH {
                if !length_written {
                    Self::put_content_length(&mut out, payload.len());
                    length_written = true;
                }
                continue;
            }
            put_escaped(&mut out, name, escape);
            out.put_u8(COLON);
            put_escaped(&mut out, value, escape);
            out.put_u8(LF);
        }
        if command.requires_content_length() && !length_written {
            Self::put_content_length(&mut out, payload.len());
        }

        out.put_u8(LF);
        out.put_slice(payload);
        out.put_u8(NUL);

        Ok(out.freeze())
    }

    fn put_content_length(out: &mut BytesMut, length: usize) {
        out.put_slice(CONTENT_LENGTH.as_bytes());
        out.put_u8(COLON);
        out.put_slice(length.to_string().as_bytes());
        out.put_u8(LF);
    }
}

// ============================================================================
// Tests
// ============================================================================

//! STOMP sub-protocol handler.
//!
//! Translates between WebSocket messages and decoded STOMP messages for the
//! server side of a session.
//!
//! # Session Lifecycle
//!
//! ```text
//! STARTED ──CONNECT──► CONNECTED ──DISCONNECT / close──► ENDED
//! ```
//!
//! | Routing-layer message | Frame sent to client |
//! |-----------------------|----------------------|
//! | `ConnectAck` | CONNECTED with negotiated version and heartbeat |
//! | `DisconnectAck` | RECEIPT if the DISCONNECT had a receipt, else ERROR |
//! | `Heartbeat` | `\n` |
//! | SEND or no command | MESSAGE |
//! | MESSAGE with `original-destination` | MESSAGE with destination restored |
//!
//! # Errors
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | Malformed inbound frame | ERROR frame, then protocol-error close |
//! | Routing layer rejects a message | ERROR frame via [`StompErrorHandler`], session stays open |
//! | ERROR frame from routing layer | Delivered, then protocol-error close |
//! | Write failure | Protocol-error close |
//! | Session limit exceeded | Propagated to the caller |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{Principal, SessionId};
use crate::protocol::headers::{
    APPLICATION_OCTET_STREAM, MESSAGE_ID, ORIGINAL_DESTINATION, USER_NAME, VERSION,
};
use crate::protocol::{
    BufferingStompDecoder, HeartBeat, Message, MessageHeaders, MessageType, StompCommand,
    StompDecoder, StompEncoder,
};
use crate::transport::{CloseStatus, SessionKind, WebSocketMessage, WebSocketSession};

use super::channel::MessageChannel;
use super::sub_protocol::SubProtocolHandler;

// ============================================================================
// Constants
// ============================================================================

/// Protocol names advertised during the WebSocket handshake.
pub const SUPPORTED_PROTOCOLS: [&str; 3] = ["v10.stomp", "v11.stomp", "v12.stomp"];

/// Lower bound applied to the session's text message size limit.
pub const MINIMUM_WEBSOCKET_MESSAGE_SIZE: usize = 16 * 1024 + 256;

/// Default limit for a buffered STOMP frame.
pub const DEFAULT_MESSAGE_SIZE_LIMIT: usize = 64 * 1024;

// ============================================================================
// StompErrorHandler
// ============================================================================

/// Customizes ERROR frames sent to clients.
pub trait StompErrorHandler: Send + Sync {
    /// Builds the ERROR frame for a failure while handling a client frame.
    ///
    /// `client_headers` is `None` when the frame could not be decoded.
    /// Returning `None` suppresses the ERROR frame.
    fn handle_client_message_processing_error(
        &self,
        client_headers: Option<&MessageHeaders>,
        error: &Error,
    ) -> Option<Message>;

    /// Post-processes an ERROR frame produced by the routing layer.
    fn handle_error_message_to_client(&self, error_message: Message) -> Message {
        error_message
    }
}

/// Default [`StompErrorHandler`].
///
/// Puts the error text in the `message` header and echoes the client's
/// `receipt` as `receipt-id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStompErrorHandler;

impl StompErrorHandler for DefaultStompErrorHandler {
    fn handle_client_message_processing_error(
        &self,
        client_headers: Option<&MessageHeaders>,
        error: &Error,
    ) -> Option<Message> {
        let mut headers = MessageHeaders::stomp(StompCommand::Error);
        headers.native_mut().set_message(error.to_string());
        if let Some(receipt) = client_headers.and_then(|h| h.native().receipt()) {
            let receipt = receipt.to_owned();
            headers.native_mut().set_receipt_id(receipt);
        }
        Some(Message::empty(headers))
    }
}

// ============================================================================
// Session Events
// ============================================================================

/// STOMP session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompSessionEvent {
    /// A CONNECT frame was forwarded.
    Connect {
        session_id: SessionId,
        user: Option<Principal>,
    },
    /// A CONNECTED frame was sent.
    Connected {
        session_id: SessionId,
        user: Option<Principal>,
    },
    /// A SUBSCRIBE frame was forwarded.
    Subscribe {
        session_id: SessionId,
        user: Option<Principal>,
        destination: Option<String>,
        subscription_id: Option<String>,
    },
    /// An UNSUBSCRIBE frame was forwarded.
    Unsubscribe {
        session_id: SessionId,
        user: Option<Principal>,
        subscription_id: Option<String>,
    },
    /// The session ended.
    Disconnect {
        session_id: SessionId,
        user: Option<Principal>,
        status: CloseStatus,
    },
}

/// Receives [`StompSessionEvent`]s.
pub trait StompSessionEventListener: Send + Sync {
    /// Called for each event.
    fn on_event(&self, event: StompSessionEvent);
}

impl<F> StompSessionEventListener for F
where
    F: Fn(StompSessionEvent) + Send + Sync,
{
    fn on_event(&self, event: StompSessionEvent) {
        self(event);
    }
}

// ============================================================================
// StompStats
// ============================================================================

/// Counters of processed CONNECT, CONNECTED and DISCONNECT frames.
#[derive(Debug, Default)]
pub struct StompStats {
    connect: AtomicU64,
    connected: AtomicU64,
    disconnect: AtomicU64,
}

/// Point-in-time copy of [`StompStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StompStatsSnapshot {
    pub connect: u64,
    pub connected: u64,
    pub disconnect: u64,
}

impl StompStats {
    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StompStatsSnapshot {
        StompStatsSnapshot {
            connect: self.connect.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            disconnect: self.disconnect.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StompStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot();
        write!(
            f,
            "processed CONNECT({})-CONNECTED({})-DISCONNECT({})",
            s.connect, s.connected, s.disconnect
        )
    }
}

// ============================================================================
// StompSession
// ============================================================================

/// Per-session state.
struct StompSession {
    decoder: Mutex<BufferingStompDecoder>,
    /// Principal set by the routing layer on CONNECT; overrides the
    /// transport principal until the session ends.
    authenticated_user: Mutex<Option<Principal>>,
}

// ============================================================================
// StompSubProtocolHandler
// ============================================================================

/// [`SubProtocolHandler`] for STOMP 1.0 to 1.2.
pub struct StompSubProtocolHandler {
    decoder: StompDecoder,
    encoder: StompEncoder,
    message_size_limit: usize,
    error_handler: Arc<dyn StompErrorHandler>,
    event_listener: Option<Arc<dyn StompSessionEventListener>>,
    sessions: RwLock<FxHashMap<SessionId, Arc<StompSession>>>,
    message_id_counter: AtomicU64,
    stats: StompStats,
}

impl Default for StompSubProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StompSubProtocolHandler {
    /// Creates a handler with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoder: StompDecoder::new(),
            encoder: StompEncoder::new(),
            message_size_limit: DEFAULT_MESSAGE_SIZE_LIMIT,
            error_handler: Arc::new(DefaultStompErrorHandler),
            event_listener: None,
            sessions: RwLock::new(FxHashMap::default()),
            message_id_counter: AtomicU64::new(0),
            stats: StompStats::default(),
        }
    }

    /// Sets the maximum size of a buffered STOMP frame.
    #[must_use]
    pub fn with_message_size_limit(mut self, limit: usize) -> Self {
        self.message_size_limit = limit;
        self
    }

    /// Sets the error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn StompErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Sets the session event listener.
    #[must_use]
    pub fn with_event_listener(mut self, listener: Arc<dyn StompSessionEventListener>) -> Self {
        self.event_listener = Some(listener);
        self
    }

    /// Returns the frame size limit.
    #[inline]
    #[must_use]
    pub fn message_size_limit(&self) -> usize {
        self.message_size_limit
    }

    /// Returns the frame counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &StompStats {
        &self.stats
    }

    /// Returns the number of sessions with decoder state.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn session_state(&self, session_id: &SessionId) -> Option<Arc<StompSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Returns the CONNECT principal override, else the transport principal.
    fn user(&self, session: &Arc<dyn WebSocketSession>) -> Option<Principal> {
        self.session_state(session.id())
            .and_then(|state| state.authenticated_user.lock().clone())
            .or_else(|| session.principal())
    }

    fn publish(&self, event: StompSessionEvent) {
        if let Some(ref listener) = self.event_listener {
            listener.on_event(event);
        }
    }
}

// ============================================================================
// StompSubProtocolHandler - Client To Server
// ============================================================================

impl StompSubProtocolHandler {
    async fn forward_from_client(
        &self,
        session: &Arc<dyn WebSocketSession>,
        state: &Arc<StompSession>,
        mut message: Message,
        output: &dyn MessageChannel,
    ) {
        let command = message.headers().command();
        let is_connect = command.is_some_and(StompCommand::is_connect);
        let user = self.user(session);

        {
            let headers = message.headers_unchecked_mut();
            headers.set_session_id(session.id().clone());
            headers.set_session_attributes(session.attributes().clone());
            headers.set_user(user.clone());
            if is_connect {
                let state = Arc::clone(state);
                let transport_user = session.principal();
                headers.set_user_change_callback(Arc::new(move |principal: &Principal| {
                    if transport_user.as_ref() != Some(principal) {
                        *state.authenticated_user.lock() = Some(principal.clone());
                    }
                }));
            }
            if !output.keeps_headers_mutable() {
                headers.set_immutable();
            }
        }

        match command {
            Some(c) if c.is_connect() => {
                self.stats.connect.fetch_add(1, Ordering::Relaxed);
            }
            Some(StompCommand::Disconnect) => {
                self.stats.disconnect.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let event = Self::event_for(session.id(), user, message.headers());
        let client_headers = message.headers().clone();

        trace!(session_id = %session.id(), ?command, "Forwarding client message");
        match output.send(message) {
            Ok(()) => {
                if let Some(event) = event {
                    self.publish(event);
                }
            }
            Err(e) => {
                error!(session_id = %session.id(), error = %e, "Failed to send client message to application");
                self.handle_processing_error(session, Some(&client_headers), &e)
                    .await;
            }
        }
    }

    fn event_for(
        session_id: &SessionId,
        user: Option<Principal>,
        headers: &MessageHeaders,
    ) -> Option<StompSessionEvent> {
        let session_id = session_id.clone();
        let native = headers.native();
        match headers.command()? {
            StompCommand::Connect | StompCommand::Stomp => {
                Some(StompSessionEvent::Connect { session_id, user })
            }
            StompCommand::Subscribe => Some(StompSessionEvent::Subscribe {
                session_id,
                user,
                destination: native.destination().map(str::to_owned),
                subscription_id: native.first(crate::protocol::headers::ID).map(str::to_owned),
            }),
            StompCommand::Unsubscribe => Some(StompSessionEvent::Unsubscribe {
                session_id,
                user,
                subscription_id: native.first(crate::protocol::headers::ID).map(str::to_owned),
            }),
            _ => None,
        }
    }

    /// Sends an ERROR frame for a failed client message. The session stays
    /// open unless the write fails.
    async fn handle_processing_error(
        &self,
        session: &Arc<dyn WebSocketSession>,
        client_headers: Option<&MessageHeaders>,
        error: &Error,
    ) {
        let Some(error_message) = self
            .error_handler
            .handle_client_message_processing_error(client_headers, error)
        else {
            return;
        };

        let (headers, payload) = error_message.into_parts();
        if let Err(e) = self.write_frame(session, &headers, &payload).await {
            debug!(session_id = %session.id(), error = %e, "Failed to send STOMP ERROR to client");
            close_session(session, CloseStatus::PROTOCOL_ERROR).await;
        }
    }
}

// ============================================================================
// StompSubProtocolHandler - Server To Client
// ============================================================================

impl StompSubProtocolHandler {
    /// Resolves a routing-layer message into the frame to send.
    fn to_client_frame(
        &self,
        session: &Arc<dyn WebSocketSession>,
        message: Message,
    ) -> Result<(MessageHeaders, Bytes)> {
        let (mut headers, payload) = message.into_parts();

        match headers.message_type() {
            MessageType::ConnectAck => {
                return Ok((Self::connected_headers(&headers)?, Bytes::new()));
            }
            MessageType::DisconnectAck => {
                return Ok((Self::disconnect_ack_headers(&headers), Bytes::new()));
            }
            MessageType::Heartbeat => {
                return Ok((MessageHeaders::heartbeat(), Bytes::new()));
            }
            _ => {}
        }

        if matches!(headers.command(), None | Some(StompCommand::Send)) {
            headers.set_command(StompCommand::Message);
            if !headers.native().contains(MESSAGE_ID) {
                let id = self.message_id_counter.fetch_add(1, Ordering::Relaxed);
                headers
                    .native_mut()
                    .set(MESSAGE_ID, format!("{}-{id}", session.id()));
            }
        }

        Ok((headers, payload))
    }

    fn connected_headers(ack: &MessageHeaders) -> Result<MessageHeaders> {
        let connect = ack.connect_message().ok_or_else(|| {
            Error::processing(format!("Original STOMP CONNECT not found in {ack:?}"))
        })?;

        let mut connected = MessageHeaders::stomp(StompCommand::Connected);
        if let Some(session_id) = ack.session_id() {
            connected.set_session_id(session_id.clone());
        }

        let accept_version = connect.headers().native().accept_version();
        if accept_version.contains(&"1.2") {
            connected.native_mut().set(VERSION, "1.2");
        } else if accept_version.contains(&"1.1") {
            connected.native_mut().set(VERSION, "1.1");
        } else if !accept_version.is_empty() {
            return Err(Error::processing(format!(
                "Unsupported STOMP version '{}'",
                accept_version.join(",")
            )));
        }

        let heartbeat = ack.heartbeat_value().unwrap_or(HeartBeat::NONE);
        connected.native_mut().set_heartbeat(heartbeat);
        connected.set_heartbeat(heartbeat);
        Ok(connected)
    }

    fn disconnect_ack_headers(ack: &MessageHeaders) -> MessageHeaders {
        let receipt = ack
            .disconnect_message()
            .and_then(|disconnect| disconnect.headers().native().receipt())
            .map(str::to_owned);

        match receipt {
            Some(receipt) => {
                let mut headers = MessageHeaders::stomp(StompCommand::Receipt);
                headers.native_mut().set_receipt_id(receipt);
                headers
            }
            None => {
                let mut headers = MessageHeaders::stomp(StompCommand::Error);
                headers.native_mut().set_message("Session closed.");
                headers
            }
        }
    }

    fn after_connected(
        headers: &mut MessageHeaders,
        session: &Arc<dyn WebSocketSession>,
        user: Option<&Principal>,
    ) {
        if let Some(user) = user {
            headers.native_mut().set(USER_NAME, user.name());
        }
        let heartbeat = headers.native().heartbeat().unwrap_or_default();
        if heartbeat.outgoing > 0 {
            trace!(session_id = %session.id(), "STOMP heartbeats negotiated, disabling transport heartbeat");
            session.disable_heartbeat();
        }
    }

    /// Encodes a frame into the message for `session`.
    fn encode_frame(
        &self,
        session: &Arc<dyn WebSocketSession>,
        headers: &MessageHeaders,
        payload: &[u8],
    ) -> Result<WebSocketMessage> {
        let bytes = self.encoder.encode(headers, payload)?;
        frame_message(bytes, headers, payload, session.kind())
    }

    /// Encodes and writes a frame.
    async fn write_frame(
        &self,
        session: &Arc<dyn WebSocketSession>,
        headers: &MessageHeaders,
        payload: &[u8],
    ) -> Result<()> {
        let message = self.encode_frame(session, headers, payload)?;
        session.send_message(message).await
    }
}

fn is_octet_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(APPLICATION_OCTET_STREAM))
}

/// Wraps an encoded frame in a WebSocket message.
///
/// Binary framing is used for non-empty `application/octet-stream` payloads
/// on non-SockJS sessions, and for frames that are not valid UTF-8. SockJS
/// carries text only, so such frames are rejected there.
pub(crate) fn frame_message(
    bytes: Bytes,
    headers: &MessageHeaders,
    payload: &[u8],
    kind: SessionKind,
) -> Result<WebSocketMessage> {
    if kind.is_sockjs() {
        return match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(WebSocketMessage::Text(text.to_owned())),
            Err(e) => Err(Error::processing(format!(
                "STOMP frame is not valid UTF-8 and cannot be sent over SockJS: {e}"
            ))),
        };
    }

    let octet_stream = !payload.is_empty() && headers.content_type().is_some_and(is_octet_stream);
    if octet_stream {
        return Ok(WebSocketMessage::Binary(bytes));
    }
    match std::str::from_utf8(&bytes) {
        Ok(text) => Ok(WebSocketMessage::Text(text.to_owned())),
        Err(_) => Ok(WebSocketMessage::Binary(bytes)),
    }
}

/// Closes `session`, logging a failure.
async fn close_session(session: &Arc<dyn WebSocketSession>, status: CloseStatus) {
    if let Err(e) = session.close(status).await {
        debug!(session_id = %session.id(), error = %e, "Failure while closing session");
    }
}

// ============================================================================
// SubProtocolHandler Implementation
// ============================================================================

#[async_trait]
impl SubProtocolHandler for StompSubProtocolHandler {
    fn supported_protocols(&self) -> Vec<String> {
        SUPPORTED_PROTOCOLS.iter().map(|p| (*p).to_owned()).collect()
    }

    async fn after_session_started(
        &self,
        session: Arc<dyn WebSocketSession>,
        _output: &dyn MessageChannel,
    ) -> Result<()> {
        if session.text_message_size_limit() < MINIMUM_WEBSOCKET_MESSAGE_SIZE {
            session.set_text_message_size_limit(MINIMUM_WEBSOCKET_MESSAGE_SIZE);
        }

        let state = StompSession {
            decoder: Mutex::new(BufferingStompDecoder::new(
                self.decoder,
                self.message_size_limit,
            )),
            authenticated_user: Mutex::new(None),
        };
        self.sessions
            .write()
            .insert(session.id().clone(), Arc::new(state));

        debug!(session_id = %session.id(), "STOMP session started");
        Ok(())
    }

    async fn handle_message_from_client(
        &self,
        session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
        output: &dyn MessageChannel,
    ) -> Result<()> {
        let payload: &[u8] = match &message {
            WebSocketMessage::Text(text) => text.as_bytes(),
            WebSocketMessage::Binary(data) => data,
            _ => return Ok(()),
        };

        let Some(state) = self.session_state(session.id()) else {
            return Err(Error::processing(format!(
                "No decoder for session id '{}'",
                session.id()
            )));
        };

        let decoded = state.decoder.lock().decode(payload);
        let messages = match decoded {
            Ok(messages) => messages,
            Err(e) => {
                error!(session_id = %session.id(), error = %e, "Failed to parse STOMP frame, sending ERROR");
                self.handle_processing_error(&session, None, &e).await;
                close_session(&session, CloseStatus::PROTOCOL_ERROR).await;
                return Ok(());
            }
        };

        for message in messages {
            self.forward_from_client(&session, &state, message, output)
                .await;
        }
        Ok(())
    }

    async fn handle_message_to_client(
        &self,
        session: Arc<dyn WebSocketSession>,
        message: Message,
    ) -> Result<()> {
        let user = self.user(&session);
        let (mut headers, mut payload) = self.to_client_frame(&session, message)?;
        let command = headers.command();

        match command {
            Some(StompCommand::Message) => {
                let native = headers.native_mut();
                if native.subscription().is_none() {
                    warn!(session_id = %session.id(), "No STOMP 'subscription' header in MESSAGE");
                }
                if let Some(original) = native.remove(ORIGINAL_DESTINATION).into_iter().next() {
                    native.set_destination(original);
                }
            }
            Some(StompCommand::Connected) => {
                self.stats.connected.fetch_add(1, Ordering::Relaxed);
                Self::after_connected(&mut headers, &session, user.as_ref());
                self.publish(StompSessionEvent::Connected {
                    session_id: session.id().clone(),
                    user,
                });
            }
            Some(StompCommand::Error) => {
                let processed = self
                    .error_handler
                    .handle_error_message_to_client(Message::new(headers, payload));
                (headers, payload) = processed.into_parts();
            }
            _ => {}
        }

        let frame = self.encode_frame(&session, &headers, &payload)?;
        match session.send_message(frame).await {
            Err(e) if e.is_session_limit_exceeded() => return Err(e),
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "Failed to send WebSocket message to client");
                close_session(&session, CloseStatus::PROTOCOL_ERROR).await;
            }
            Ok(()) if command == Some(StompCommand::Error) => {
                close_session(&session, CloseStatus::PROTOCOL_ERROR).await;
            }
            Ok(()) => {}
        }
        Ok(())
    }

    fn resolve_session_id(&self, message: &Message) -> Option<SessionId> {
        message.headers().session_id().cloned()
    }

    async fn after_session_ended(
        &self,
        session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
        output: &dyn MessageChannel,
    ) -> Result<()> {
        let state = self.sessions.write().remove(session.id());
        let user = state
            .and_then(|state| state.authenticated_user.lock().clone())
            .or_else(|| session.principal());

        let mut headers = MessageHeaders::stomp(StompCommand::Disconnect);
        headers.set_session_id(session.id().clone());
        headers.set_session_attributes(session.attributes().clone());
        headers.set_user(user.clone());

        self.publish(StompSessionEvent::Disconnect {
            session_id: session.id().clone(),
            user,
            status,
        });

        debug!(session_id = %session.id(), "STOMP session ended");
        output.send(Message::empty(headers))
    }
}

impl fmt::Debug for StompSubProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StompSubProtocolHandler")
            .field("message_size_limit", &self.message_size_limit)
            .field("sessions", &self.session_count())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StompSubProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StompSubProtocolHandler{:?}", SUPPORTED_PROTOCOLS)
    }
}

// ============================================================================
// Tests
// ============================================================================

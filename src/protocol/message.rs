//! Decoded application messages.
//!
//! A [`Message`] pairs STOMP frame data (command, native headers, payload)
//! with the out-of-band metadata the routing layer needs: session id,
//! session attributes, principal, heartbeat and back-references to the
//! CONNECT/DISCONNECT frames an acknowledgement answers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::identifiers::{Principal, SessionAttributes, SessionId};

use super::command::{MessageType, StompCommand};
use super::headers::{HeartBeat, StompHeaders};

// ============================================================================
// Types
// ============================================================================

/// Hook invoked whenever the user of a message is (re)assigned.
///
/// Installed on CONNECT messages so the handler can learn about a principal
/// authenticated by the routing layer.
pub type UserChangeCallback = Arc<dyn Fn(&Principal) + Send + Sync>;

// ============================================================================
// MessageHeaders
// ============================================================================

/// Headers of a decoded message.
#[derive(Clone, Default)]
pub struct MessageHeaders {
    command: Option<StompCommand>,
    message_type: MessageType,
    native: StompHeaders,
    session_id: Option<SessionId>,
    session_attributes: Option<SessionAttributes>,
    user: Option<Principal>,
    heartbeat: Option<HeartBeat>,
    connect_message: Option<Box<Message>>,
    disconnect_message: Option<Box<Message>>,
    immutable: bool,
    user_change: Option<UserChangeCallback>,
}

impl MessageHeaders {
    /// Creates headers for a STOMP command.
    #[must_use]
    pub fn stomp(command: StompCommand) -> Self {
        Self {
            command: Some(command),
            message_type: command.message_type(),
            ..Self::default()
        }
    }

    /// Creates command-less headers of the given routing-layer type.
    #[must_use]
    pub fn of_type(message_type: MessageType) -> Self {
        Self {
            message_type,
            ..Self::default()
        }
    }

    /// Creates heartbeat headers.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::of_type(MessageType::Heartbeat)
    }

    /// Creates STOMP headers carrying the given native headers.
    #[must_use]
    pub fn with_native(command: StompCommand, native: StompHeaders) -> Self {
        Self {
            native,
            ..Self::stomp(command)
        }
    }
}

// ============================================================================
// MessageHeaders - Accessors
// ============================================================================

impl MessageHeaders {
    /// Returns the STOMP command.
    #[inline]
    #[must_use]
    pub fn command(&self) -> Option<StompCommand> {
        self.command
    }

    /// Returns the routing-layer message type.
    #[inline]
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Returns `true` for heartbeat messages.
    #[inline]
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.message_type == MessageType::Heartbeat
    }

    /// Returns the native STOMP headers.
    #[inline]
    #[must_use]
    pub fn native(&self) -> &StompHeaders {
        &self.native
    }

    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Returns the session attributes.
    #[inline]
    #[must_use]
    pub fn session_attributes(&self) -> Option<&SessionAttributes> {
        self.session_attributes.as_ref()
    }

    /// Returns the user.
    #[inline]
    #[must_use]
    pub fn user(&self) -> Option<&Principal> {
        self.user.as_ref()
    }

    /// Returns the routing-layer heartbeat.
    #[inline]
    #[must_use]
    pub fn heartbeat_value(&self) -> Option<HeartBeat> {
        self.heartbeat
    }

    /// Returns the CONNECT message a CONNECT_ACK answers.
    #[inline]
    #[must_use]
    pub fn connect_message(&self) -> Option<&Message> {
        self.connect_message.as_deref()
    }

    /// Returns the DISCONNECT message a DISCONNECT_ACK answers.
    #[inline]
    #[must_use]
    pub fn disconnect_message(&self) -> Option<&Message> {
        self.disconnect_message.as_deref()
    }

    /// Returns `true` while headers may still be modified.
    #[inline]
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        !self.immutable
    }

    /// Returns the `content-type` native header.
    #[inline]
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.native.content_type()
    }
}

// ============================================================================
// MessageHeaders - Mutators
// ============================================================================

impl MessageHeaders {
    /// Sets the STOMP command and derives the message type from it.
    pub fn set_command(&mut self, command: StompCommand) {
        self.command = Some(command);
        self.message_type = command.message_type();
    }

    /// Sets the routing-layer message type.
    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = message_type;
    }

    /// Returns the native headers for modification.
    pub fn native_mut(&mut self) -> &mut StompHeaders {
        &mut self.native
    }

    /// Sets the session id.
    pub fn set_session_id(&mut self, session_id: SessionId) {
        self.session_id = Some(session_id);
    }

    /// Sets the session attributes.
    pub fn set_session_attributes(&mut self, attributes: SessionAttributes) {
        self.session_attributes = Some(attributes);
    }

    /// Sets the user and notifies the user-change hook, if any.
    pub fn set_user(&mut self, user: Option<Principal>) {
        if let (Some(callback), Some(principal)) = (&self.user_change, &user) {
            callback(principal);
        }
        self.user = user;
    }

    /// Installs a user-change hook.
    pub fn set_user_change_callback(&mut self, callback: UserChangeCallback) {
        self.user_change = Some(callback);
    }

    /// Sets the routing-layer heartbeat.
    pub fn set_heartbeat(&mut self, heartbeat: HeartBeat) {
        self.heartbeat = Some(heartbeat);
    }

    /// Attaches the CONNECT message being acknowledged.
    pub fn set_connect_message(&mut self, message: Message) {
        self.connect_message = Some(Box::new(message));
    }

    /// Attaches the DISCONNECT message being acknowledged.
    pub fn set_disconnect_message(&mut self, message: Message) {
        self.disconnect_message = Some(Box::new(message));
    }

    /// Freezes the headers.
    pub fn set_immutable(&mut self) {
        self.immutable = true;
    }
}

impl fmt::Debug for MessageHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHeaders")
            .field("command", &self.command)
            .field("message_type", &self.message_type)
            .field("native", &self.native)
            .field("session_id", &self.session_id)
            .field("user", &self.user)
            .field("heartbeat", &self.heartbeat)
            .field("immutable", &self.immutable)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Message
// ============================================================================

/// A decoded application message.
#[derive(Debug, Clone)]
pub struct Message {
    headers: MessageHeaders,
    payload: Bytes,
}

impl Message {
    /// Creates a message.
    #[inline]
    #[must_use]
    pub fn new(headers: MessageHeaders, payload: impl Into<Bytes>) -> Self {
        Self {
            headers,
            payload: payload.into(),
        }
    }

    /// Creates a message without payload.
    #[inline]
    #[must_use]
    pub fn empty(headers: MessageHeaders) -> Self {
        Self::new(headers, Bytes::new())
    }

    /// Creates a heartbeat message.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(MessageHeaders::heartbeat(), Bytes::from_static(b"\n"))
    }

    /// Creates the routing layer's acknowledgement of a CONNECT.
    #[must_use]
    pub fn connect_ack(connect: Message, heartbeat: Option<HeartBeat>) -> Self {
        let mut headers = MessageHeaders::of_type(MessageType::ConnectAck);
        if let Some(session_id) = connect.headers.session_id.clone() {
            headers.set_session_id(session_id);
        }
        if let Some(heartbeat) = heartbeat {
            headers.set_heartbeat(heartbeat);
        }
        headers.set_connect_message(connect);
        Self::empty(headers)
    }

    /// Creates the routing layer's acknowledgement of a DISCONNECT.
    #[must_use]
    pub fn disconnect_ack(disconnect: Message) -> Self {
        let mut headers = MessageHeaders::of_type(MessageType::DisconnectAck);
        if let Some(session_id) = disconnect.headers.session_id.clone() {
            headers.set_session_id(session_id);
        }
        headers.set_disconnect_message(disconnect);
        Self::empty(headers)
    }

    /// Returns the headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Returns the headers for modification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImmutableHeaders`] once the message was frozen.
    pub fn headers_mut(&mut self) -> Result<&mut MessageHeaders> {
        if self.headers.immutable {
            return Err(Error::ImmutableHeaders);
        }
        Ok(&mut self.headers)
    }

    /// Returns the payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Splits the message into headers and payload.
    #[inline]
    #[must_use]
    pub fn into_parts(self) -> (MessageHeaders, Bytes) {
        (self.headers, self.payload)
    }

    pub(crate) fn headers_unchecked_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }
}

// ============================================================================
// Tests
// ============================================================================

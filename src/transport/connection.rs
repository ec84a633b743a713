//! Native WebSocket session over a tokio-tungstenite stream.
//!
//! Each connection runs two tasks:
//!
//! - **Writer** owns the sink half and executes send/close commands in order.
//! - **Reader** owns the stream half, notifies the [`WebSocketHandler`] and
//!   reports the final close status.
//!
//! Handlers may send from within `handle_message`; the writer task keeps
//! draining while the reader is busy.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{Principal, SessionAttributes, SessionId};

use super::handler::WebSocketHandler;
use super::message::{CloseStatus, WebSocketMessage};
use super::session::{SessionKind, WebSocketSession};

// ============================================================================
// Constants
// ============================================================================

/// Default inbound message size limit.
pub const DEFAULT_MESSAGE_SIZE_LIMIT: usize = 64 * 1024;

/// How long to wait for the peer's close frame after closing locally.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Commands for the writer task.
enum ConnectionCommand {
    /// Write a message and report the outcome.
    Send {
        message: WsMessage,
        result_tx: oneshot::Sender<Result<()>>,
    },
    /// Write a close frame.
    Close(CloseStatus),
    /// Stop the writer.
    Shutdown,
}

// ============================================================================
// ConnectionInfo
// ============================================================================

/// Handshake results attached to a new connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Session id; generated when absent.
    pub id: Option<SessionId>,
    /// Negotiated sub-protocol.
    pub protocol: Option<String>,
    /// Authenticated principal.
    pub principal: Option<Principal>,
    /// Initial attributes.
    pub attributes: SessionAttributes,
}

// ============================================================================
// WebSocketConnection
// ============================================================================

/// A [`WebSocketSession`] backed by a WebSocket stream.
pub struct WebSocketConnection {
    id: SessionId,
    protocol: Option<String>,
    principal: Option<Principal>,
    attributes: SessionAttributes,

    open: AtomicBool,
    text_limit: AtomicUsize,
    binary_limit: AtomicUsize,
    local_close: Mutex<Option<CloseStatus>>,

    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    closing_tx: watch::Sender<bool>,
}

impl WebSocketConnection {
    /// Wraps an established stream and starts the reader and writer tasks.
    ///
    /// `handler.after_connection_established` runs before the first
    /// inbound message is read.
    pub fn spawn<S>(
        stream: WebSocketStream<S>,
        info: ConnectionInfo,
        handler: Arc<dyn WebSocketHandler>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            id: info.id.unwrap_or_else(SessionId::generate),
            protocol: info.protocol,
            principal: info.principal,
            attributes: info.attributes,
            open: AtomicBool::new(true),
            text_limit: AtomicUsize::new(DEFAULT_MESSAGE_SIZE_LIMIT),
            binary_limit: AtomicUsize::new(DEFAULT_MESSAGE_SIZE_LIMIT),
            local_close: Mutex::new(None),
            command_tx,
            closing_tx,
        });

        let (sink, source) = stream.split();
        tokio::spawn(Self::run_writer(connection.id.clone(), sink, command_rx));
        tokio::spawn(Self::run_reader(
            Arc::clone(&connection),
            source,
            closing_rx,
            handler,
        ));

        debug!(session_id = %connection.id, protocol = ?connection.protocol, "WebSocket connection started");
        connection
    }

    /// Returns the status this side closed with, if any.
    #[must_use]
    pub fn local_close_status(&self) -> Option<CloseStatus> {
        self.local_close.lock().clone()
    }

    /// Writer task: executes commands until shutdown.
    async fn run_writer<S>(
        session_id: SessionId,
        mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(command) = command_rx.recv().await {
            match command {
                ConnectionCommand::Send { message, result_tx } => {
                    let result = sink.send(message).await.map_err(Error::from);
                    if let Err(ref e) = result {
                        debug!(session_id = %session_id, error = %e, "WebSocket write failed");
                    }
                    let _ = result_tx.send(result);
                }

                ConnectionCommand::Close(status) => {
                    trace!(session_id = %session_id, %status, "Sending close frame");
                    if let Err(e) = sink.send(WsMessage::Close(Some(status.into()))).await {
                        debug!(session_id = %session_id, error = %e, "Failed to send close frame");
                    }
                    let _ = sink.close().await;
                }

                ConnectionCommand::Shutdown => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }

        trace!(session_id = %session_id, "Writer task terminated");
    }

    /// Reader task: dispatches inbound messages until the stream ends.
    async fn run_reader<S>(
        self: Arc<Self>,
        mut source: SplitStream<WebSocketStream<S>>,
        mut closing_rx: watch::Receiver<bool>,
        handler: Arc<dyn WebSocketHandler>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session: Arc<dyn WebSocketSession> = Arc::clone(&self) as Arc<dyn WebSocketSession>;

        if let Err(e) = handler.after_connection_established(Arc::clone(&session)).await {
            warn!(session_id = %self.id, error = %e, "Failed to establish session");
            let _ = self.close(CloseStatus::SERVER_ERROR).await;
        }

        let mut remote_status = CloseStatus::NO_CLOSE_FRAME;

        loop {
            let next = if *closing_rx.borrow() {
                timeout(CLOSE_TIMEOUT, source.next()).await.unwrap_or_else(|_| {
                    debug!(session_id = %self.id, "No close reply from peer");
                    None
                })
            } else {
                tokio::select! {
                    next = source.next() => next,
                    _ = closing_rx.changed() => continue,
                }
            };

            let message = match next {
                Some(Ok(WsMessage::Text(text))) => WebSocketMessage::Text(text.as_str().to_owned()),
                Some(Ok(WsMessage::Binary(data))) => WebSocketMessage::Binary(data),
                Some(Ok(WsMessage::Pong(data))) => WebSocketMessage::Pong(data),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Frame(_))) => continue,

                Some(Ok(WsMessage::Close(frame))) => {
                    remote_status = frame
                        .as_ref()
                        .map_or(CloseStatus::NO_STATUS_CODE, CloseStatus::from);
                    debug!(session_id = %self.id, status = %remote_status, "WebSocket closed by remote");
                    break;
                }

                Some(Err(e)) => {
                    debug!(session_id = %self.id, error = %e, "WebSocket read failed");
                    let error = Error::from(e);
                    if let Err(e) = handler.handle_transport_error(Arc::clone(&session), &error).await {
                        debug!(session_id = %self.id, error = %e, "Transport error handling failed");
                    }
                    break;
                }

                None => {
                    debug!(session_id = %self.id, "WebSocket stream ended");
                    break;
                }
            };

            if !self.is_open() {
                continue;
            }
            if let Some(status) = self.exceeds_size_limit(&message) {
                let _ = self.close(status).await;
                continue;
            }
            if let Err(e) = handler.handle_message(Arc::clone(&session), message).await {
                debug!(session_id = %self.id, error = %e, "Message handling failed, closing");
                let _ = self.close(CloseStatus::SERVER_ERROR).await;
            }
        }

        self.open.store(false, Ordering::SeqCst);
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);

        let status = self.local_close_status().unwrap_or(remote_status);
        if let Err(e) = handler.after_connection_closed(session, status).await {
            debug!(session_id = %self.id, error = %e, "After close handling failed");
        }

        trace!(session_id = %self.id, "Reader task terminated");
    }

    fn exceeds_size_limit(&self, message: &WebSocketMessage) -> Option<CloseStatus> {
        let (limit, kind) = match message {
            WebSocketMessage::Text(_) => (self.text_message_size_limit(), "Text"),
            WebSocketMessage::Binary(_) => (self.binary_message_size_limit(), "Binary"),
            _ => return None,
        };
        (message.len() > limit).then(|| {
            debug!(session_id = %self.id, size = message.len(), limit, "Inbound message too big");
            CloseStatus::TOO_BIG_TO_PROCESS
                .with_reason(format!("{kind} message size {} exceeds limit {limit}", message.len()))
        })
    }
}

#[async_trait]
impl WebSocketSession for WebSocketConnection {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::WebSocket
    }

    fn accepted_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    fn principal(&self) -> Option<Principal> {
        self.principal.clone()
    }

    fn attributes(&self) -> &SessionAttributes {
        &self.attributes
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn text_message_size_limit(&self) -> usize {
        self.text_limit.load(Ordering::SeqCst)
    }

    fn set_text_message_size_limit(&self, limit: usize) {
        self.text_limit.store(limit, Ordering::SeqCst);
    }

    fn binary_message_size_limit(&self) -> usize {
        self.binary_limit.load(Ordering::SeqCst)
    }

    fn set_binary_message_size_limit(&self, limit: usize) {
        self.binary_limit.store(limit, Ordering::SeqCst);
    }

    async fn send_message(&self, message: WebSocketMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::session_not_open(self.id.clone()));
        }

        let (result_tx, result_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Send {
                message: message.into(),
                result_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        result_rx.await?
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        {
            let mut local_close = self.local_close.lock();
            if local_close.is_some() {
                return Ok(());
            }
            *local_close = Some(status.clone());
        }

        debug!(session_id = %self.id, %status, "Closing WebSocket session");
        self.open.store(false, Ordering::SeqCst);
        let _ = self.closing_tx.send(true);
        self.command_tx
            .send(ConnectionCommand::Close(status))
            .map_err(|_| Error::ConnectionClosed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use crate::testing::RecordingHandler;

    async fn pair(
        handler: Arc<RecordingHandler>,
    ) -> (Arc<WebSocketConnection>, WebSocketStream<tokio::io::DuplexStream>) {
        let (server_io, client_io) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let connection = WebSocketConnection::spawn(server, ConnectionInfo::default(), handler);
        (connection, client)
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_handler() {
        let handler = Arc::new(RecordingHandler::new());
        let (_connection, mut client) = pair(Arc::clone(&handler)).await;

        client.send(WsMessage::Text("hello".into())).await.unwrap();
        client.send(WsMessage::Close(None)).await.unwrap();
        while client.next().await.is_some() {}

        handler.wait_closed().await;
        assert!(handler.established());
        assert_eq!(handler.texts(), vec!["hello"]);
        assert_eq!(handler.close_status(), Some(CloseStatus::NO_STATUS_CODE));
    }

    #[tokio::test]
    async fn test_send_and_local_close() {
        let handler = Arc::new(RecordingHandler::new());
        let (connection, mut client) = pair(Arc::clone(&handler)).await;

        connection
            .send_message(WebSocketMessage::text("out"))
            .await
            .unwrap();
        connection.close(CloseStatus::GOING_AWAY).await.unwrap();
        assert!(!connection.is_open());

        let first = client.next().await.unwrap().unwrap();
        assert_eq!(first, WsMessage::Text("out".into()));
        let second = client.next().await.unwrap().unwrap();
        assert!(matches!(second, WsMessage::Close(Some(ref f)) if u16::from(f.code) == 1001));
        while client.next().await.is_some() {}

        handler.wait_closed().await;
        assert_eq!(handler.close_status(), Some(CloseStatus::GOING_AWAY));
        assert!(connection.send_message(WebSocketMessage::text("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_too_big() {
        let handler = Arc::new(RecordingHandler::new());
        let (connection, mut client) = pair(Arc::clone(&handler)).await;
        connection.set_text_message_size_limit(4);

        client.send(WsMessage::Text("too long".into())).await.unwrap();
        while let Some(Ok(message)) = client.next().await {
            if let WsMessage::Close(Some(frame)) = message {
                assert_eq!(u16::from(frame.code), 1009);
            }
        }

        handler.wait_closed().await;
        assert!(handler.texts().is_empty());
        assert_eq!(handler.close_status().map(|s| s.code), Some(1009));
    }
}

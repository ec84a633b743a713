//! Client-side SockJS session.
//!
//! # State Machine
//!
//! ```text
//! NEW ──o──► OPEN ──close()/c[...]──► CLOSING ──transport closed──► CLOSED
//!  │                                                                  ▲
//!  └──────────────── transport error / timeout ───────────────────────┘
//! ```
//!
//! The open frame completes the pending connect; message frames are
//! unpacked and delivered to the handler one by one.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::identifiers::{Principal, SessionAttributes, SessionId};
use crate::scheduler::Task;
use crate::sockjs::frame::{SockJsFrame, SockJsFrameType, encode_messages};
use crate::transport::{
    CloseStatus, DEFAULT_MESSAGE_SIZE_LIMIT, SessionKind, WebSocketHandler, WebSocketMessage,
    WebSocketSession,
};

use super::request::TransportRequest;

// ============================================================================
// FrameWriter
// ============================================================================

/// Transport-specific half of a client session.
#[async_trait]
pub(crate) trait FrameWriter: Send + Sync {
    /// Sends an encoded JSON array of messages.
    async fn write(&self, content: String) -> Result<()>;

    /// Tears down the transport. Must lead to
    /// [`ClientSockJsSession::after_transport_closed`].
    async fn disconnect(&self, status: CloseStatus) -> Result<()>;
}

// ============================================================================
// SessionState
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Open,
    Closing,
    Closed,
}

// ============================================================================
// ClientSockJsSession
// ============================================================================

/// A SockJS session as seen by the client.
pub struct ClientSockJsSession {
    id: SessionId,
    kind: SessionKind,
    principal: Option<Principal>,
    attributes: SessionAttributes,
    handler: Arc<dyn WebSocketHandler>,
    writer: Arc<dyn FrameWriter>,

    state: Mutex<SessionState>,
    close_status: Mutex<Option<CloseStatus>>,
    connect_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    text_limit: AtomicUsize,
    binary_limit: AtomicUsize,
    self_ref: Weak<Self>,
}

impl ClientSockJsSession {
    /// Creates a session and the receiver completed by the open frame.
    pub(crate) fn new(
        request: &TransportRequest,
        kind: SessionKind,
        handler: Arc<dyn WebSocketHandler>,
        writer: Arc<dyn FrameWriter>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
        let (connect_tx, connect_rx) = oneshot::channel();
        let session = Arc::new_cyclic(|self_ref| Self {
            id: SessionId::new(request.url_info().session_id()),
            kind,
            principal: request.user().cloned(),
            attributes: SessionAttributes::new(),
            handler,
            writer,
            state: Mutex::new(SessionState::New),
            close_status: Mutex::new(None),
            connect_tx: Mutex::new(Some(connect_tx)),
            text_limit: AtomicUsize::new(DEFAULT_MESSAGE_SIZE_LIMIT),
            binary_limit: AtomicUsize::new(DEFAULT_MESSAGE_SIZE_LIMIT),
            self_ref: self_ref.clone(),
        });
        (session, connect_rx)
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn as_session(&self) -> Option<Arc<dyn WebSocketSession>> {
        self.self_ref
            .upgrade()
            .map(|session| session as Arc<dyn WebSocketSession>)
    }

    /// Returns `true` once closing started.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    fn complete_connect(&self, outcome: Result<()>) {
        if let Some(tx) = self.connect_tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    /// Task that abandons a connect attempt that timed out.
    pub(crate) fn timeout_task(&self) -> Task {
        let weak = self.self_ref.clone();
        Box::new(move || {
            let Some(session) = weak.upgrade() else {
                return;
            };
            {
                let mut state = session.state.lock();
                if *state != SessionState::New {
                    return;
                }
                *state = SessionState::Closed;
            }
            session.complete_connect(Err(Error::transport_failure(
                "Transport timed out",
                session.id.as_str(),
            )));
            let status = CloseStatus::GOING_AWAY.with_reason("Transport timed out");
            tokio::spawn(async move {
                if let Err(e) = session.writer.disconnect(status).await {
                    debug!(session_id = %session.id, error = %e, "Failed to disconnect timed out transport");
                }
            });
        })
    }

    /// Processes one received SockJS frame.
    pub async fn handle_frame(&self, payload: &str) {
        let frame = match SockJsFrame::parse(payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Ignoring unexpected SockJS frame");
                return;
            }
        };
        trace!(session_id = %self.id, frame = %frame, "Processing SockJS frame");

        match frame.frame_type() {
            SockJsFrameType::Open => self.handle_open_frame().await,
            SockJsFrameType::Heartbeat => trace!(session_id = %self.id, "Received heartbeat"),
            SockJsFrameType::Message => self.handle_message_frame(&frame).await,
            SockJsFrameType::Close => self.handle_close_frame(&frame).await,
        }
    }

    async fn handle_open_frame(&self) {
        let was_new = {
            let mut state = self.state.lock();
            let was_new = *state == SessionState::New;
            if was_new {
                *state = SessionState::Open;
            }
            was_new
        };

        if !was_new {
            debug!(session_id = %self.id, state = ?self.state(), "Open frame received but not connecting, server may have lost the session");
            self.silent_close(CloseStatus::NO_CLOSE_FRAME.with_reason("Server lost session"))
                .await;
            return;
        }

        let Some(session) = self.as_session() else {
            return;
        };
        match self.handler.after_connection_established(session).await {
            Ok(()) => self.complete_connect(Ok(())),
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Handler failed after SockJS session opened");
                self.complete_connect(Err(e));
                self.silent_close(CloseStatus::SERVER_ERROR).await;
            }
        }
    }

    async fn handle_message_frame(&self, frame: &SockJsFrame) {
        if self.state() != SessionState::Open {
            error!(session_id = %self.id, state = ?self.state(), "Ignoring received message due to state");
            return;
        }
        let messages = match frame.messages() {
            Ok(messages) => messages,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Failed to decode SockJS message frame");
                self.silent_close(CloseStatus::BAD_DATA).await;
                return;
            }
        };

        let Some(session) = self.as_session() else {
            return;
        };
        for message in messages {
            if self.state() != SessionState::Open {
                break;
            }
            if let Err(e) = self
                .handler
                .handle_message(Arc::clone(&session), WebSocketMessage::Text(message))
                .await
            {
                error!(session_id = %self.id, error = %e, "Handler failed to process message");
            }
        }
    }

    async fn handle_close_frame(&self, frame: &SockJsFrame) {
        let status = frame.close_status().unwrap_or_else(|e| {
            debug!(session_id = %self.id, error = %e, "Failed to parse close frame");
            CloseStatus::NO_STATUS_CODE
        });
        debug!(session_id = %self.id, %status, "Received close frame");
        self.silent_close(status).await;
    }

    /// Closes without user status validation.
    async fn silent_close(&self, status: CloseStatus) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closing;
        }
        self.close_status.lock().get_or_insert(status.clone());
        if let Err(e) = self.writer.disconnect(status).await {
            debug!(session_id = %self.id, error = %e, "Failed to disconnect transport");
        }
    }

    /// Reports a transport error. Fails the connect if still pending.
    pub async fn handle_transport_error(&self, error: &Error) {
        if self.state() == SessionState::New {
            self.complete_connect(Err(Error::transport_failure(
                format!("Failed to connect: {error}"),
                self.id.as_str(),
            )));
            return;
        }
        let Some(session) = self.as_session() else {
            return;
        };
        if let Err(e) = self.handler.handle_transport_error(session, error).await {
            error!(session_id = %self.id, error = %e, "Handler failed to process transport error");
        }
    }

    /// Finishes the session once the transport is gone.
    pub async fn after_transport_closed(&self, status: CloseStatus) {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }
        let status = self.close_status.lock().get_or_insert(status).clone();

        if previous == SessionState::New {
            self.complete_connect(Err(Error::transport_failure(
                format!("Transport closed before open frame: {status}"),
                self.id.as_str(),
            )));
            return;
        }

        debug!(session_id = %self.id, %status, "SockJS session closed");
        let Some(session) = self.as_session() else {
            return;
        };
        if let Err(e) = self.handler.after_connection_closed(session, status).await {
            error!(session_id = %self.id, error = %e, "Handler failed after session closed");
        }
    }
}

/// Close codes an application may use: 1000 and 3000 to 4999.
fn is_user_set_status(status: &CloseStatus) -> bool {
    status.code == CloseStatus::NORMAL.code || (3000..=4999).contains(&status.code)
}

#[async_trait]
impl WebSocketSession for ClientSockJsSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn kind(&self) -> SessionKind {
        self.kind
    }

    fn accepted_protocol(&self) -> Option<&str> {
        None
    }

    fn principal(&self) -> Option<Principal> {
        self.principal.clone()
    }

    fn attributes(&self) -> &SessionAttributes {
        &self.attributes
    }

    fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    fn text_message_size_limit(&self) -> usize {
        self.text_limit.load(Ordering::Relaxed)
    }

    fn set_text_message_size_limit(&self, limit: usize) {
        self.text_limit.store(limit, Ordering::Relaxed);
    }

    fn binary_message_size_limit(&self) -> usize {
        self.binary_limit.load(Ordering::Relaxed)
    }

    fn set_binary_message_size_limit(&self, limit: usize) {
        self.binary_limit.store(limit, Ordering::Relaxed);
    }

    async fn send_message(&self, message: WebSocketMessage) -> Result<()> {
        let WebSocketMessage::Text(text) = message else {
            return Err(Error::invalid_argument("SockJS supports text messages only"));
        };
        if !self.is_open() {
            return Err(Error::session_not_open(self.id.clone()));
        }
        let content = encode_messages(&[text])?;
        trace!(session_id = %self.id, %content, "Writing message");
        self.writer.write(content).await
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        if !is_user_set_status(&status) {
            return Err(Error::invalid_argument(format!("Invalid close status: {status}")));
        }
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                return Ok(());
            }
            *state = SessionState::Closing;
        }
        debug!(session_id = %self.id, %status, "Closing SockJS session");
        *self.close_status.lock() = Some(status.clone());
        self.writer.disconnect(status).await
    }
}

impl fmt::Debug for ClientSockJsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSockJsSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use reqwest::header::HeaderMap;
    use url::Url;

    use crate::sockjs::client::url::{SockJsUrlInfo, TransportType};
    use crate::sockjs::client::transport::Transport;
    use crate::testing::RecordingHandler;

    /// Writer that records writes and reports disconnects back to the
    /// session like a real transport.
    #[derive(Default)]
    struct LoopbackWriter {
        writes: Mutex<Vec<String>>,
        disconnects: Mutex<Vec<CloseStatus>>,
        session: Mutex<Weak<ClientSockJsSession>>,
    }

    #[async_trait]
    impl FrameWriter for LoopbackWriter {
        async fn write(&self, content: String) -> Result<()> {
            self.writes.lock().push(content);
            Ok(())
        }

        async fn disconnect(&self, status: CloseStatus) -> Result<()> {
            self.disconnects.lock().push(status.clone());
            let session = self.session.lock().upgrade();
            if let Some(session) = session {
                session.after_transport_closed(status).await;
            }
            Ok(())
        }
    }

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        fn transport_types(&self) -> Vec<TransportType> {
            Vec::new()
        }

        async fn connect(
            &self,
            _request: &TransportRequest,
            _handler: Arc<dyn WebSocketHandler>,
        ) -> Result<Arc<dyn WebSocketSession>> {
            Err(Error::connection("unused"))
        }
    }

    struct Fixture {
        session: Arc<ClientSockJsSession>,
        connect_rx: oneshot::Receiver<Result<()>>,
        handler: Arc<RecordingHandler>,
        writer: Arc<LoopbackWriter>,
    }

    fn fixture() -> Fixture {
        let request = TransportRequest::new(
            SockJsUrlInfo::new(Url::parse("http://localhost/stomp").unwrap()).unwrap(),
            HeaderMap::new(),
            Arc::new(NoTransport),
            TransportType::WebSocket,
        );
        let handler = Arc::new(RecordingHandler::new());
        let writer = Arc::new(LoopbackWriter::default());
        let (session, connect_rx) = ClientSockJsSession::new(
            &request,
            SessionKind::SockJsWebSocket,
            Arc::clone(&handler) as Arc<dyn WebSocketHandler>,
            Arc::clone(&writer) as Arc<dyn FrameWriter>,
        );
        *writer.session.lock() = Arc::downgrade(&session);
        Fixture {
            session,
            connect_rx,
            handler,
            writer,
        }
    }

    #[tokio::test]
    async fn test_open_frame_completes_connect() {
        let mut f = fixture();
        assert!(!f.session.is_open());

        f.session.handle_frame("o").await;

        assert!(f.session.is_open());
        assert!(f.handler.established());
        assert!(f.connect_rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_message_frames_delivered_in_order() {
        let f = fixture();
        f.session.handle_frame("o").await;
        f.session.handle_frame("h").await;
        f.session.handle_frame("a[\"one\",\"two\"]").await;

        assert_eq!(f.handler.texts(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_send_wraps_in_array() {
        let f = fixture();
        assert!(f.session.send_message(WebSocketMessage::text("early")).await.is_err());

        f.session.handle_frame("o").await;
        f.session
            .send_message(WebSocketMessage::text("CONNECT\n\n\0"))
            .await
            .unwrap();

        assert_eq!(*f.writer.writes.lock(), vec!["[\"CONNECT\\n\\n\\u0000\"]"]);
    }

    #[tokio::test]
    async fn test_close_frame_closes_with_server_status() {
        let f = fixture();
        f.session.handle_frame("o").await;

        f.session.handle_frame("c[3000,\"Go away!\"]").await;

        assert_eq!(f.handler.close_status().map(|s| s.code), Some(3000));
        assert!(!f.session.is_open());
    }

    #[tokio::test]
    async fn test_user_close_status_validated() {
        let f = fixture();
        f.session.handle_frame("o").await;

        assert!(f.session.close(CloseStatus::PROTOCOL_ERROR).await.is_err());
        assert!(f.session.is_open());

        f.session.close(CloseStatus::new(4000)).await.unwrap();
        assert_eq!(*f.writer.disconnects.lock(), vec![CloseStatus::new(4000)]);
        assert_eq!(f.handler.close_status(), Some(CloseStatus::new(4000)));
    }

    #[tokio::test]
    async fn test_transport_closed_before_open_fails_connect() {
        let mut f = fixture();

        f.session.after_transport_closed(CloseStatus::NO_CLOSE_FRAME).await;

        assert!(f.connect_rx.try_recv().unwrap().is_err());
        assert!(!f.handler.established());
        assert!(f.handler.close_status().is_none());
    }

    #[tokio::test]
    async fn test_timeout_task_abandons_attempt() {
        let mut f = fixture();

        (f.session.timeout_task())();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(f.connect_rx.try_recv().unwrap().is_err());
        assert_eq!(f.writer.disconnects.lock().len(), 1);

        f.session.handle_frame("o").await;
        assert!(!f.handler.established());
    }
}

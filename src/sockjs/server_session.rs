//! Server-side SockJS session over a native WebSocket.
//!
//! [`SockJsWebSocketHandler`] sits between a raw WebSocket connection and
//! the application handler. It wraps each connection in a
//! [`SockJsServerSession`] that speaks SockJS framing:
//!
//! 1. The application handler is notified first
//! 2. The open frame `o` is written, followed by any messages the handler
//!    sent during step 1
//! 3. Outbound messages are wrapped in `a[...]`; inbound JSON arrays are
//!    unpacked into individual messages
//! 4. A heartbeat `h` is scheduled after every write unless heartbeats were
//!    disabled

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::identifiers::{Principal, SessionAttributes, SessionId};
use crate::scheduler::{ScheduledTask, TaskScheduler};
use crate::transport::{
    CloseStatus, SessionKind, WebSocketHandler, WebSocketMessage, WebSocketSession,
};

use super::frame::{SockJsFrame, decode_messages};

// ============================================================================
// Constants
// ============================================================================

/// Delay between heartbeat frames on an idle session.
pub const DEFAULT_HEARTBEAT_TIME: Duration = Duration::from_secs(25);

// ============================================================================
// SockJsServerSession
// ============================================================================

#[derive(Default)]
struct InitState {
    open_frame_sent: bool,
    pending: Vec<String>,
}

/// A SockJS session layered on a native WebSocket session.
pub struct SockJsServerSession {
    id: SessionId,
    inner: Arc<dyn WebSocketSession>,
    scheduler: Arc<dyn TaskScheduler>,
    heartbeat_time: Duration,

    init: Mutex<InitState>,
    heartbeat_task: Mutex<Option<ScheduledTask>>,
    heartbeat_disabled: AtomicBool,
    closed: AtomicBool,
    self_ref: Weak<Self>,
}

impl SockJsServerSession {
    fn new(
        inner: Arc<dyn WebSocketSession>,
        scheduler: Arc<dyn TaskScheduler>,
        heartbeat_time: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: SessionId::generate(),
            inner,
            scheduler,
            heartbeat_time,
            init: Mutex::new(InitState::default()),
            heartbeat_task: Mutex::new(None),
            heartbeat_disabled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Returns the underlying WebSocket session.
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn WebSocketSession> {
        &self.inner
    }

    /// Writes the open frame followed by messages cached before it.
    async fn initialize(&self) -> Result<()> {
        self.write_frame(SockJsFrame::open()).await?;

        let pending = {
            let mut init = self.init.lock();
            init.open_frame_sent = true;
            std::mem::take(&mut init.pending)
        };
        if !pending.is_empty() {
            self.write_frame(SockJsFrame::message(pending.as_slice())?).await?;
        }
        self.schedule_heartbeat();
        Ok(())
    }

    async fn write_frame(&self, frame: SockJsFrame) -> Result<()> {
        trace!(session_id = %self.id, frame = %frame, "Writing SockJS frame");
        self.inner
            .send_message(WebSocketMessage::Text(frame.content().to_owned()))
            .await
            .map_err(|e| Error::transport_failure(format!("Failed to write {frame}: {e}"), self.id.as_str()))
    }

    async fn send_heartbeat(&self) {
        if !self.is_open() || self.heartbeat_disabled.load(Ordering::SeqCst) {
            return;
        }
        match self.write_frame(SockJsFrame::heartbeat()).await {
            Ok(()) => self.schedule_heartbeat(),
            Err(e) => debug!(session_id = %self.id, error = %e, "Failed to send heartbeat"),
        }
    }

    fn schedule_heartbeat(&self) {
        if self.heartbeat_disabled.load(Ordering::SeqCst) || !self.is_open() {
            return;
        }
        let weak = self.self_ref.clone();
        let task = self.scheduler.schedule(
            self.heartbeat_time,
            Box::new(move || {
                if let Some(session) = weak.upgrade() {
                    tokio::spawn(async move { session.send_heartbeat().await });
                }
            }),
        );
        if let Some(previous) = self.heartbeat_task.lock().replace(task) {
            previous.cancel();
        }
    }

    fn cancel_heartbeat(&self) {
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.cancel();
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_heartbeat();
    }
}

#[async_trait]
impl WebSocketSession for SockJsServerSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::SockJsWebSocket
    }

    fn accepted_protocol(&self) -> Option<&str> {
        self.inner.accepted_protocol()
    }

    fn principal(&self) -> Option<Principal> {
        self.inner.principal()
    }

    fn attributes(&self) -> &SessionAttributes {
        self.inner.attributes()
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.inner.is_open()
    }

    fn text_message_size_limit(&self) -> usize {
        self.inner.text_message_size_limit()
    }

    fn set_text_message_size_limit(&self, limit: usize) {
        self.inner.set_text_message_size_limit(limit);
    }

    fn binary_message_size_limit(&self) -> usize {
        self.inner.binary_message_size_limit()
    }

    fn set_binary_message_size_limit(&self, limit: usize) {
        self.inner.set_binary_message_size_limit(limit);
    }

    fn disable_heartbeat(&self) {
        self.heartbeat_disabled.store(true, Ordering::SeqCst);
        self.cancel_heartbeat();
    }

    async fn send_message(&self, message: WebSocketMessage) -> Result<()> {
        let WebSocketMessage::Text(text) = message else {
            return Err(Error::invalid_argument("SockJS supports text messages only"));
        };
        if !self.is_open() {
            return Err(Error::session_not_open(self.id.clone()));
        }

        {
            let mut init = self.init.lock();
            if !init.open_frame_sent {
                init.pending.push(text);
                return Ok(());
            }
        }

        self.cancel_heartbeat();
        self.write_frame(SockJsFrame::message(&[text])?).await?;
        self.schedule_heartbeat();
        Ok(())
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_heartbeat();

        if status != CloseStatus::SESSION_NOT_RELIABLE && self.inner.is_open() {
            match SockJsFrame::close(&status) {
                Ok(frame) => {
                    if let Err(e) = self.write_frame(frame).await {
                        debug!(session_id = %self.id, error = %e, "Failed to write close frame");
                    }
                }
                Err(e) => debug!(session_id = %self.id, error = %e, "Failed to encode close frame"),
            }
        }
        self.inner.close(status).await
    }
}

impl fmt::Debug for SockJsServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockJsServerSession")
            .field("id", &self.id)
            .field("inner", self.inner.id())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SockJsWebSocketHandler
// ============================================================================

/// Adapts raw WebSocket callbacks to SockJS sessions for `delegate`.
pub struct SockJsWebSocketHandler {
    delegate: Arc<dyn WebSocketHandler>,
    scheduler: Arc<dyn TaskScheduler>,
    heartbeat_time: Duration,
    sessions: RwLock<FxHashMap<SessionId, Arc<SockJsServerSession>>>,
}

impl SockJsWebSocketHandler {
    /// Creates a handler with the default heartbeat time.
    #[must_use]
    pub fn new(delegate: Arc<dyn WebSocketHandler>, scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            delegate,
            scheduler,
            heartbeat_time: DEFAULT_HEARTBEAT_TIME,
            sessions: RwLock::new(FxHashMap::default()),
        }
    }

    /// Sets the heartbeat time.
    #[must_use]
    pub fn with_heartbeat_time(mut self, heartbeat_time: Duration) -> Self {
        self.heartbeat_time = heartbeat_time;
        self
    }

    fn sockjs_session(&self, raw: &dyn WebSocketSession) -> Result<Arc<SockJsServerSession>> {
        self.sessions
            .read()
            .get(raw.id())
            .cloned()
            .ok_or_else(|| Error::session_not_open(raw.id().clone()))
    }
}

#[async_trait]
impl WebSocketHandler for SockJsWebSocketHandler {
    async fn after_connection_established(&self, session: Arc<dyn WebSocketSession>) -> Result<()> {
        let sockjs = SockJsServerSession::new(
            Arc::clone(&session),
            Arc::clone(&self.scheduler),
            self.heartbeat_time,
        );
        self.sessions
            .write()
            .insert(session.id().clone(), Arc::clone(&sockjs));
        debug!(session_id = %sockjs.id(), raw_session_id = %session.id(), "SockJS session started");

        let delegate_result = self
            .delegate
            .after_connection_established(Arc::clone(&sockjs) as Arc<dyn WebSocketSession>)
            .await;
        if let Err(e) = delegate_result {
            error!(session_id = %sockjs.id(), error = %e, "Failed to start SockJS session");
            let _ = sockjs.close(CloseStatus::SERVER_ERROR).await;
            return Err(e);
        }
        sockjs.initialize().await
    }

    async fn handle_message(
        &self,
        session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
    ) -> Result<()> {
        let sockjs = self.sockjs_session(session.as_ref())?;
        let Some(payload) = message.as_text().filter(|p| !p.trim().is_empty()) else {
            return Ok(());
        };

        let messages = match decode_messages(payload) {
            Ok(messages) => messages,
            Err(e) => {
                error!(session_id = %sockjs.id(), error = %e, "Broken SockJS data received, closing");
                let _ = sockjs.close(CloseStatus::BAD_DATA).await;
                return Ok(());
            }
        };

        let as_session = Arc::clone(&sockjs) as Arc<dyn WebSocketSession>;
        for text in messages {
            self.delegate
                .handle_message(Arc::clone(&as_session), WebSocketMessage::Text(text))
                .await?;
        }
        Ok(())
    }

    async fn handle_transport_error(
        &self,
        session: Arc<dyn WebSocketSession>,
        error: &Error,
    ) -> Result<()> {
        let sockjs = self.sockjs_session(session.as_ref())?;
        self.delegate.handle_transport_error(sockjs, error).await
    }

    async fn after_connection_closed(
        &self,
        session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
    ) -> Result<()> {
        let Some(sockjs) = self.sessions.write().remove(session.id()) else {
            return Ok(());
        };
        sockjs.mark_closed();
        debug!(session_id = %sockjs.id(), %status, "SockJS session closed");
        self.delegate.after_connection_closed(sockjs, status).await
    }
}

impl fmt::Debug for SockJsWebSocketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockJsWebSocketHandler")
            .field("heartbeat_time", &self.heartbeat_time)
            .field("sessions", &self.sessions.read().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

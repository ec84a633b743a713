//! Multiplexing WebSocket handler.
//!
//! Owns the registry of open sessions, picks a [`SubProtocolHandler`] per
//! session from the negotiated sub-protocol and routes traffic in both
//! directions.
//!
//! # Session Registry
//!
//! ```text
//! after_connection_established ──► decorate ──► register ──► handler.after_session_started
//! handle_message ────────────────► holder ───► handler.handle_message_from_client ──► sweep
//! outbound channel ──────────────► resolve id ► holder ──► handler.handle_message_to_client
//! after_connection_closed ───────► unregister ► handler.after_session_ended
//! ```
//!
//! # Liveness Sweep
//!
//! Sessions that complete the transport handshake but never exchange a
//! sub-protocol message are closed with [`CloseStatus::SESSION_NOT_RELIABLE`]
//! once they are older than `time_to_first_message`. The sweep piggybacks on
//! inbound traffic and runs at most once per half grace period; a task that
//! loses the try-lock skips the round.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::Message;
use crate::transport::{
    CloseStatus, ConcurrentSendSession, OverflowStrategy, SessionKind, WebSocketHandler,
    WebSocketMessage, WebSocketSession,
};

use super::channel::MessageChannel;
use super::sub_protocol::SubProtocolHandler;

// ============================================================================
// Constants
// ============================================================================

/// Default send time limit of the session decorator.
pub const DEFAULT_SEND_TIME_LIMIT: Duration = Duration::from_secs(10);

/// Default send buffer size limit of the session decorator.
pub const DEFAULT_SEND_BUFFER_SIZE_LIMIT: usize = 512 * 1024;

/// Default grace period before a silent session is closed.
pub const DEFAULT_TIME_TO_FIRST_MESSAGE: Duration = Duration::from_secs(60);

// ============================================================================
// TransportOptions
// ============================================================================

/// Per-session transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Maximum duration of a single write before further sends fail.
    pub send_time_limit: Duration,
    /// Maximum bytes buffered while a write is in flight.
    pub send_buffer_size_limit: usize,
    /// Behavior when the buffer limit is exceeded.
    pub overflow_strategy: OverflowStrategy,
    /// Grace period for the first sub-protocol message.
    pub time_to_first_message: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            send_time_limit: DEFAULT_SEND_TIME_LIMIT,
            send_buffer_size_limit: DEFAULT_SEND_BUFFER_SIZE_LIMIT,
            overflow_strategy: OverflowStrategy::Terminate,
            time_to_first_message: DEFAULT_TIME_TO_FIRST_MESSAGE,
        }
    }
}

impl TransportOptions {
    #[must_use]
    pub fn with_send_time_limit(mut self, limit: Duration) -> Self {
        self.send_time_limit = limit;
        self
    }

    #[must_use]
    pub fn with_send_buffer_size_limit(mut self, limit: usize) -> Self {
        self.send_buffer_size_limit = limit;
        self
    }

    #[must_use]
    pub fn with_overflow_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_time_to_first_message(mut self, grace: Duration) -> Self {
        self.time_to_first_message = grace;
        self
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Session counters of a [`SubProtocolWebSocketHandler`].
#[derive(Debug, Default)]
pub struct HandlerStats {
    websocket_current: AtomicU64,
    websocket_total: AtomicU64,
    http_streaming_current: AtomicU64,
    http_streaming_total: AtomicU64,
    http_polling_current: AtomicU64,
    http_polling_total: AtomicU64,
    limit_exceeded: AtomicU64,
    no_messages_received: AtomicU64,
    transport_errors: AtomicU64,
}

/// Point-in-time copy of [`HandlerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStatsSnapshot {
    pub websocket_current: u64,
    pub websocket_total: u64,
    pub http_streaming_current: u64,
    pub http_streaming_total: u64,
    pub http_polling_current: u64,
    pub http_polling_total: u64,
    pub limit_exceeded: u64,
    pub no_messages_received: u64,
    pub transport_errors: u64,
}

impl HandlerStats {
    fn counters(&self, kind: SessionKind) -> (&AtomicU64, &AtomicU64) {
        match kind {
            SessionKind::WebSocket | SessionKind::SockJsWebSocket => {
                (&self.websocket_current, &self.websocket_total)
            }
            SessionKind::HttpStreaming => (&self.http_streaming_current, &self.http_streaming_total),
            SessionKind::HttpPolling => (&self.http_polling_current, &self.http_polling_total),
        }
    }

    fn session_opened(&self, kind: SessionKind) {
        let (current, total) = self.counters(kind);
        current.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(1, Ordering::Relaxed);
    }

    fn session_closed(&self, kind: SessionKind) {
        let (current, _) = self.counters(kind);
        let _ = current.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            websocket_current: self.websocket_current.load(Ordering::Relaxed),
            websocket_total: self.websocket_total.load(Ordering::Relaxed),
            http_streaming_current: self.http_streaming_current.load(Ordering::Relaxed),
            http_streaming_total: self.http_streaming_total.load(Ordering::Relaxed),
            http_polling_current: self.http_polling_current.load(Ordering::Relaxed),
            http_polling_total: self.http_polling_total.load(Ordering::Relaxed),
            limit_exceeded: self.limit_exceeded.load(Ordering::Relaxed),
            no_messages_received: self.no_messages_received.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for HandlerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot();
        let current = s.websocket_current + s.http_streaming_current + s.http_polling_current;
        let total = s.websocket_total + s.http_streaming_total + s.http_polling_total;
        let abnormal = s.no_messages_received + s.limit_exceeded + s.transport_errors;
        write!(
            f,
            "{current} current WS({})-HttpStream({})-HttpPoll({}), {total} total, \
             {abnormal} closed abnormally ({} connect failure, {} send limit, {} transport error)",
            s.websocket_current,
            s.http_streaming_current,
            s.http_polling_current,
            s.no_messages_received,
            s.limit_exceeded,
            s.transport_errors
        )
    }
}

// ============================================================================
// SessionHolder
// ============================================================================

struct SessionHolder {
    session: Arc<ConcurrentSendSession>,
    handler: Arc<dyn SubProtocolHandler>,
    created_at: Instant,
    has_handled_messages: AtomicBool,
}

impl SessionHolder {
    fn session(&self) -> Arc<dyn WebSocketSession> {
        Arc::clone(&self.session) as Arc<dyn WebSocketSession>
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`SubProtocolWebSocketHandler`].
pub struct SubProtocolWebSocketHandlerBuilder {
    client_inbound: Arc<dyn MessageChannel>,
    handlers: Vec<Arc<dyn SubProtocolHandler>>,
    default_handler: Option<Arc<dyn SubProtocolHandler>>,
    options: TransportOptions,
}

impl SubProtocolWebSocketHandlerBuilder {
    /// Registers a handler under all of its supported protocols.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn SubProtocolHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Sets the handler used when no sub-protocol was negotiated.
    #[must_use]
    pub fn with_default_handler(mut self, handler: Arc<dyn SubProtocolHandler>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    /// Sets per-session transport settings.
    #[must_use]
    pub fn with_transport_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if two different handlers claim the same
    /// protocol name, ignoring case.
    pub fn build(self) -> Result<Arc<SubProtocolWebSocketHandler>> {
        let mut by_protocol: FxHashMap<String, Arc<dyn SubProtocolHandler>> =
            FxHashMap::default();
        let mut distinct: Vec<Arc<dyn SubProtocolHandler>> = Vec::new();

        let all = self.handlers.iter().chain(self.default_handler.iter());
        for handler in all {
            if !distinct.iter().any(|h| Arc::ptr_eq(h, handler)) {
                distinct.push(Arc::clone(handler));
            }
            for protocol in handler.supported_protocols() {
                let key = protocol.to_ascii_lowercase();
                match by_protocol.get(&key) {
                    Some(existing) if !Arc::ptr_eq(existing, handler) => {
                        return Err(Error::config(format!(
                            "Cannot map {protocol} to a second handler, it is already mapped"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        by_protocol.insert(key, Arc::clone(handler));
                    }
                }
            }
        }

        // A lone handler also serves sessions without a negotiated protocol.
        let default_handler = self
            .default_handler
            .or_else(|| (distinct.len() == 1).then(|| Arc::clone(&distinct[0])));

        let mut protocols: Vec<String> = by_protocol.keys().cloned().collect();
        protocols.sort();
        debug!(?protocols, "Sub-protocol handlers registered");

        Ok(Arc::new(SubProtocolWebSocketHandler {
            client_inbound: self.client_inbound,
            handlers_by_protocol: by_protocol,
            handlers: distinct,
            default_handler,
            options: self.options,
            sessions: RwLock::new(FxHashMap::default()),
            last_session_check: tokio::sync::Mutex::new(Instant::now()),
            running: AtomicBool::new(false),
            outbound_task: Mutex::new(None),
            stats: HandlerStats::default(),
        }))
    }
}

// ============================================================================
// SubProtocolWebSocketHandler
// ============================================================================

/// [`WebSocketHandler`] that delegates to [`SubProtocolHandler`]s.
pub struct SubProtocolWebSocketHandler {
    client_inbound: Arc<dyn MessageChannel>,
    handlers_by_protocol: FxHashMap<String, Arc<dyn SubProtocolHandler>>,
    handlers: Vec<Arc<dyn SubProtocolHandler>>,
    default_handler: Option<Arc<dyn SubProtocolHandler>>,
    options: TransportOptions,

    sessions: RwLock<FxHashMap<SessionId, Arc<SessionHolder>>>,
    /// Time of the last liveness sweep; `try_lock` elects the sweeper.
    last_session_check: tokio::sync::Mutex<Instant>,

    running: AtomicBool,
    outbound_task: Mutex<Option<JoinHandle<()>>>,
    stats: HandlerStats,
}

impl SubProtocolWebSocketHandler {
    /// Creates a builder forwarding decoded client messages to
    /// `client_inbound`.
    #[must_use]
    pub fn builder(client_inbound: Arc<dyn MessageChannel>) -> SubProtocolWebSocketHandlerBuilder {
        SubProtocolWebSocketHandlerBuilder {
            client_inbound,
            handlers: Vec::new(),
            default_handler: None,
            options: TransportOptions::default(),
        }
    }

    /// Returns all protocol names, lowercased and sorted.
    #[must_use]
    pub fn sub_protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.handlers_by_protocol.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    /// Returns the transport settings.
    #[inline]
    #[must_use]
    pub fn transport_options(&self) -> &TransportOptions {
        &self.options
    }

    /// Returns the session counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    /// Returns the number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts consuming the client-outbound channel.
    pub fn start(self: &Arc<Self>, mut client_outbound: mpsc::UnboundedReceiver<Message>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Handler already running");
            return;
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(message) = client_outbound.recv().await {
                this.handle_outbound(message).await;
            }
            debug!("Client outbound channel closed");
        });
        *self.outbound_task.lock() = Some(task);
        info!("Sub-protocol WebSocket handler started");
    }

    /// Stops outbound routing and closes all sessions with
    /// [`CloseStatus::GOING_AWAY`].
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.outbound_task.lock().take() {
            task.abort();
        }

        let holders: Vec<Arc<SessionHolder>> = self.sessions.read().values().cloned().collect();
        for holder in holders {
            if let Err(e) = holder.session.close(CloseStatus::GOING_AWAY).await {
                debug!(session_id = %holder.session.id(), error = %e, "Failed to close session");
            }
        }
        info!(stats = %self.stats, "Sub-protocol WebSocket handler stopped");
    }

    /// Routes a message from the routing layer to its session.
    pub async fn handle_outbound(&self, message: Message) {
        let Some(session_id) = self.resolve_session_id(&message) else {
            error!(message_type = ?message.headers().message_type(), "Could not find session id in outbound message");
            return;
        };

        let Some(holder) = self.sessions.read().get(&session_id).cloned() else {
            debug!(%session_id, "No session for outbound message");
            return;
        };

        let session = holder.session();
        let result = holder
            .handler
            .handle_message_to_client(Arc::clone(&session), message)
            .await;

        match result {
            Ok(()) => {}
            Err(e) => match e.limit_exceeded_status() {
                Some(status) => {
                    warn!(%session_id, error = %e, "Terminating session");
                    self.stats.limit_exceeded.fetch_add(1, Ordering::Relaxed);
                    // Clear first; the session may be unresponsive.
                    if let Err(e) = self.clear_session(&session_id, status.clone()).await {
                        debug!(%session_id, error = %e, "Failure while clearing session");
                    }
                    if let Err(e) = session.close(status).await {
                        debug!(%session_id, error = %e, "Failure while closing session");
                    }
                }
                None => {
                    debug!(%session_id, error = %e, "Failed to send message to client");
                }
            },
        }
    }

    fn resolve_session_id(&self, message: &Message) -> Option<SessionId> {
        self.handlers
            .iter()
            .find_map(|handler| handler.resolve_session_id(message))
    }

    fn find_handler(&self, session: &dyn WebSocketSession) -> Result<Arc<dyn SubProtocolHandler>> {
        match session.accepted_protocol().filter(|p| !p.is_empty()) {
            Some(protocol) => self
                .handlers_by_protocol
                .get(&protocol.to_ascii_lowercase())
                .cloned()
                .ok_or_else(|| {
                    Error::config(format!("No handler for '{protocol}' in {:?}", self.sub_protocols()))
                }),
            None => self.default_handler.clone().ok_or_else(|| {
                Error::config(
                    "Multiple protocol handlers configured and no protocol was negotiated. \
                     Configure a default handler.",
                )
            }),
        }
    }

    /// Unregisters a session and notifies its handler once.
    async fn clear_session(&self, session_id: &SessionId, status: CloseStatus) -> Result<()> {
        let Some(holder) = self.sessions.write().remove(session_id) else {
            trace!(%session_id, "Session already cleared");
            return Ok(());
        };
        debug!(%session_id, %status, "Clearing session");
        self.stats.session_closed(holder.session.kind());
        holder
            .handler
            .after_session_ended(holder.session(), status, &*self.client_inbound)
            .await
    }

    /// Closes sessions that never exchanged a sub-protocol message.
    async fn check_sessions(&self) {
        if !self.is_running() {
            return;
        }
        let grace = self.options.time_to_first_message;
        let Ok(mut last_check) = self.last_session_check.try_lock() else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(*last_check) < grace / 2 {
            return;
        }

        let stale: Vec<Arc<SessionHolder>> = self
            .sessions
            .read()
            .values()
            .filter(|holder| {
                !holder.has_handled_messages.load(Ordering::SeqCst)
                    && now.duration_since(holder.created_at) >= grace
            })
            .cloned()
            .collect();

        for holder in stale {
            let elapsed = now.duration_since(holder.created_at);
            info!(
                session_id = %holder.session.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "No messages received, closing session"
            );
            self.stats.no_messages_received.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = holder.session.close(CloseStatus::SESSION_NOT_RELIABLE).await {
                debug!(session_id = %holder.session.id(), error = %e, "Failure while closing session");
            }
        }

        *last_check = now;
    }
}

// ============================================================================
// WebSocketHandler Implementation
// ============================================================================

#[async_trait]
impl WebSocketHandler for SubProtocolWebSocketHandler {
    async fn after_connection_established(&self, session: Arc<dyn WebSocketSession>) -> Result<()> {
        if !session.is_open() {
            return Ok(());
        }

        let handler = self.find_handler(session.as_ref())?;
        let decorated = Arc::new(ConcurrentSendSession::with_overflow_strategy(
            session,
            self.options.send_time_limit,
            self.options.send_buffer_size_limit,
            self.options.overflow_strategy,
        ));

        let holder = Arc::new(SessionHolder {
            session: decorated,
            handler: Arc::clone(&handler),
            created_at: Instant::now(),
            has_handled_messages: AtomicBool::new(false),
        });
        let session_id = holder.session.id().clone();
        self.stats.session_opened(holder.session.kind());
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::clone(&holder));

        debug!(%session_id, protocol = ?holder.session.accepted_protocol(), "Session registered");
        handler
            .after_session_started(holder.session(), &*self.client_inbound)
            .await
    }

    async fn handle_message(
        &self,
        session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
    ) -> Result<()> {
        let holder = self.sessions.read().get(session.id()).cloned();
        let (session, handler) = match holder {
            Some(ref holder) => (holder.session(), Arc::clone(&holder.handler)),
            None => {
                let handler = self.find_handler(session.as_ref())?;
                (session, handler)
            }
        };

        handler
            .handle_message_from_client(session, message, &*self.client_inbound)
            .await?;

        if let Some(holder) = holder {
            holder.has_handled_messages.store(true, Ordering::SeqCst);
        }
        self.check_sessions().await;
        Ok(())
    }

    async fn handle_transport_error(
        &self,
        session: Arc<dyn WebSocketSession>,
        error: &Error,
    ) -> Result<()> {
        debug!(session_id = %session.id(), error = %error, "Transport error");
        self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn after_connection_closed(
        &self,
        session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
    ) -> Result<()> {
        self.clear_session(session.id(), status).await
    }
}

impl fmt::Debug for SubProtocolWebSocketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubProtocolWebSocketHandler")
            .field("protocols", &self.sub_protocols())
            .field("sessions", &self.session_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::handler::{StompSubProtocolHandler, UnboundedMessageChannel};
    use crate::protocol::{HeartBeat, MessageHeaders, StompCommand};
    use crate::testing::{RecordingChannel, RecordingSession};

    // ------------------------------------------------------------------------
    // Test double
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeProtocolHandler {
        protocols: Vec<String>,
        started: Mutex<Vec<SessionId>>,
        received: Mutex<Vec<String>>,
        delivered: Mutex<Vec<Message>>,
        ended: Mutex<Vec<(SessionId, CloseStatus)>>,
        outbound_error: Option<CloseStatus>,
    }

    impl FakeProtocolHandler {
        fn new(protocols: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                protocols: protocols.iter().map(|p| (*p).to_owned()).collect(),
                ..Self::default()
            })
        }

        fn failing_outbound(protocols: &[&str], status: CloseStatus) -> Arc<Self> {
            Arc::new(Self {
                protocols: protocols.iter().map(|p| (*p).to_owned()).collect(),
                outbound_error: Some(status),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl SubProtocolHandler for FakeProtocolHandler {
        fn supported_protocols(&self) -> Vec<String> {
            self.protocols.clone()
        }

        async fn after_session_started(
            &self,
            session: Arc<dyn WebSocketSession>,
            _output: &dyn MessageChannel,
        ) -> Result<()> {
            self.started.lock().push(session.id().clone());
            Ok(())
        }

        async fn handle_message_from_client(
            &self,
            _session: Arc<dyn WebSocketSession>,
            message: WebSocketMessage,
            _output: &dyn MessageChannel,
        ) -> Result<()> {
            self.received
                .lock()
                .push(message.as_text().unwrap_or_default().to_owned());
            Ok(())
        }

        async fn handle_message_to_client(
            &self,
            session: Arc<dyn WebSocketSession>,
            message: Message,
        ) -> Result<()> {
            if let Some(ref status) = self.outbound_error {
                return Err(Error::session_limit_exceeded("too slow", status.clone()));
            }
            self.delivered.lock().push(message);
            session.send_message(WebSocketMessage::text("out")).await
        }

        fn resolve_session_id(&self, message: &Message) -> Option<SessionId> {
            message.headers().session_id().cloned()
        }

        async fn after_session_ended(
            &self,
            session: Arc<dyn WebSocketSession>,
            status: CloseStatus,
            _output: &dyn MessageChannel,
        ) -> Result<()> {
            self.ended.lock().push((session.id().clone(), status));
            Ok(())
        }
    }

    fn outbound_for(session_id: &str) -> Message {
        let mut headers = MessageHeaders::stomp(StompCommand::Message);
        headers.set_session_id(SessionId::from(session_id));
        Message::empty(headers)
    }

    fn build(handlers: &[&Arc<FakeProtocolHandler>]) -> Arc<SubProtocolWebSocketHandler> {
        handlers
            .iter()
            .fold(
                SubProtocolWebSocketHandler::builder(Arc::new(RecordingChannel::new())),
                |builder, handler| {
                    builder.with_handler(Arc::clone(*handler) as Arc<dyn SubProtocolHandler>)
                },
            )
            .build()
            .unwrap()
    }

    async fn establish(
        handler: &SubProtocolWebSocketHandler,
        session: &Arc<RecordingSession>,
    ) -> Result<()> {
        handler
            .after_connection_established(Arc::clone(session) as Arc<dyn WebSocketSession>)
            .await
    }

    async fn receive(handler: &SubProtocolWebSocketHandler, session: &Arc<RecordingSession>, text: &str) {
        handler
            .handle_message(
                Arc::clone(session) as Arc<dyn WebSocketSession>,
                WebSocketMessage::text(text),
            )
            .await
            .unwrap();
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    #[test]
    fn test_duplicate_protocol_rejected() {
        let result = SubProtocolWebSocketHandler::builder(Arc::new(RecordingChannel::new()))
            .with_handler(FakeProtocolHandler::new(&["v12.stomp"]))
            .with_handler(FakeProtocolHandler::new(&["V12.STOMP"]))
            .build();

        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_same_handler_registered_twice() {
        let stomp = FakeProtocolHandler::new(&["v11.stomp", "v12.stomp"]);
        let handler = build(&[&stomp, &stomp]);

        assert_eq!(handler.sub_protocols(), vec!["v11.stomp", "v12.stomp"]);
    }

    #[tokio::test]
    async fn test_routes_by_protocol_case_insensitively() {
        let stomp = FakeProtocolHandler::new(&["v12.stomp"]);
        let mqtt = FakeProtocolHandler::new(&["mqtt"]);
        let handler = build(&[&stomp, &mqtt]);

        let session = Arc::new(RecordingSession::new("s1").with_protocol("V12.Stomp"));
        establish(&handler, &session).await.unwrap();
        receive(&handler, &session, "hello").await;

        assert_eq!(stomp.received.lock().clone(), vec!["hello"]);
        assert!(mqtt.started.lock().is_empty());
        assert_eq!(handler.stats().snapshot().websocket_current, 1);
    }

    #[tokio::test]
    async fn test_no_protocol_requires_default() {
        let handler = build(&[
            &FakeProtocolHandler::new(&["v12.stomp"]),
            &FakeProtocolHandler::new(&["mqtt"]),
        ]);
        let session = Arc::new(RecordingSession::new("s1"));
        assert!(establish(&handler, &session).await.is_err());

        let single = FakeProtocolHandler::new(&["v12.stomp"]);
        let handler = build(&[&single]);
        establish(&handler, &session).await.unwrap();
        assert_eq!(single.started.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_default_handler() {
        let fallback = FakeProtocolHandler::new(&[]);
        let handler = SubProtocolWebSocketHandler::builder(Arc::new(RecordingChannel::new()))
            .with_handler(FakeProtocolHandler::new(&["v12.stomp"]))
            .with_handler(FakeProtocolHandler::new(&["mqtt"]))
            .with_default_handler(fallback.clone())
            .build()
            .unwrap();

        let session = Arc::new(RecordingSession::new("s1"));
        establish(&handler, &session).await.unwrap();
        assert_eq!(fallback.started.lock().len(), 1);
    }

    // ------------------------------------------------------------------------
    // Liveness sweep
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_silent_sessions() {
        let fake = FakeProtocolHandler::new(&["v12.stomp"]);
        let handler = build(&[&fake]);
        let (_tx, rx) = mpsc::unbounded_channel();
        handler.start(rx);

        let silent = Arc::new(RecordingSession::new("silent"));
        let chatty = Arc::new(RecordingSession::new("chatty"));
        establish(&handler, &silent).await.unwrap();
        establish(&handler, &chatty).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        receive(&handler, &chatty, "CONNECT").await;
        assert!(silent.close_statuses().is_empty());

        tokio::time::advance(Duration::from_secs(41)).await;
        receive(&handler, &chatty, "SEND").await;

        assert_eq!(silent.close_statuses(), vec![CloseStatus::SESSION_NOT_RELIABLE]);
        assert!(chatty.close_statuses().is_empty());
        assert_eq!(handler.stats().snapshot().no_messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skipped_when_not_running() {
        let handler = build(&[&FakeProtocolHandler::new(&["v12.stomp"])]);

        let silent = Arc::new(RecordingSession::new("silent"));
        let chatty = Arc::new(RecordingSession::new("chatty"));
        establish(&handler, &silent).await.unwrap();
        establish(&handler, &chatty).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        receive(&handler, &chatty, "SEND").await;

        assert!(silent.close_statuses().is_empty());
    }

    // ------------------------------------------------------------------------
    // Outbound routing and lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_outbound_routed_to_session() {
        let fake = FakeProtocolHandler::new(&["v12.stomp"]);
        let handler = build(&[&fake]);
        let session = Arc::new(RecordingSession::new("s1"));
        establish(&handler, &session).await.unwrap();

        handler.handle_outbound(outbound_for("s1")).await;
        handler.handle_outbound(outbound_for("unknown")).await;

        assert_eq!(fake.delivered.lock().len(), 1);
        assert_eq!(session.sent_texts(), vec!["out"]);
    }

    #[tokio::test]
    async fn test_limit_exceeded_clears_and_closes() {
        let fake = FakeProtocolHandler::failing_outbound(&["v12.stomp"], CloseStatus::SESSION_NOT_RELIABLE);
        let handler = build(&[&fake]);
        let session = Arc::new(RecordingSession::new("s1"));
        establish(&handler, &session).await.unwrap();

        handler.handle_outbound(outbound_for("s1")).await;

        assert_eq!(handler.session_count(), 0);
        assert_eq!(session.close_statuses(), vec![CloseStatus::SESSION_NOT_RELIABLE]);
        assert_eq!(handler.stats().snapshot().limit_exceeded, 1);

        // The transport's close callback must not end the session twice.
        handler
            .after_connection_closed(
                Arc::clone(&session) as Arc<dyn WebSocketSession>,
                CloseStatus::SESSION_NOT_RELIABLE,
            )
            .await
            .unwrap();
        assert_eq!(fake.ended.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_all_sessions() {
        let handler = build(&[&FakeProtocolHandler::new(&["v12.stomp"])]);
        let (_tx, rx) = mpsc::unbounded_channel();
        handler.start(rx);
        let a = Arc::new(RecordingSession::new("a"));
        let b = Arc::new(RecordingSession::new("b"));
        establish(&handler, &a).await.unwrap();
        establish(&handler, &b).await.unwrap();

        handler.stop().await;

        assert!(!handler.is_running());
        assert_eq!(a.close_statuses(), vec![CloseStatus::GOING_AWAY]);
        assert_eq!(b.close_statuses(), vec![CloseStatus::GOING_AWAY]);
    }

    #[tokio::test]
    async fn test_connection_closed_ends_session() {
        let fake = FakeProtocolHandler::new(&["v12.stomp"]);
        let handler = build(&[&fake]);
        let session = Arc::new(RecordingSession::new("s1").with_kind(SessionKind::HttpStreaming));
        establish(&handler, &session).await.unwrap();
        handler
            .handle_transport_error(
                Arc::clone(&session) as Arc<dyn WebSocketSession>,
                &Error::connection("reset"),
            )
            .await
            .unwrap();

        handler
            .after_connection_closed(Arc::clone(&session) as Arc<dyn WebSocketSession>, CloseStatus::NORMAL)
            .await
            .unwrap();

        assert_eq!(fake.ended.lock().clone(), vec![(SessionId::from("s1"), CloseStatus::NORMAL)]);
        let stats = handler.stats().snapshot();
        assert_eq!(stats.http_streaming_current, 0);
        assert_eq!(stats.http_streaming_total, 1);
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(
            handler.stats().to_string(),
            "0 current WS(0)-HttpStream(0)-HttpPoll(0), 1 total, \
             1 closed abnormally (0 connect failure, 0 send limit, 1 transport error)"
        );
    }

    // ------------------------------------------------------------------------
    // End to end with STOMP
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stomp_connect_round_trip() {
        let (inbound, mut inbound_rx) = UnboundedMessageChannel::new();
        let handler = SubProtocolWebSocketHandler::builder(Arc::new(inbound))
            .with_handler(Arc::new(StompSubProtocolHandler::new()))
            .build()
            .unwrap();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        handler.start(outbound_rx);

        let session = Arc::new(RecordingSession::new("s1").with_protocol("v12.stomp"));
        establish(&handler, &session).await.unwrap();
        receive(
            &handler,
            &session,
            "CONNECT\naccept-version:1.1,1.2\nheart-beat:10000,10000\n\n\0",
        )
        .await;

        let connect = inbound_rx.recv().await.unwrap();
        assert_eq!(connect.headers().command(), Some(StompCommand::Connect));
        outbound_tx
            .send(Message::connect_ack(connect, Some(HeartBeat::new(10000, 10000))))
            .unwrap();

        for _ in 0..100 {
            if !session.sent_texts().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            session.sent_texts(),
            vec!["CONNECTED\nversion:1.2\nheart-beat:10000,10000\n\n\0"]
        );

        handler
            .after_connection_closed(Arc::clone(&session) as Arc<dyn WebSocketSession>, CloseStatus::NORMAL)
            .await
            .unwrap();
        let disconnect = inbound_rx.recv().await.unwrap();
        assert_eq!(disconnect.headers().command(), Some(StompCommand::Disconnect));
    }
}

//! In-memory doubles shared by unit tests.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::client::{ConnectionHandler, TcpConnection};
use crate::error::{Error, Result};
use crate::handler::MessageChannel;
use crate::identifiers::{Principal, SessionAttributes, SessionId};
use crate::protocol::Message;
use crate::scheduler::{RepeatingTask, ScheduledTask, Task, TaskScheduler};
use crate::transport::{CloseStatus, SessionKind, WebSocketHandler, WebSocketMessage, WebSocketSession};

// ============================================================================
// Logging
// ============================================================================

/// Installs a test subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stomp_websocket=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// RecordingSession
// ============================================================================

/// Session that records sends and closes.
pub struct RecordingSession {
    id: SessionId,
    kind: SessionKind,
    protocol: Option<String>,
    principal: Option<Principal>,
    attributes: SessionAttributes,
    send_delay: Option<Duration>,
    open: AtomicBool,
    fail_sends: AtomicBool,
    fail_closes: AtomicBool,
    heartbeat_disabled: AtomicBool,
    text_limit: AtomicUsize,
    binary_limit: AtomicUsize,
    sent: Mutex<Vec<WebSocketMessage>>,
    closes: Mutex<Vec<CloseStatus>>,
}

impl RecordingSession {
    pub fn new(id: &str) -> Self {
        Self {
            id: SessionId::new(id),
            kind: SessionKind::WebSocket,
            protocol: None,
            principal: None,
            attributes: SessionAttributes::new(),
            send_delay: None,
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            fail_closes: AtomicBool::new(false),
            heartbeat_disabled: AtomicBool::new(false),
            text_limit: AtomicUsize::new(64 * 1024),
            binary_limit: AtomicUsize::new(64 * 1024),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_kind(mut self, kind: SessionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_owned());
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn with_text_limit(self, limit: usize) -> Self {
        self.text_limit.store(limit, Ordering::SeqCst);
        self
    }

    /// Makes every following send fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Makes every following close fail after recording its status.
    pub fn fail_closes(&self) {
        self.fail_closes.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<WebSocketMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.as_text().map(str::to_owned))
            .collect()
    }

    pub fn close_statuses(&self) -> Vec<CloseStatus> {
        self.closes.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }

    pub fn heartbeat_disabled(&self) -> bool {
        self.heartbeat_disabled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebSocketSession for RecordingSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn kind(&self) -> SessionKind {
        self.kind
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

    fn disable_heartbeat(&self) {
        self.heartbeat_disabled.store(true, Ordering::SeqCst);
    }

    async fn send_message(&self, message: WebSocketMessage) -> Result<()> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::connection("send failed"));
        }
        if !self.is_open() {
            return Err(Error::session_not_open(self.id.clone()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closes.lock().push(status);
        if self.fail_closes.load(Ordering::SeqCst) {
            return Err(Error::connection("close failed"));
        }
        Ok(())
    }
}

// ============================================================================
// RecordingHandler
// ============================================================================

/// Handler that records lifecycle callbacks.
#[derive(Default)]
pub struct RecordingHandler {
    session: Mutex<Option<Arc<dyn WebSocketSession>>>,
    messages: Mutex<Vec<WebSocketMessage>>,
    errors: Mutex<Vec<String>>,
    close_status: Mutex<Option<CloseStatus>>,
    closed: Notify,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for `after_connection_closed`.
    pub async fn wait_closed(&self) {
        if self.close_status.lock().is_some() {
            return;
        }
        self.closed.notified().await;
    }

    pub fn established(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn session(&self) -> Option<Arc<dyn WebSocketSession>> {
        self.session.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| m.as_text().map(str::to_owned))
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn close_status(&self) -> Option<CloseStatus> {
        self.close_status.lock().clone()
    }

    pub fn accepted_protocol(&self) -> Option<String> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.accepted_protocol().map(str::to_owned))
    }
}

#[async_trait]
impl WebSocketHandler for RecordingHandler {
    async fn after_connection_established(&self, session: Arc<dyn WebSocketSession>) -> Result<()> {
        *self.session.lock() = Some(session);
        Ok(())
    }

    async fn handle_message(
        &self,
        _session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
    ) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }

    async fn handle_transport_error(
        &self,
        _session: Arc<dyn WebSocketSession>,
        error: &Error,
    ) -> Result<()> {
        self.errors.lock().push(error.to_string());
        Ok(())
    }

    async fn after_connection_closed(
        &self,
        _session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
    ) -> Result<()> {
        *self.close_status.lock() = Some(status);
        self.closed.notify_one();
        Ok(())
    }
}

// ============================================================================
// RecordingChannel
// ============================================================================

/// [`MessageChannel`] that stores messages.
#[derive(Default)]
pub struct RecordingChannel {
    messages: Mutex<Vec<Message>>,
    keep_mutable: bool,
    fail: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel whose sends always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_mutable_headers(mut self) -> Self {
        self.keep_mutable = true;
        self
    }

    /// Removes and returns the recorded messages.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }
}

impl MessageChannel for RecordingChannel {
    fn send(&self, message: Message) -> Result<()> {
        if self.fail {
            return Err(Error::processing("rejected"));
        }
        self.messages.lock().push(message);
        Ok(())
    }

    fn keeps_headers_mutable(&self) -> bool {
        self.keep_mutable
    }
}

// ============================================================================
// ManualScheduler
// ============================================================================

/// Scheduler whose tasks run only when a test says so.
#[derive(Default)]
pub struct ManualScheduler {
    one_shot: Mutex<Vec<(Duration, Task, ScheduledTask)>>,
    repeating: Mutex<Vec<(Duration, RepeatingTask, ScheduledTask)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of pending one-shot tasks.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.one_shot.lock().iter().map(|(d, _, _)| *d).collect()
    }

    /// Periods of live repeating tasks.
    pub fn repeating_periods(&self) -> Vec<Duration> {
        self.repeating
            .lock()
            .iter()
            .filter(|(_, _, handle)| !handle.is_cancelled())
            .map(|(d, _, _)| *d)
            .collect()
    }

    /// Runs all pending one-shot tasks that were not cancelled.
    pub fn run_scheduled(&self) -> usize {
        let tasks = std::mem::take(&mut *self.one_shot.lock());
        let mut ran = 0;
        for (_, task, handle) in tasks {
            if !handle.is_cancelled() {
                task();
                ran += 1;
            }
        }
        ran
    }

    /// Runs each live repeating task once.
    pub fn run_repeating(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.repeating.lock());
        tasks.retain(|(_, _, handle)| !handle.is_cancelled());
        for (_, task, _) in &mut tasks {
            task();
        }
        let ran = tasks.len();
        let mut repeating = self.repeating.lock();
        tasks.append(&mut repeating);
        *repeating = tasks;
        ran
    }
}

impl TaskScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let handle = ScheduledTask::new();
        self.one_shot.lock().push((delay, task, handle.clone()));
        handle
    }

    fn schedule_at_fixed_rate(&self, period: Duration, task: RepeatingTask) -> ScheduledTask {
        let handle = ScheduledTask::new();
        self.repeating.lock().push((period, task, handle.clone()));
        handle
    }
}

// ============================================================================
// RecordingConnectionHandler
// ============================================================================

/// [`ConnectionHandler`] that records events.
#[derive(Default)]
pub struct RecordingConnectionHandler {
    pub connected: AtomicBool,
    pub messages: Mutex<Vec<Message>>,
    pub failures: Mutex<Vec<String>>,
    pub connect_failures: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl ConnectionHandler for RecordingConnectionHandler {
    async fn after_connected(&self, _connection: Arc<dyn TcpConnection>) {
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn after_connect_failure(&self, error: &Error) {
        self.connect_failures.lock().push(error.to_string());
    }

    async fn handle_message(&self, message: Message) {
        self.messages.lock().push(message);
    }

    async fn handle_failure(&self, error: &Error) {
        self.failures.lock().push(error.to_string());
    }

    async fn after_connection_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

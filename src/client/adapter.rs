//! STOMP connection over a WebSocket session.
//!
//! [`WebSocketTcpConnectionAdapter`] is both the [`WebSocketHandler`] of
//! the underlying session and the [`TcpConnection`] handed to the
//! application:
//!
//! - Inbound WebSocket messages are reassembled with a buffering decoder
//!   and dispatched frame by frame.
//! - Outbound messages are encoded as text, or binary for non-empty
//!   `application/octet-stream` payloads on non-SockJS sessions.
//! - Read and write inactivity is checked at half the configured interval.
//! - A CONNECTED frame negotiates heartbeats against the CONNECT request.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::handler::stomp::frame_message;
use crate::protocol::{
    BufferingStompDecoder, HeartBeat, Message, StompCommand, StompDecoder, StompEncoder,
};
use crate::scheduler::{ScheduledTask, TaskScheduler};
use crate::transport::{CloseStatus, WebSocketHandler, WebSocketMessage, WebSocketSession};

use super::connection::{ConnectionHandler, InactivityCallback, TcpConnection};

// ============================================================================
// Constants
// ============================================================================

/// Server heartbeats may be late by this factor before the read
/// inactivity check fires.
const HEARTBEAT_MULTIPLIER: u32 = 3;

// ============================================================================
// WebSocketTcpConnectionAdapter
// ============================================================================

/// Adapts a WebSocket session to a STOMP [`TcpConnection`].
pub struct WebSocketTcpConnectionAdapter {
    connection_handler: Arc<dyn ConnectionHandler>,
    connect_message: Mutex<Option<Message>>,
    requested_heartbeat: HeartBeat,
    scheduler: Option<Arc<dyn TaskScheduler>>,

    decoder: Mutex<BufferingStompDecoder>,
    encoder: StompEncoder,
    session: OnceLock<Arc<dyn WebSocketSession>>,

    last_read: Arc<Mutex<Instant>>,
    last_write: Arc<Mutex<Instant>>,
    inactivity_tasks: Mutex<Vec<ScheduledTask>>,
    closed: AtomicBool,
    self_ref: Weak<Self>,
}

impl WebSocketTcpConnectionAdapter {
    /// Creates an adapter that sends `connect_message` once the session is
    /// established.
    #[must_use]
    pub fn new(
        connection_handler: Arc<dyn ConnectionHandler>,
        connect_message: Option<Message>,
        scheduler: Option<Arc<dyn TaskScheduler>>,
        inbound_message_size_limit: usize,
    ) -> Arc<Self> {
        let requested_heartbeat = connect_message
            .as_ref()
            .and_then(|m| m.headers().native().heartbeat())
            .unwrap_or_default();
        let now = Instant::now();

        Arc::new_cyclic(|self_ref| Self {
            connection_handler,
            connect_message: Mutex::new(connect_message),
            requested_heartbeat,
            scheduler,
            decoder: Mutex::new(BufferingStompDecoder::new(
                StompDecoder::new(),
                inbound_message_size_limit,
            )),
            encoder: StompEncoder::new(),
            session: OnceLock::new(),
            last_read: Arc::new(Mutex::new(now)),
            last_write: Arc::new(Mutex::new(now)),
            inactivity_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Returns the underlying session once established.
    #[must_use]
    pub fn session(&self) -> Option<&Arc<dyn WebSocketSession>> {
        self.session.get()
    }

    fn as_connection(&self) -> Option<Arc<dyn TcpConnection>> {
        self.self_ref
            .upgrade()
            .map(|adapter| adapter as Arc<dyn TcpConnection>)
    }

    fn schedule_inactivity_check(
        &self,
        last_activity: &Arc<Mutex<Instant>>,
        callback: InactivityCallback,
        duration: Duration,
    ) -> Result<()> {
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| Error::config("No task scheduler configured for inactivity checks"))?;

        let last_activity = Arc::clone(last_activity);
        let task = scheduler.schedule_at_fixed_rate(
            duration / 2,
            Box::new(move || {
                if last_activity.lock().elapsed() > duration {
                    callback();
                }
            }),
        );
        self.inactivity_tasks.lock().push(task);
        Ok(())
    }

    fn cancel_inactivity_tasks(&self) {
        for task in self.inactivity_tasks.lock().drain(..) {
            task.cancel();
        }
    }

    /// Sets up heartbeat tasks from the CONNECTED frame's `heart-beat`.
    fn init_heartbeat_tasks(&self, connected: HeartBeat) {
        let requested = self.requested_heartbeat;

        if requested.outgoing > 0 && connected.incoming > 0 {
            let interval = Duration::from_millis(requested.outgoing.max(connected.incoming));
            let weak = self.self_ref.clone();
            let callback: InactivityCallback = Box::new(move || {
                let Some(adapter) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    trace!("Sending heartbeat");
                    if let Err(e) = adapter.send(Message::heartbeat()).await {
                        debug!(error = %e, "Failed to send heartbeat");
                    }
                });
            });
            if let Err(e) = self.on_write_inactivity(callback, interval) {
                error!(error = %e, "Cannot schedule write heartbeats");
            }
        }

        if requested.incoming > 0 && connected.outgoing > 0 {
            let interval = Duration::from_millis(requested.incoming.max(connected.outgoing))
                * HEARTBEAT_MULTIPLIER;
            let weak = self.self_ref.clone();
            let callback: InactivityCallback = Box::new(move || {
                let Some(adapter) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let error = Error::connection(format!(
                        "Server has gone quiet for more than {}ms",
                        interval.as_millis()
                    ));
                    adapter.connection_handler.handle_failure(&error).await;
                    if let Err(e) = adapter.close().await {
                        debug!(error = %e, "Failed to close quiet connection");
                    }
                });
            });
            if let Err(e) = self.on_read_inactivity(callback, interval) {
                error!(error = %e, "Cannot schedule read heartbeat checks");
            }
        }
    }

    async fn dispatch(&self, message: Message) {
        if message.headers().is_heartbeat() {
            trace!("Received heartbeat");
            return;
        }
        if message.headers().command() == Some(StompCommand::Connected) {
            let heartbeat = message.headers().native().heartbeat().unwrap_or_default();
            self.init_heartbeat_tasks(heartbeat);
        }
        self.connection_handler.handle_message(message).await;
    }
}

// ============================================================================
// TcpConnection Implementation
// ============================================================================

#[async_trait]
impl TcpConnection for WebSocketTcpConnectionAdapter {
    async fn send(&self, message: Message) -> Result<()> {
        let session = self.session.get().ok_or(Error::ConnectionClosed)?;
        let headers = message.headers();
        let payload = message.payload();
        let bytes = self.encoder.encode(headers, payload)?;
        let frame = frame_message(bytes, headers, payload, session.kind())?;

        *self.last_write.lock() = Instant::now();
        session.send_message(frame).await
    }

    fn on_read_inactivity(&self, callback: InactivityCallback, duration: Duration) -> Result<()> {
        *self.last_read.lock() = Instant::now();
        self.schedule_inactivity_check(&self.last_read, callback, duration)
    }

    fn on_write_inactivity(&self, callback: InactivityCallback, duration: Duration) -> Result<()> {
        *self.last_write.lock() = Instant::now();
        self.schedule_inactivity_check(&self.last_write, callback, duration)
    }

    async fn close(&self) -> Result<()> {
        self.cancel_inactivity_tasks();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.session.get() {
            Some(session) => session.close(CloseStatus::NORMAL).await,
            None => Ok(()),
        }
    }
}

// ============================================================================
// WebSocketHandler Implementation
// ============================================================================

#[async_trait]
impl WebSocketHandler for WebSocketTcpConnectionAdapter {
    async fn after_connection_established(&self, session: Arc<dyn WebSocketSession>) -> Result<()> {
        if self.session.set(Arc::clone(&session)).is_err() {
            return Err(Error::invalid_argument("Adapter is already bound to a session"));
        }
        debug!(session_id = %session.id(), kind = %session.kind(), "STOMP transport connected");

        let now = Instant::now();
        *self.last_read.lock() = now;
        *self.last_write.lock() = now;

        if let Some(connection) = self.as_connection() {
            self.connection_handler.after_connected(connection).await;
        }

        let connect = self.connect_message.lock().take();
        if let Some(connect) = connect
            && let Err(e) = self.send(connect).await
        {
            error!(session_id = %session.id(), error = %e, "Failed to send CONNECT");
            self.connection_handler.handle_failure(&e).await;
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        _session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
    ) -> Result<()> {
        *self.last_read.lock() = Instant::now();

        let decoded = self.decoder.lock().decode(message.as_bytes());
        let messages = match decoded {
            Ok(messages) => messages,
            Err(e) => {
                debug!(error = %e, "Failed to decode inbound STOMP data");
                self.connection_handler.handle_failure(&e).await;
                return Ok(());
            }
        };

        for message in messages {
            self.dispatch(message).await;
        }
        Ok(())
    }

    async fn handle_transport_error(
        &self,
        _session: Arc<dyn WebSocketSession>,
        error: &Error,
    ) -> Result<()> {
        self.connection_handler.handle_failure(error).await;
        Ok(())
    }

    async fn after_connection_closed(
        &self,
        session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
    ) -> Result<()> {
        debug!(session_id = %session.id(), %status, "STOMP transport closed");
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_inactivity_tasks();
        self.connection_handler.after_connection_closed().await;
        Ok(())
    }
}

impl fmt::Debug for WebSocketTcpConnectionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTcpConnectionAdapter")
            .field("session", &self.session.get().map(|s| s.id().clone()))
            .field("requested_heartbeat", &self.requested_heartbeat)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

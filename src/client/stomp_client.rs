//! STOMP client over a [`WebSocketClient`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::headers::ACCEPT_VERSION;
use crate::protocol::{HeartBeat, Message, MessageHeaders, StompCommand, StompHeaders};
use crate::scheduler::TaskScheduler;
use crate::transport::WebSocketHandler;

use super::adapter::WebSocketTcpConnectionAdapter;
use super::connection::ConnectionHandler;
use super::websocket::WebSocketClient;

// ============================================================================
// Constants
// ============================================================================

/// Heartbeat requested when a scheduler is configured.
pub const DEFAULT_SCHEDULED_HEARTBEAT: HeartBeat = HeartBeat::new(10_000, 10_000);

/// Versions offered in `accept-version`.
const SUPPORTED_VERSIONS: &str = "1.1,1.2";

/// Default limit for reassembling inbound frames.
pub const DEFAULT_INBOUND_MESSAGE_SIZE_LIMIT: usize = 64 * 1024;

// ============================================================================
// WebSocketStompClient
// ============================================================================

/// Connects to STOMP servers over WebSocket or SockJS.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use stomp_websocket::client::{StandardWebSocketClient, WebSocketStompClient};
/// use stomp_websocket::scheduler::TokioTaskScheduler;
///
/// let client = WebSocketStompClient::new(Arc::new(StandardWebSocketClient::new()))
///     .with_scheduler(Arc::new(TokioTaskScheduler::new()));
/// assert!(client.is_default_heartbeat_enabled());
/// ```
pub struct WebSocketStompClient {
    client: Arc<dyn WebSocketClient>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    default_heartbeat: HeartBeat,
    inbound_message_size_limit: usize,
}

impl WebSocketStompClient {
    /// Creates a client without heartbeats.
    #[must_use]
    pub fn new(client: Arc<dyn WebSocketClient>) -> Self {
        Self {
            client,
            scheduler: None,
            default_heartbeat: HeartBeat::NONE,
            inbound_message_size_limit: DEFAULT_INBOUND_MESSAGE_SIZE_LIMIT,
        }
    }

    /// Sets the scheduler for heartbeats. Enables a `10000,10000` default
    /// heartbeat unless one was already set.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        if !self.is_default_heartbeat_enabled() {
            self.default_heartbeat = DEFAULT_SCHEDULED_HEARTBEAT;
        }
        self
    }

    /// Sets the heartbeat used when CONNECT headers carry none.
    #[must_use]
    pub fn with_default_heartbeat(mut self, heartbeat: HeartBeat) -> Self {
        self.default_heartbeat = heartbeat;
        self
    }

    /// Sets the limit for reassembling inbound frames.
    #[must_use]
    pub fn with_inbound_message_size_limit(mut self, limit: usize) -> Self {
        self.inbound_message_size_limit = limit;
        self
    }

    #[inline]
    #[must_use]
    pub fn default_heartbeat(&self) -> HeartBeat {
        self.default_heartbeat
    }

    /// Returns `true` if the default heartbeat is non-zero.
    #[inline]
    #[must_use]
    pub fn is_default_heartbeat_enabled(&self) -> bool {
        self.default_heartbeat.is_enabled()
    }

    /// Fills in `heart-beat` and `accept-version` if absent.
    fn process_connect_headers(&self, headers: Option<StompHeaders>) -> StompHeaders {
        let mut headers = headers.unwrap_or_default();
        if !headers.contains(ACCEPT_VERSION) {
            headers.set(ACCEPT_VERSION, SUPPORTED_VERSIONS);
        }
        if headers.heartbeat().is_none() {
            headers.set_heartbeat(self.default_heartbeat);
        }
        headers
    }

    /// Connects and sends CONNECT once the transport is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if heartbeats are requested without a
    /// scheduler, or the handshake error after notifying
    /// [`ConnectionHandler::after_connect_failure`].
    pub async fn connect(
        &self,
        url: &Url,
        handshake_headers: HeaderMap,
        connect_headers: Option<StompHeaders>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<WebSocketTcpConnectionAdapter>> {
        let headers = self.process_connect_headers(connect_headers);
        let heartbeat = headers.heartbeat().unwrap_or_default();
        if heartbeat.is_enabled() && self.scheduler.is_none() {
            return Err(Error::config(format!(
                "Heartbeat {},{} requires a task scheduler",
                heartbeat.outgoing, heartbeat.incoming
            )));
        }

        let connect = Message::empty(MessageHeaders::with_native(StompCommand::Connect, headers));
        let adapter = WebSocketTcpConnectionAdapter::new(
            Arc::clone(&handler),
            Some(connect),
            self.scheduler.clone(),
            self.inbound_message_size_limit,
        );

        debug!(%url, "Connecting STOMP client");
        match self
            .client
            .execute(
                Arc::clone(&adapter) as Arc<dyn WebSocketHandler>,
                handshake_headers,
                url,
            )
            .await
        {
            Ok(_session) => Ok(adapter),
            Err(e) => {
                handler.after_connect_failure(&e).await;
                Err(e)
            }
        }
    }
}

impl fmt::Debug for WebSocketStompClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketStompClient")
            .field("default_heartbeat", &self.default_heartbeat)
            .field("has_scheduler", &self.scheduler.is_some())
            .field("inbound_message_size_limit", &self.inbound_message_size_limit)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

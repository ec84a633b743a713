//! Transport request chain with timeout-driven fallback.
//!
//! Each [`TransportRequest`] is one attempt with one transport type. Its
//! outcome is decided exactly once by whichever comes first:
//!
//! | Event | Outcome |
//! |-------|---------|
//! | Transport connected | Resolve the overall result, cancel the timeout |
//! | Transport failed | Try the fallback, or fail the overall result |
//! | Timeout fired | Run timeout tasks, then try the fallback or fail |
//!
//! Later events for the same attempt are logged and dropped.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::Principal;
use crate::scheduler::{ScheduledTask, Task, TaskScheduler};
use crate::transport::{WebSocketHandler, WebSocketSession};

use super::transport::Transport;
use super::url::{SockJsUrlInfo, TransportType};

// ============================================================================
// ConnectResult
// ============================================================================

type ConnectOutcome = Result<Arc<dyn WebSocketSession>>;

/// Overall result of a request chain; resolves at most once.
pub struct ConnectResult {
    tx: Mutex<Option<oneshot::Sender<ConnectOutcome>>>,
}

impl ConnectResult {
    /// Creates the cell and the receiver of its value.
    #[must_use]
    pub fn new() -> (Arc<Self>, oneshot::Receiver<ConnectOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Sets the outcome. Returns `false` if it was already set.
    pub fn resolve(&self, outcome: ConnectOutcome) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        // A dropped receiver means nobody waits for the outcome.
        let _ = tx.send(outcome);
        true
    }

    /// Returns `true` once an outcome was set.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.tx.lock().is_none()
    }
}

// ============================================================================
// ConnectAttempt
// ============================================================================

/// Per-attempt guard deciding which outcome wins.
#[derive(Default)]
struct ConnectAttempt {
    handled: AtomicBool,
    timeout_task: Mutex<Option<ScheduledTask>>,
}

impl ConnectAttempt {
    /// Claims the attempt. Returns `false` if another outcome won.
    fn claim(&self) -> bool {
        !self.handled.swap(true, Ordering::SeqCst)
    }

    fn cancel_timeout(&self) {
        if let Some(task) = self.timeout_task.lock().take() {
            task.cancel();
        }
    }
}

// ============================================================================
// TransportRequest
// ============================================================================

/// One connect attempt in a fallback chain.
pub struct TransportRequest {
    url_info: SockJsUrlInfo,
    handshake_headers: HeaderMap,
    http_headers: Option<HeaderMap>,
    transport: Arc<dyn Transport>,
    transport_type: TransportType,
    user: Option<Principal>,
    timeout: Option<(Duration, Arc<dyn TaskScheduler>)>,
    fallback: Option<Arc<TransportRequest>>,
    timeout_tasks: Mutex<Vec<Task>>,
}

impl TransportRequest {
    /// Creates a request without timeout or fallback.
    #[must_use]
    pub fn new(
        url_info: SockJsUrlInfo,
        handshake_headers: HeaderMap,
        transport: Arc<dyn Transport>,
        transport_type: TransportType,
    ) -> Self {
        Self {
            url_info,
            handshake_headers,
            http_headers: None,
            transport,
            transport_type,
            user: None,
            timeout: None,
            fallback: None,
            timeout_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Sets the user to connect as.
    #[must_use]
    pub fn with_user(mut self, user: Option<Principal>) -> Self {
        self.user = user;
        self
    }

    /// Sets the headers for plain HTTP requests. Defaults to the
    /// handshake headers.
    #[must_use]
    pub fn with_http_headers(mut self, headers: HeaderMap) -> Self {
        self.http_headers = Some(headers);
        self
    }

    /// Fails the attempt if it has not completed after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.timeout = Some((timeout, scheduler));
        self
    }

    /// Sets the request tried when this one fails.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<TransportRequest>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[inline]
    #[must_use]
    pub fn url_info(&self) -> &SockJsUrlInfo {
        &self.url_info
    }

    #[inline]
    #[must_use]
    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Returns the URL for this request's transport type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the URL cannot be built.
    pub fn transport_url(&self) -> Result<Url> {
        self.url_info.transport_url(self.transport_type)
    }

    #[inline]
    #[must_use]
    pub fn handshake_headers(&self) -> &HeaderMap {
        &self.handshake_headers
    }

    /// Headers for HTTP requests made by XHR transports.
    #[must_use]
    pub fn http_request_headers(&self) -> &HeaderMap {
        self.http_headers.as_ref().unwrap_or(&self.handshake_headers)
    }

    #[inline]
    #[must_use]
    pub fn user(&self) -> Option<&Principal> {
        self.user.as_ref()
    }

    /// Returns the connect timeout, if any.
    #[must_use]
    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout.as_ref().map(|(timeout, _)| *timeout)
    }

    /// Returns the fallback request.
    #[must_use]
    pub fn fallback(&self) -> Option<&Arc<TransportRequest>> {
        self.fallback.as_ref()
    }

    /// Registers cleanup to run if this attempt times out.
    pub fn add_timeout_task(&self, task: Task) {
        self.timeout_tasks.lock().push(task);
    }

    /// Starts the attempt. The outcome, or that of a fallback, is written
    /// to `result`.
    pub fn connect(self: &Arc<Self>, handler: Arc<dyn WebSocketHandler>, result: Arc<ConnectResult>) {
        debug!(request = %self, "Starting transport request");
        let attempt = Arc::new(ConnectAttempt::default());

        if let Some((timeout, ref scheduler)) = self.timeout {
            let request = Arc::clone(self);
            let timed_out = Arc::clone(&attempt);
            let handler = Arc::clone(&handler);
            let result = Arc::clone(&result);
            let task = scheduler.schedule(
                timeout,
                Box::new(move || {
                    let error = Error::connect_timeout(request.to_string(), timeout.as_millis() as u64);
                    request.handle_failure(&timed_out, error, true, handler, result);
                }),
            );
            *attempt.timeout_task.lock() = Some(task);
        }

        let request = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = request
                .transport
                .connect(&request, Arc::clone(&handler))
                .await;
            match outcome {
                Ok(session) => request.handle_success(&attempt, session, &result),
                Err(e) => request.handle_failure(&attempt, e, false, handler, result),
            }
        });
    }

    fn handle_success(
        &self,
        attempt: &ConnectAttempt,
        session: Arc<dyn WebSocketSession>,
        result: &ConnectResult,
    ) {
        if !attempt.claim() {
            debug!(request = %self, session_id = %session.id(), "Connect success already handled, ignoring");
            return;
        }
        attempt.cancel_timeout();
        debug!(request = %self, session_id = %session.id(), "Transport connected");
        if !result.resolve(Ok(session)) {
            warn!(request = %self, "Connect result already resolved");
        }
    }

    fn handle_failure(
        &self,
        attempt: &ConnectAttempt,
        error: Error,
        is_timeout: bool,
        handler: Arc<dyn WebSocketHandler>,
        result: Arc<ConnectResult>,
    ) {
        if !attempt.claim() {
            debug!(request = %self, error = %error, "Connect failure already handled, ignoring");
            return;
        }
        attempt.cancel_timeout();

        if is_timeout {
            error!(request = %self, "Connect timed out");
            let tasks = std::mem::take(&mut *self.timeout_tasks.lock());
            for task in tasks {
                task();
            }
        }

        match self.fallback {
            Some(ref fallback) => {
                error!(request = %self, error = %error, "Transport failed, falling back on next transport");
                fallback.connect(handler, result);
            }
            None => {
                error!(request = %self, error = %error, "No more fallback transports");
                result.resolve(Err(error));
            }
        }
    }
}

impl fmt::Display for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransportRequest[url={}, type={}]",
            self.url_info.url(),
            self.transport_type
        )
    }
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("url_info", &self.url_info)
            .field("transport_type", &self.transport_type)
            .field("timeout", &self.timeout_value())
            .field("has_fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

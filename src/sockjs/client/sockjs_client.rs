//! SockJS client: info handshake and transport negotiation.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use crate::client::WebSocketClient;
use crate::error::{Error, Result};
use crate::identifiers::Principal;
use crate::scheduler::TaskScheduler;
use crate::transport::{WebSocketHandler, WebSocketSession};

use super::info::{InfoReceiver, RestInfoReceiver, ServerInfoEntry};
use super::request::{ConnectResult, TransportRequest};
use super::transport::Transport;
use super::url::{SockJsUrlInfo, TransportType};

// ============================================================================
// SockJsClientBuilder
// ============================================================================

/// Builder for [`SockJsClient`].
pub struct SockJsClientBuilder {
    transports: Vec<Arc<dyn Transport>>,
    info_receiver: Option<Arc<dyn InfoReceiver>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    http_header_names: Option<Vec<HeaderName>>,
    user: Option<Principal>,
}

impl SockJsClientBuilder {
    /// Replaces the default reqwest-based info receiver.
    #[must_use]
    pub fn with_info_receiver(mut self, receiver: Arc<dyn InfoReceiver>) -> Self {
        self.info_receiver = Some(receiver);
        self
    }

    /// Enables connect timeouts and transport fallback on timeout.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Limits which handshake headers are copied to plain HTTP requests.
    #[must_use]
    pub fn with_http_header_names<I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        self.http_header_names = Some(names.into_iter().collect());
        self
    }

    /// Sets the user reported by connected sessions.
    #[must_use]
    pub fn with_user(mut self, user: Principal) -> Self {
        self.user = Some(user);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no transport was given.
    pub fn build(self) -> Result<SockJsClient> {
        if self.transports.is_empty() {
            return Err(Error::config("At least one transport is required"));
        }
        Ok(SockJsClient {
            transports: self.transports,
            info_receiver: self
                .info_receiver
                .unwrap_or_else(|| Arc::new(RestInfoReceiver::default())),
            scheduler: self.scheduler,
            http_header_names: self.http_header_names,
            user: self.user,
            server_info_cache: Mutex::new(FxHashMap::default()),
        })
    }
}

// ============================================================================
// SockJsClient
// ============================================================================

/// A [`WebSocketClient`] that connects through SockJS, falling back from
/// WebSocket to HTTP transports.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use stomp_websocket::sockjs::{SockJsClient, Transport, WebSocketTransport, XhrTransport};
///
/// # fn example() -> stomp_websocket::Result<()> {
/// let transports: Vec<Arc<dyn Transport>> = vec![
///     Arc::new(WebSocketTransport::new()),
///     Arc::new(XhrTransport::default()),
/// ];
/// let client = SockJsClient::builder(transports).build()?;
/// # Ok(())
/// # }
/// ```
pub struct SockJsClient {
    transports: Vec<Arc<dyn Transport>>,
    info_receiver: Arc<dyn InfoReceiver>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    http_header_names: Option<Vec<HeaderName>>,
    user: Option<Principal>,
    server_info_cache: Mutex<FxHashMap<Url, ServerInfoEntry>>,
}

impl SockJsClient {
    /// Starts building a client over `transports`, tried in order.
    #[must_use]
    pub fn builder(transports: Vec<Arc<dyn Transport>>) -> SockJsClientBuilder {
        SockJsClientBuilder {
            transports,
            info_receiver: None,
            scheduler: None,
            http_header_names: None,
            user: None,
        }
    }

    /// Forgets all cached `/info` responses.
    pub fn clear_server_info_cache(&self) {
        self.server_info_cache.lock().clear();
    }

    /// Handshake headers to copy to plain HTTP requests.
    fn http_request_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let Some(ref names) = self.http_header_names else {
            return headers.clone();
        };
        let mut filtered = HeaderMap::new();
        for name in names {
            for value in headers.get_all(name) {
                filtered.append(name.clone(), value.clone());
            }
        }
        filtered
    }

    /// Returns the cached server info, fetching it on a miss.
    async fn server_info(
        &self,
        url_info: &SockJsUrlInfo,
        headers: &HeaderMap,
    ) -> Result<ServerInfoEntry> {
        let info_url = url_info.info_url()?;
        if let Some(entry) = self.server_info_cache.lock().get(&info_url) {
            trace!(url = %info_url, "Using cached server info");
            return Ok(entry.clone());
        }

        let started = Instant::now();
        let body = self
            .info_receiver
            .execute_info_request(&info_url, headers)
            .await?;
        let entry = ServerInfoEntry::parse(&body, started.elapsed())?;
        debug!(url = %info_url, rtt_ms = entry.response_time.as_millis() as u64, websocket = entry.is_websocket_enabled(), "Fetched server info");

        self.server_info_cache
            .lock()
            .insert(info_url, entry.clone());
        Ok(entry)
    }

    /// Builds the fallback chain and returns its head.
    fn create_request_chain(
        &self,
        url_info: &SockJsUrlInfo,
        handshake_headers: &HeaderMap,
        http_headers: &HeaderMap,
        server_info: &ServerInfoEntry,
    ) -> Result<Arc<TransportRequest>> {
        let candidates: Vec<(Arc<dyn Transport>, TransportType)> = self
            .transports
            .iter()
            .flat_map(|transport| {
                transport
                    .transport_types()
                    .into_iter()
                    .map(move |transport_type| (Arc::clone(transport), transport_type))
            })
            .filter(|(_, transport_type)| {
                *transport_type != TransportType::WebSocket || server_info.is_websocket_enabled()
            })
            .collect();

        let mut next: Option<Arc<TransportRequest>> = None;
        for (transport, transport_type) in candidates.into_iter().rev() {
            let mut request = TransportRequest::new(
                url_info.clone(),
                handshake_headers.clone(),
                transport,
                transport_type,
            )
            .with_http_headers(http_headers.clone())
            .with_user(self.user.clone());

            if let Some(fallback) = next.take() {
                if let Some(ref scheduler) = self.scheduler {
                    request = request.with_timeout(
                        server_info.retransmission_timeout(),
                        Arc::clone(scheduler),
                    );
                }
                request = request.with_fallback(fallback);
            }
            next = Some(Arc::new(request));
        }

        next.ok_or_else(|| {
            Error::config(format!(
                "No transports available for {}",
                url_info.url()
            ))
        })
    }
}

#[async_trait]
impl WebSocketClient for SockJsClient {
    async fn execute(
        &self,
        handler: Arc<dyn WebSocketHandler>,
        headers: HeaderMap,
        url: &Url,
    ) -> Result<Arc<dyn WebSocketSession>> {
        let url_info = SockJsUrlInfo::new(url.clone())?;
        debug!(url_info = %url_info, "Starting SockJS handshake");

        let http_headers = self.http_request_headers(&headers);
        let server_info = self.server_info(&url_info, &http_headers).await?;
        let head = self.create_request_chain(&url_info, &headers, &http_headers, &server_info)?;

        let (result, outcome) = ConnectResult::new();
        head.connect(handler, result);
        outcome.await?
    }
}

impl fmt::Debug for SockJsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockJsClient")
            .field("transports", &self.transports.len())
            .field("has_scheduler", &self.scheduler.is_some())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

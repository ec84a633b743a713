//! WebSocket server accepting STOMP clients.
//!
//! # Connection Flow
//!
//! 1. `WebSocketServer::builder(..).bind(addr)` binds and starts the accept loop
//! 2. Each TCP connection is upgraded; the first client-requested
//!    sub-protocol the server supports is echoed in `Sec-WebSocket-Protocol`
//! 3. Requests to paths ending in `/websocket` are served as SockJS
//!    sessions when a SockJS scheduler is configured
//! 4. The connection is handed to the [`WebSocketHandler`]

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::Principal;
use crate::scheduler::TaskScheduler;
use crate::sockjs::SockJsWebSocketHandler;

use super::connection::{ConnectionInfo, WebSocketConnection};
use super::handler::WebSocketHandler;

// ============================================================================
// Constants
// ============================================================================

/// Interval at which the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Path suffix of the SockJS WebSocket transport.
const SOCKJS_WEBSOCKET_SUFFIX: &str = "/websocket";

// ============================================================================
// Types
// ============================================================================

/// Resolves the principal of an upgrade request.
pub type PrincipalResolver = Arc<dyn Fn(&Request) -> Option<Principal> + Send + Sync>;

/// Values captured from the upgrade request.
#[derive(Debug, Default, Clone)]
struct Handshake {
    path: String,
    protocol: Option<String>,
    principal: Option<Principal>,
}

// ============================================================================
// WebSocketServerBuilder
// ============================================================================

/// Builder for [`WebSocketServer`].
pub struct WebSocketServerBuilder {
    handler: Arc<dyn WebSocketHandler>,
    sub_protocols: Vec<String>,
    principal_resolver: Option<PrincipalResolver>,
    sockjs_scheduler: Option<Arc<dyn TaskScheduler>>,
}

impl WebSocketServerBuilder {
    /// Sets the sub-protocols the server may negotiate.
    #[must_use]
    pub fn with_sub_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the principal resolver.
    #[must_use]
    pub fn with_principal_resolver(mut self, resolver: PrincipalResolver) -> Self {
        self.principal_resolver = Some(resolver);
        self
    }

    /// Serves `*/websocket` paths as SockJS sessions, using `scheduler` for
    /// SockJS heartbeats.
    #[must_use]
    pub fn with_sockjs(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.sockjs_scheduler = Some(scheduler);
        self
    }

    /// Binds the server and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(self, addr: SocketAddr) -> Result<Arc<WebSocketServer>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let sockjs_handler = self.sockjs_scheduler.map(|scheduler| {
            Arc::new(SockJsWebSocketHandler::new(Arc::clone(&self.handler), scheduler))
                as Arc<dyn WebSocketHandler>
        });

        let server = Arc::new(WebSocketServer {
            local_addr,
            handler: self.handler,
            sockjs_handler,
            sub_protocols: Arc::new(self.sub_protocols),
            principal_resolver: self.principal_resolver,
            shutdown: AtomicBool::new(false),
        });

        let server_clone = Arc::clone(&server);
        tokio::spawn(async move {
            server_clone.accept_loop(listener).await;
        });

        info!(%local_addr, "WebSocket server started");
        Ok(server)
    }
}

// ============================================================================
// WebSocketServer
// ============================================================================

/// A running WebSocket server.
pub struct WebSocketServer {
    local_addr: SocketAddr,
    handler: Arc<dyn WebSocketHandler>,
    sockjs_handler: Option<Arc<dyn WebSocketHandler>>,
    sub_protocols: Arc<Vec<String>>,
    principal_resolver: Option<PrincipalResolver>,
    shutdown: AtomicBool,
}

impl WebSocketServer {
    /// Creates a builder serving connections with `handler`.
    #[must_use]
    pub fn builder(handler: Arc<dyn WebSocketHandler>) -> WebSocketServerBuilder {
        WebSocketServerBuilder {
            handler,
            sub_protocols: Vec::new(),
            principal_resolver: None,
            sockjs_scheduler: None,
        }
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for `path`.
    #[must_use]
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.local_addr, path)
    }

    /// Stops accepting new connections.
    ///
    /// Open sessions are not affected; stop the handler to close them.
    pub fn shutdown(&self) {
        info!(local_addr = %self.local_addr, "WebSocket server shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(?addr, "New TCP connection");

        let captured = Arc::new(Mutex::new(Handshake::default()));
        let callback = {
            let captured = Arc::clone(&captured);
            let supported = Arc::clone(&self.sub_protocols);
            let resolver = self.principal_resolver.clone();
            move |request: &Request, mut response: Response| -> StdResult<Response, ErrorResponse> {
                let mut handshake = captured.lock();
                handshake.path = request.uri().path().to_owned();
                handshake.principal = resolver.as_ref().and_then(|resolve| resolve(request));

                if let Some(protocol) = negotiate_sub_protocol(request.headers(), &supported)
                    && let Ok(value) = HeaderValue::from_str(&protocol)
                {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                    handshake.protocol = Some(protocol);
                }
                Ok(response)
            }
        };

        let ws_stream = accept_hdr_async(stream, callback)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        let handshake = captured.lock().clone();
        let handler = match self.sockjs_handler {
            Some(ref sockjs) if handshake.path.ends_with(SOCKJS_WEBSOCKET_SUFFIX) => Arc::clone(sockjs),
            _ => Arc::clone(&self.handler),
        };

        info!(?addr, path = %handshake.path, protocol = ?handshake.protocol, "WebSocket connection established");

        WebSocketConnection::spawn(
            ws_stream,
            ConnectionInfo {
                protocol: handshake.protocol,
                principal: handshake.principal,
                ..ConnectionInfo::default()
            },
            handler,
        );

        Ok(())
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("local_addr", &self.local_addr)
            .field("sub_protocols", &self.sub_protocols)
            .field("sockjs", &self.sockjs_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// Picks the first requested sub-protocol that is supported.
///
/// Comparison is case-insensitive; the server's spelling is returned.
fn negotiate_sub_protocol(headers: &HeaderMap, supported: &[String]) -> Option<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find_map(|requested| {
            supported
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(requested))
                .cloned()
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    use crate::testing::RecordingHandler;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_negotiate_first_supported() {
        let supported = vec!["v11.stomp".to_string(), "v12.stomp".to_string()];

        assert_eq!(
            negotiate_sub_protocol(&headers("v10.stomp, V12.STOMP, v11.stomp"), &supported),
            Some("v12.stomp".to_string())
        );
        assert_eq!(negotiate_sub_protocol(&headers("mqtt"), &supported), None);
        assert_eq!(negotiate_sub_protocol(&HeaderMap::new(), &supported), None);
    }

    #[tokio::test]
    async fn test_server_negotiates_and_dispatches() {
        let handler = Arc::new(RecordingHandler::new());
        let server = WebSocketServer::builder(Arc::clone(&handler) as Arc<dyn WebSocketHandler>)
            .with_sub_protocols(["v12.stomp"])
            .bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        assert!(server.local_addr().port() > 0);

        let mut request = server.ws_url("/stomp").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("v12.stomp"));
        let (mut client, response) = connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "v12.stomp"
        );

        client.send(WsMessage::Text("ping".into())).await.unwrap();
        client.close(None).await.unwrap();
        while client.next().await.is_some() {}

        handler.wait_closed().await;
        assert_eq!(handler.texts(), vec!["ping"]);
        assert_eq!(handler.accepted_protocol().as_deref(), Some("v12.stomp"));

        server.shutdown();
    }
}

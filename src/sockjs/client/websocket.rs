//! SockJS over a native WebSocket.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::{
    CloseStatus, ConnectionInfo, SessionKind, WebSocketConnection, WebSocketHandler,
    WebSocketMessage, WebSocketSession,
};

use super::request::TransportRequest;
use super::session::{ClientSockJsSession, FrameWriter};
use super::transport::Transport;
use super::url::TransportType;

// ============================================================================
// WebSocketTransport
// ============================================================================

/// [`Transport`] for the `websocket` transport type.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Creates the transport.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn transport_types(&self) -> Vec<TransportType> {
        vec![TransportType::WebSocket]
    }

    async fn connect(
        &self,
        request: &TransportRequest,
        handler: Arc<dyn WebSocketHandler>,
    ) -> Result<Arc<dyn WebSocketSession>> {
        let url = request.transport_url()?;
        debug!(%url, "Starting SockJS WebSocket transport");

        let mut ws_request = url.as_str().into_client_request()?;
        ws_request
            .headers_mut()
            .extend(request.handshake_headers().clone());

        let writer = Arc::new(WebSocketFrameWriter::default());
        let (session, open_rx) = ClientSockJsSession::new(
            request,
            SessionKind::SockJsWebSocket,
            handler,
            Arc::clone(&writer) as Arc<dyn FrameWriter>,
        );
        request.add_timeout_task(session.timeout_task());

        let (stream, _response) = connect_async(ws_request).await?;
        let relay = Arc::new(SockJsFrameRelay {
            session: Arc::clone(&session),
            writer,
        });
        WebSocketConnection::spawn(
            stream,
            ConnectionInfo {
                principal: request.user().cloned(),
                ..ConnectionInfo::default()
            },
            relay,
        );

        open_rx.await??;
        Ok(session as Arc<dyn WebSocketSession>)
    }
}

// ============================================================================
// WebSocketFrameWriter
// ============================================================================

/// Writes SockJS frames to the raw connection once it exists.
#[derive(Default)]
struct WebSocketFrameWriter {
    connection: OnceLock<Arc<dyn WebSocketSession>>,
}

#[async_trait]
impl FrameWriter for WebSocketFrameWriter {
    async fn write(&self, content: String) -> Result<()> {
        let connection = self.connection.get().ok_or(Error::ConnectionClosed)?;
        connection.send_message(WebSocketMessage::Text(content)).await
    }

    async fn disconnect(&self, status: CloseStatus) -> Result<()> {
        match self.connection.get() {
            Some(connection) => connection.close(status).await,
            None => Ok(()),
        }
    }
}

// ============================================================================
// SockJsFrameRelay
// ============================================================================

/// Raw connection handler that feeds frames into the SockJS session.
struct SockJsFrameRelay {
    session: Arc<ClientSockJsSession>,
    writer: Arc<WebSocketFrameWriter>,
}

#[async_trait]
impl WebSocketHandler for SockJsFrameRelay {
    async fn after_connection_established(&self, session: Arc<dyn WebSocketSession>) -> Result<()> {
        let _ = self.writer.connection.set(Arc::clone(&session));
        if self.session.is_disconnected() {
            debug!(session_id = %self.session.id(), "Attempt abandoned before WebSocket opened");
            session.close(CloseStatus::GOING_AWAY).await?;
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        _session: Arc<dyn WebSocketSession>,
        message: WebSocketMessage,
    ) -> Result<()> {
        match message.as_text() {
            Some(frame) => self.session.handle_frame(frame).await,
            None => trace!(session_id = %self.session.id(), "Ignoring non-text SockJS frame"),
        }
        Ok(())
    }

    async fn handle_transport_error(
        &self,
        _session: Arc<dyn WebSocketSession>,
        error: &Error,
    ) -> Result<()> {
        self.session.handle_transport_error(error).await;
        Ok(())
    }

    async fn after_connection_closed(
        &self,
        _session: Arc<dyn WebSocketSession>,
        status: CloseStatus,
    ) -> Result<()> {
        self.session.after_transport_closed(status).await;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use reqwest::header::HeaderMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use url::Url;

    use crate::sockjs::client::url::SockJsUrlInfo;
    use crate::testing::RecordingHandler;

    #[tokio::test]
    async fn test_websocket_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text("o".into())).await.unwrap();

            let received = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::Text("a[\"pong\"]".into())).await.unwrap();
            ws.send(WsMessage::Text("c[3000,\"Go away!\"]".into()))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
            received
        });

        let url = Url::parse(&format!("http://{addr}/stomp")).unwrap();
        let request = TransportRequest::new(
            SockJsUrlInfo::new(url).unwrap(),
            HeaderMap::new(),
            Arc::new(WebSocketTransport::new()),
            TransportType::WebSocket,
        );
        let handler = Arc::new(RecordingHandler::new());

        let session = WebSocketTransport::new()
            .connect(&request, Arc::clone(&handler) as Arc<dyn WebSocketHandler>)
            .await
            .unwrap();
        assert!(session.is_open());
        assert_eq!(session.kind(), SessionKind::SockJsWebSocket);
        assert_eq!(session.id().as_str(), request.url_info().session_id());

        session
            .send_message(WebSocketMessage::text("ping"))
            .await
            .unwrap();

        handler.wait_closed().await;
        assert_eq!(handler.texts(), vec!["pong"]);
        assert_eq!(handler.close_status().map(|s| s.code), Some(3000));
        assert_eq!(
            server.await.unwrap(),
            WsMessage::Text("[\"ping\"]".into())
        );
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{addr}/stomp")).unwrap();
        let request = TransportRequest::new(
            SockJsUrlInfo::new(url).unwrap(),
            HeaderMap::new(),
            Arc::new(WebSocketTransport::new()),
            TransportType::WebSocket,
        );

        let result = WebSocketTransport::new()
            .connect(&request, Arc::new(RecordingHandler::new()))
            .await;
        assert!(result.is_err());
    }
}

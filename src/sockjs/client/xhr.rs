//! SockJS over HTTP: `xhr_streaming` and `xhr` polling.
//!
//! Receiving runs in a background task that re-issues the receive request
//! until the session is disconnected. Sending is one `xhr_send` POST per
//! message, answered with `204 No Content`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio::sync::watch;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{CloseStatus, SessionKind, WebSocketHandler, WebSocketSession};

use super::request::TransportRequest;
use super::session::{ClientSockJsSession, FrameWriter};
use super::transport::Transport;
use super::url::TransportType;

// ============================================================================
// Constants
// ============================================================================

/// Length of the `h` prelude that starts an `xhr_streaming` response.
const PRELUDE_LENGTH: usize = 2048;

// ============================================================================
// XhrTransport
// ============================================================================

/// [`Transport`] for the `xhr_streaming` and `xhr` transport types.
#[derive(Debug, Clone)]
pub struct XhrTransport {
    client: reqwest::Client,
    streaming: bool,
}

impl Default for XhrTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl XhrTransport {
    /// Creates a transport that offers streaming, then polling.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            streaming: true,
        }
    }

    /// Enables or disables `xhr_streaming`.
    #[must_use]
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }
}

#[async_trait]
impl Transport for XhrTransport {
    fn transport_types(&self) -> Vec<TransportType> {
        if self.streaming {
            vec![TransportType::XhrStreaming, TransportType::Xhr]
        } else {
            vec![TransportType::Xhr]
        }
    }

    async fn connect(
        &self,
        request: &TransportRequest,
        handler: Arc<dyn WebSocketHandler>,
    ) -> Result<Arc<dyn WebSocketSession>> {
        let (kind, streaming) = match request.transport_type() {
            TransportType::XhrStreaming => (SessionKind::HttpStreaming, true),
            TransportType::Xhr => (SessionKind::HttpPolling, false),
            other => {
                return Err(Error::invalid_argument(format!(
                    "Unsupported transport type for XHR: {other}"
                )));
            }
        };
        let receive_url = request.transport_url()?;
        debug!(url = %receive_url, "Starting SockJS XHR transport");

        let writer = Arc::new(XhrFrameWriter {
            client: self.client.clone(),
            send_url: request.url_info().xhr_send_url()?,
            headers: request.http_request_headers().clone(),
            session: OnceLock::new(),
            shutdown: watch::Sender::new(false),
        });
        let (session, open_rx) = ClientSockJsSession::new(
            request,
            kind,
            handler,
            Arc::clone(&writer) as Arc<dyn FrameWriter>,
        );
        let _ = writer.session.set(Arc::downgrade(&session));
        request.add_timeout_task(session.timeout_task());

        let receiver = Receiver {
            client: self.client.clone(),
            url: receive_url,
            headers: request.http_request_headers().clone(),
            streaming,
            session: Arc::clone(&session),
        };
        tokio::spawn(receiver.run(writer.shutdown.subscribe()));

        open_rx.await??;
        Ok(session as Arc<dyn WebSocketSession>)
    }
}

// ============================================================================
// XhrFrameWriter
// ============================================================================

struct XhrFrameWriter {
    client: reqwest::Client,
    send_url: Url,
    headers: HeaderMap,
    session: OnceLock<Weak<ClientSockJsSession>>,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl FrameWriter for XhrFrameWriter {
    async fn write(&self, content: String) -> Result<()> {
        let response = self
            .client
            .post(self.send_url.clone())
            .headers(self.headers.clone())
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json;charset=UTF-8"),
            )
            .body(content)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            let session_id = self
                .session
                .get()
                .and_then(Weak::upgrade)
                .map(|s| s.id().to_string())
                .unwrap_or_default();
            return Err(Error::transport_failure(
                format!("Unexpected xhr_send status {status}"),
                session_id,
            ));
        }
        Ok(())
    }

    async fn disconnect(&self, status: CloseStatus) -> Result<()> {
        self.shutdown.send_replace(true);
        if let Some(session) = self.session.get().and_then(Weak::upgrade) {
            session.after_transport_closed(status).await;
        }
        Ok(())
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Background receive loop.
struct Receiver {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    streaming: bool,
    session: Arc<ClientSockJsSession>,
}

impl Receiver {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        while !self.session.is_disconnected() {
            let receive = async {
                if self.streaming {
                    self.receive_streaming().await
                } else {
                    self.receive_poll().await
                }
            };
            let result = tokio::select! {
                result = receive => result,
                _ = shutdown.wait_for(|closed| *closed) => break,
            };
            if let Err(e) = result {
                debug!(session_id = %self.session.id(), error = %e, "XHR receive failed");
                self.session.handle_transport_error(&e).await;
                self.session
                    .after_transport_closed(CloseStatus::NO_CLOSE_FRAME)
                    .await;
                return;
            }
        }
        trace!(session_id = %self.session.id(), "XHR receive loop finished");
    }

    async fn post(&self) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::connection(format!(
                "XHR receive request to {} failed with {status}",
                self.url
            )));
        }
        Ok(response)
    }

    /// One streaming response: newline-delimited frames.
    async fn receive_streaming(&self) -> Result<()> {
        let mut body = Box::pin(self.post().await?.bytes_stream());
        let mut buffer = BytesMut::new();

        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(end + 1);
                self.handle_line(&line[..end]).await;
                if self.session.is_disconnected() {
                    return Ok(());
                }
            }
        }
        if !buffer.is_empty() {
            self.handle_line(&buffer).await;
        }
        Ok(())
    }

    /// One polling response: a single frame.
    async fn receive_poll(&self) -> Result<()> {
        let body = self.post().await?.bytes().await?;
        for line in body.split(|b| *b == b'\n') {
            self.handle_line(line).await;
            if self.session.is_disconnected() {
                break;
            }
        }
        Ok(())
    }

    async fn handle_line(&self, line: &[u8]) {
        let content = String::from_utf8_lossy(line);
        if content.is_empty() || is_prelude(&content) {
            return;
        }
        self.session.handle_frame(&content).await;
    }
}

fn is_prelude(content: &str) -> bool {
    content.len() == PRELUDE_LENGTH && content.bytes().all(|b| b == b'h')
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    use crate::sockjs::client::url::SockJsUrlInfo;
    use crate::testing::RecordingHandler;
    use crate::transport::WebSocketMessage;

    /// Reads one HTTP/1.1 request; returns the request line and body.
    async fn read_request(stream: &mut TcpStream) -> (String, String) {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            data.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if data.len() >= head_end + 4 + length {
                    let line = text.lines().next().unwrap().to_string();
                    let body = text[head_end + 4..head_end + 4 + length].to_string();
                    return (line, body);
                }
            }
            if n == 0 {
                panic!("connection closed mid-request");
            }
        }
    }

    async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    /// Minimal SockJS server: answers polls from `frames`, records sends.
    async fn spawn_server(
        frames: Vec<&'static str>,
    ) -> (Url, mpsc::UnboundedReceiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/stomp", listener.local_addr().unwrap())).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let frames = Arc::new(parking_lot::Mutex::new(frames.into_iter()));

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let frames = Arc::clone(&frames);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (line, body) = read_request(&mut stream).await;
                    let _ = tx.send((line.clone(), body));
                    if line.contains("/xhr_send") {
                        respond(&mut stream, "204 No Content", "").await;
                    } else if line.contains("/xhr_streaming") {
                        let body = format!(
                            "{}\no\na[\"streamed\"]\nc[3000,\"bye\"]\n",
                            "h".repeat(2048)
                        );
                        respond(&mut stream, "200 OK", &body).await;
                    } else {
                        let next = frames.lock().next();
                        match next {
                            Some(frame) => respond(&mut stream, "200 OK", &format!("{frame}\n")).await,
                            None => std::future::pending::<()>().await,
                        }
                    }
                });
            }
        });
        (url, rx)
    }

    fn request(url: Url, transport_type: TransportType) -> TransportRequest {
        TransportRequest::new(
            SockJsUrlInfo::new(url).unwrap(),
            HeaderMap::new(),
            Arc::new(XhrTransport::default()),
            transport_type,
        )
    }

    #[test]
    fn test_transport_types() {
        assert_eq!(
            XhrTransport::default().transport_types(),
            vec![TransportType::XhrStreaming, TransportType::Xhr]
        );
        assert_eq!(
            XhrTransport::default().with_streaming(false).transport_types(),
            vec![TransportType::Xhr]
        );
    }

    #[test]
    fn test_prelude_detection() {
        assert!(is_prelude(&"h".repeat(2048)));
        assert!(!is_prelude("h"));
    }

    #[tokio::test]
    async fn test_polling_session() {
        let (url, mut requests) = spawn_server(vec!["o", "a[\"hello\"]"]).await;
        let request = request(url, TransportType::Xhr);
        let handler = Arc::new(RecordingHandler::new());

        let session = XhrTransport::default()
            .connect(&request, Arc::clone(&handler) as Arc<dyn WebSocketHandler>)
            .await
            .unwrap();
        assert_eq!(session.kind(), SessionKind::HttpPolling);

        session
            .send_message(WebSocketMessage::text("hi"))
            .await
            .unwrap();

        let mut sent = None;
        while let Some((line, body)) = requests.recv().await {
            if line.contains("/xhr_send") {
                sent = Some(body);
                break;
            }
        }
        assert_eq!(sent.as_deref(), Some("[\"hi\"]"));

        while handler.texts().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(handler.texts(), vec!["hello"]);

        session.close(CloseStatus::NORMAL).await.unwrap();
        handler.wait_closed().await;
        assert_eq!(handler.close_status(), Some(CloseStatus::NORMAL));
    }

    #[tokio::test]
    async fn test_streaming_session_skips_prelude() {
        let (url, _requests) = spawn_server(Vec::new()).await;
        let request = request(url, TransportType::XhrStreaming);
        let handler = Arc::new(RecordingHandler::new());

        let session = XhrTransport::default()
            .connect(&request, Arc::clone(&handler) as Arc<dyn WebSocketHandler>)
            .await
            .unwrap();
        assert_eq!(session.kind(), SessionKind::HttpStreaming);

        handler.wait_closed().await;
        assert_eq!(handler.texts(), vec!["streamed"]);
        assert_eq!(handler.close_status().map(|s| s.code), Some(3000));
    }

    #[tokio::test]
    async fn test_rejects_websocket_type() {
        let request = request(
            Url::parse("http://127.0.0.1:1/stomp").unwrap(),
            TransportType::WebSocket,
        );
        let result = XhrTransport::default()
            .connect(&request, Arc::new(RecordingHandler::new()))
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }
}

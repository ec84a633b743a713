//! Send-serializing session decorator with back-pressure limits.
//!
//! At most one write is in flight per session. Concurrent senders enqueue
//! their message and whoever holds the flush lock drains the queue in
//! order. Senders that fail to obtain the lock check two limits against
//! the pending write:
//!
//! | Limit | Default | On violation |
//! |-------|---------|--------------|
//! | Send time | 10s | [`Error::SessionLimitExceeded`] |
//! | Buffer size | 512 KiB | Per [`OverflowStrategy`] |
//!
//! Limits are only evaluated when another send is attempted. A single stuck
//! write never trips the time limit by itself. The decorator does not close
//! the session on a violation; that is left to the caller.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{Principal, SessionAttributes, SessionId};

use super::message::{CloseStatus, WebSocketMessage};
use super::session::{SessionKind, WebSocketSession};

// ============================================================================
// OverflowStrategy
// ============================================================================

/// What to do when the buffer size limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Fail the send with [`Error::SessionLimitExceeded`].
    #[default]
    Terminate,
    /// Drop the oldest buffered messages until the buffer fits again.
    Drop,
}

// ============================================================================
// ConcurrentSendSession
// ============================================================================

/// Wraps a session to serialize sends and bound buffering.
pub struct ConcurrentSendSession {
    delegate: Arc<dyn WebSocketSession>,
    send_time_limit: Duration,
    buffer_size_limit: usize,
    overflow_strategy: OverflowStrategy,

    buffer: Mutex<VecDeque<WebSocketMessage>>,
    buffer_size: AtomicUsize,
    send_started_at: Mutex<Option<Instant>>,

    limit_exceeded: AtomicBool,
    close_in_progress: AtomicBool,

    flush_lock: tokio::sync::Mutex<()>,
    close_lock: Mutex<()>,
}

impl ConcurrentSendSession {
    /// Creates a decorator with the [`OverflowStrategy::Terminate`] strategy.
    #[must_use]
    pub fn new(
        delegate: Arc<dyn WebSocketSession>,
        send_time_limit: Duration,
        buffer_size_limit: usize,
    ) -> Self {
        Self::with_overflow_strategy(
            delegate,
            send_time_limit,
            buffer_size_limit,
            OverflowStrategy::Terminate,
        )
    }

    /// Creates a decorator with an explicit overflow strategy.
    #[must_use]
    pub fn with_overflow_strategy(
        delegate: Arc<dyn WebSocketSession>,
        send_time_limit: Duration,
        buffer_size_limit: usize,
        overflow_strategy: OverflowStrategy,
    ) -> Self {
        Self {
            delegate,
            send_time_limit,
            buffer_size_limit,
            overflow_strategy,
            buffer: Mutex::new(VecDeque::new()),
            buffer_size: AtomicUsize::new(0),
            send_started_at: Mutex::new(None),
            limit_exceeded: AtomicBool::new(false),
            close_in_progress: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
            close_lock: Mutex::new(()),
        }
    }

    /// Returns the wrapped session.
    #[inline]
    #[must_use]
    pub fn delegate(&self) -> &Arc<dyn WebSocketSession> {
        &self.delegate
    }

    /// Returns the send time limit.
    #[inline]
    #[must_use]
    pub fn send_time_limit(&self) -> Duration {
        self.send_time_limit
    }

    /// Returns the buffer size limit in bytes.
    #[inline]
    #[must_use]
    pub fn buffer_size_limit(&self) -> usize {
        self.buffer_size_limit
    }

    /// Returns the overflow strategy.
    #[inline]
    #[must_use]
    pub fn overflow_strategy(&self) -> OverflowStrategy {
        self.overflow_strategy
    }

    /// Returns the number of bytes waiting to be sent.
    #[inline]
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::SeqCst)
    }

    /// Returns how long the in-flight write has been running.
    #[must_use]
    pub fn time_since_send_started(&self) -> Duration {
        self.send_started_at
            .lock()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// Returns `true` once a limit was exceeded.
    #[inline]
    #[must_use]
    pub fn is_limit_exceeded(&self) -> bool {
        self.limit_exceeded.load(Ordering::SeqCst)
    }

    fn should_not_send(&self) -> bool {
        self.is_limit_exceeded() || self.close_in_progress.load(Ordering::SeqCst)
    }

    /// Drains the buffer if the flush lock is free.
    ///
    /// Returns `Ok(false)` when another task is already flushing.
    async fn try_flush_buffer(&self) -> Result<bool> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return Ok(false);
        };

        loop {
            if self.should_not_send() {
                break;
            }
            let Some(message) = self.buffer.lock().pop_front() else {
                break;
            };
            self.buffer_size.fetch_sub(message.len(), Ordering::SeqCst);

            *self.send_started_at.lock() = Some(Instant::now());
            let result = self.delegate.send_message(message).await;
            *self.send_started_at.lock() = None;

            result?;
        }

        Ok(true)
    }

    fn check_session_limits(&self) -> Result<()> {
        if self.should_not_send() {
            return Ok(());
        }
        let Some(_guard) = self.close_lock.try_lock() else {
            return Ok(());
        };

        let elapsed = self.time_since_send_started();
        if elapsed > self.send_time_limit {
            return Err(self.limit_exceeded(format!(
                "Send time {}ms (limit {}ms) for session {} exceeded the allowed limit",
                elapsed.as_millis(),
                self.send_time_limit.as_millis(),
                self.id()
            )));
        }

        let size = self.buffer_size();
        if size > self.buffer_size_limit {
            match self.overflow_strategy {
                OverflowStrategy::Terminate => {
                    return Err(self.limit_exceeded(format!(
                        "Buffer size {size} bytes for session {} exceeds the allowed limit {}",
                        self.id(),
                        self.buffer_size_limit
                    )));
                }
                OverflowStrategy::Drop => self.drop_oldest(),
            }
        }

        Ok(())
    }

    fn drop_oldest(&self) {
        let mut buffer = self.buffer.lock();
        let mut dropped = 0usize;
        while self.buffer_size() > self.buffer_size_limit {
            let Some(message) = buffer.pop_front() else {
                break;
            };
            self.buffer_size.fetch_sub(message.len(), Ordering::SeqCst);
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                session_id = %self.id(),
                dropped,
                buffer_size = self.buffer_size(),
                "Dropped messages to stay within buffer size limit"
            );
        }
    }

    fn limit_exceeded(&self, reason: String) -> Error {
        self.limit_exceeded.store(true, Ordering::SeqCst);
        Error::session_limit_exceeded(reason, CloseStatus::SESSION_NOT_RELIABLE)
    }
}

#[async_trait]
impl WebSocketSession for ConcurrentSendSession {
    fn id(&self) -> &SessionId {
        self.delegate.id()
    }

    fn kind(&self) -> SessionKind {
        self.delegate.kind()
    }

    fn accepted_protocol(&self) -> Option<&str> {
        self.delegate.accepted_protocol()
    }

    fn principal(&self) -> Option<Principal> {
        self.delegate.principal()
    }

    fn attributes(&self) -> &SessionAttributes {
        self.delegate.attributes()
    }

    fn is_open(&self) -> bool {
        self.delegate.is_open()
    }

    fn text_message_size_limit(&self) -> usize {
        self.delegate.text_message_size_limit()
    }

    fn set_text_message_size_limit(&self, limit: usize) {
        self.delegate.set_text_message_size_limit(limit);
    }

    fn binary_message_size_limit(&self) -> usize {
        self.delegate.binary_message_size_limit()
    }

    fn set_binary_message_size_limit(&self, limit: usize) {
        self.delegate.set_binary_message_size_limit(limit);
    }

    fn disable_heartbeat(&self) {
        self.delegate.disable_heartbeat();
    }

    async fn send_message(&self, message: WebSocketMessage) -> Result<()> {
        if self.should_not_send() {
            trace!(session_id = %self.id(), "Dropping message, session closing or over limit");
            return Ok(());
        }

        self.buffer_size.fetch_add(message.len(), Ordering::SeqCst);
        self.buffer.lock().push_back(message);

        loop {
            if !self.try_flush_buffer().await? {
                trace!(
                    session_id = %self.id(),
                    buffer_size = self.buffer_size(),
                    "Another send in progress, message buffered"
                );
                self.check_session_limits()?;
                break;
            }
            if self.buffer.lock().is_empty() || self.should_not_send() {
                break;
            }
        }

        Ok(())
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        let status = {
            let _guard = self.close_lock.lock();
            if self.close_in_progress.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if !status.equals_code(&CloseStatus::SESSION_NOT_RELIABLE) && self.is_limit_exceeded()
            {
                debug!(session_id = %self.id(), %status, "Changing close status to SESSION_NOT_RELIABLE");
                CloseStatus::SESSION_NOT_RELIABLE
            } else {
                status
            }
        };
        self.delegate.close(status).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::sleep;

    use crate::testing::RecordingSession;

    fn text(n: usize, c: char) -> WebSocketMessage {
        WebSocketMessage::text(c.to_string().repeat(n))
    }

    fn decorate(delegate: &Arc<RecordingSession>, limit: usize) -> Arc<ConcurrentSendSession> {
        let delegate: Arc<dyn WebSocketSession> = Arc::clone(delegate) as Arc<dyn WebSocketSession>;
        Arc::new(ConcurrentSendSession::new(delegate, Duration::from_secs(10), limit))
    }

    #[tokio::test]
    async fn test_send_without_contention() {
        let raw = Arc::new(RecordingSession::new("s1"));
        let session = decorate(&raw, 1024);

        session.send_message(text(3, 'a')).await.unwrap();
        session.send_message(text(3, 'b')).await.unwrap();

        assert_eq!(raw.sent_texts(), vec!["aaa", "bbb"]);
        assert_eq!(session.buffer_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_sends_delivered_in_order() {
        let raw = Arc::new(RecordingSession::new("s1").with_send_delay(Duration::from_secs(1)));
        let session = decorate(&raw, 1024);

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message(text(10, 'a')).await })
        };
        tokio::task::yield_now().await;

        session.send_message(text(10, 'b')).await.unwrap();
        session.send_message(text(10, 'c')).await.unwrap();
        assert_eq!(session.buffer_size(), 20);

        first.await.unwrap().unwrap();

        assert_eq!(
            raw.sent_texts(),
            vec!["a".repeat(10), "b".repeat(10), "c".repeat(10)]
        );
        assert_eq!(session.buffer_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_limit_exceeded_on_triggering_send() {
        let raw = Arc::new(RecordingSession::new("s1").with_send_delay(Duration::from_secs(1)));
        let session = decorate(&raw, 100);

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message(text(40, 'a')).await })
        };
        tokio::task::yield_now().await;

        session.send_message(text(40, 'b')).await.unwrap();
        session.send_message(text(40, 'c')).await.unwrap();
        let err = session.send_message(text(40, 'd')).await.unwrap_err();

        assert_eq!(
            err.limit_exceeded_status(),
            Some(CloseStatus::SESSION_NOT_RELIABLE)
        );
        assert!(session.is_limit_exceeded());

        // Later sends are dropped silently.
        session.send_message(text(1, 'e')).await.unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(raw.sent_texts(), vec!["a".repeat(40)]);
        assert!(!raw.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_time_limit_checked_on_next_send() {
        let raw = Arc::new(RecordingSession::new("s1").with_send_delay(Duration::from_secs(30)));
        let session = decorate(&raw, 1024);

        let _first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message(text(1, 'a')).await })
        };
        tokio::task::yield_now().await;

        sleep(Duration::from_secs(5)).await;
        session.send_message(text(1, 'b')).await.unwrap();

        sleep(Duration::from_secs(6)).await;
        let err = session.send_message(text(1, 'c')).await.unwrap_err();
        assert!(err.is_session_limit_exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_strategy_discards_oldest() {
        let raw = Arc::new(RecordingSession::new("s1").with_send_delay(Duration::from_secs(1)));
        let delegate: Arc<dyn WebSocketSession> = Arc::clone(&raw) as Arc<dyn WebSocketSession>;
        let session = Arc::new(ConcurrentSendSession::with_overflow_strategy(
            delegate,
            Duration::from_secs(10),
            50,
            OverflowStrategy::Drop,
        ));

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message(text(10, 'a')).await })
        };
        tokio::task::yield_now().await;

        session.send_message(text(30, 'b')).await.unwrap();
        session.send_message(text(30, 'c')).await.unwrap();
        assert_eq!(session.buffer_size(), 30);

        first.await.unwrap().unwrap();
        assert_eq!(raw.sent_texts(), vec!["a".repeat(10), "c".repeat(30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_limit_uses_not_reliable_status() {
        let raw = Arc::new(RecordingSession::new("s1").with_send_delay(Duration::from_secs(1)));
        let session = decorate(&raw, 10);

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_message(text(5, 'a')).await })
        };
        tokio::task::yield_now().await;
        assert!(session.send_message(text(20, 'b')).await.is_err());

        session.close(CloseStatus::NORMAL).await.unwrap();
        session.close(CloseStatus::NORMAL).await.unwrap();

        // The in-flight write lands on a closed delegate.
        let in_flight = first.await.unwrap();
        assert!(matches!(in_flight, Err(Error::SessionNotOpen { .. })));
        assert_eq!(raw.close_statuses(), vec![CloseStatus::SESSION_NOT_RELIABLE]);
    }
}

//! Task scheduling for heartbeats, inactivity checks and connect timeouts.
//!
//! Components never spin their own timers; they receive a
//! [`TaskScheduler`] and keep the returned [`ScheduledTask`] handles so the
//! work can be cancelled when a session or connect attempt ends.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{MissedTickBehavior, interval_at, sleep};
use tracing::trace;

// ============================================================================
// Types
// ============================================================================

/// One-shot task.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Repeating task.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

// ============================================================================
// TaskScheduler
// ============================================================================

/// Scheduler supplied by the host application.
pub trait TaskScheduler: Send + Sync {
    /// Runs `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask;

    /// Runs `task` every `period`, first after one period.
    fn schedule_at_fixed_rate(&self, period: Duration, task: RepeatingTask) -> ScheduledTask;
}

// ============================================================================
// ScheduledTask
// ============================================================================

/// Handle to a scheduled task.
///
/// Clones share cancellation state.
#[derive(Clone, Default)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl ScheduledTask {
    /// Creates a handle that only tracks a cancellation flag.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle that also aborts a tokio task on cancel.
    #[inline]
    #[must_use]
    pub fn with_abort_handle(abort: AbortHandle) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            abort: Some(abort),
        }
    }

    /// Cancels the task. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(ref abort) = self.abort {
            abort.abort();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// TokioTaskScheduler
// ============================================================================

/// [`TaskScheduler`] backed by the ambient tokio runtime.
///
/// Must be used from within a runtime context.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTaskScheduler;

impl TokioTaskScheduler {
    /// Creates a new scheduler.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl TaskScheduler for TokioTaskScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            task();
        });
        ScheduledTask::with_abort_handle(handle.abort_handle())
    }

    fn schedule_at_fixed_rate(&self, period: Duration, mut task: RepeatingTask) -> ScheduledTask {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!(?period, "Running fixed-rate task");
                task();
            }
        });
        ScheduledTask::with_abort_handle(handle.abort_handle())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_once_after_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let _task = TokioTaskScheduler::new().schedule(
            Duration::from_millis(100),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_stops_after_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let task = TokioTaskScheduler::new().schedule_at_fixed_rate(
            Duration::from_millis(10),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sleep(Duration::from_millis(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        task.cancel();
        assert!(task.is_cancelled());

        sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let task = ScheduledTask::new();
        let clone = task.clone();

        clone.cancel();

        assert!(task.is_cancelled());
    }
}

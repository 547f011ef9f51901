//! Timer service abstraction.
//!
//! Components never read the wall clock directly: they ask a
//! [`TimerService`] for the current timestamp and for wake-ups. The
//! [`SystemTimer`] follows UTC seconds; the [`ManualTimer`] only moves when
//! told to, which is what tests and simulations drive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quote_oracle_types::{RelativeTime, Timestamp};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ScheduleError, TimerError};
use crate::ticker::TickSource;

#[async_trait]
pub trait TimerService: Send + Sync + 'static {
    /// Label recorded in quotes timestamped by this timer.
    fn label(&self) -> &str;

    fn current_timestamp(&self) -> Timestamp;

    /// Resolve once the current timestamp is at or past `deadline`. Returns
    /// the timestamp observed on wake-up.
    async fn wake_at(&self, deadline: Timestamp) -> Result<Timestamp, TimerError>;

    /// Resolve after `delay` has elapsed.
    async fn delay(&self, delay: RelativeTime) -> Result<Timestamp, TimerError> {
        let deadline = self.current_timestamp().saturating_add(delay);
        self.wake_at(deadline).await
    }
}

/// Schedule `waker` to run once at `deadline`.
///
/// Must be called from within a tokio runtime. Aborting the returned handle
/// cancels the wake-up.
pub fn set_wakeup<F>(timer: Arc<dyn TimerService>, deadline: Timestamp, waker: F) -> JoinHandle<()>
where
    F: FnOnce(Result<Timestamp, TimerError>) + Send + 'static,
{
    tokio::spawn(async move {
        let woke = timer.wake_at(deadline).await;
        waker(woke);
    })
}

/// A periodic tick source whose first tick is `delay` from now.
pub fn make_repeater(
    timer: Arc<dyn TimerService>,
    delay: RelativeTime,
    interval: RelativeTime,
) -> Result<TickSource, ScheduleError> {
    let start = timer.current_timestamp().saturating_add(delay);
    TickSource::periodic(timer, start, interval)
}

/// Wall-clock timer in UTC seconds.
#[derive(Debug, Clone)]
pub struct SystemTimer {
    label: String,
}

impl SystemTimer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self::new("system")
    }
}

#[async_trait]
impl TimerService for SystemTimer {
    fn label(&self) -> &str {
        &self.label
    }

    fn current_timestamp(&self) -> Timestamp {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }

    async fn wake_at(&self, deadline: Timestamp) -> Result<Timestamp, TimerError> {
        loop {
            let now = self.current_timestamp();
            if now >= deadline {
                return Ok(now);
            }
            tokio::time::sleep(Duration::from_secs(deadline - now)).await;
        }
    }
}

/// A timer that advances only on [`ManualTimer::tick`].
#[derive(Debug)]
pub struct ManualTimer {
    label: String,
    step: RelativeTime,
    now: watch::Sender<Timestamp>,
}

impl ManualTimer {
    pub fn new(label: impl Into<String>, start: Timestamp, step: RelativeTime) -> Self {
        let (now, _) = watch::channel(start);
        Self {
            label: label.into(),
            step,
            now,
        }
    }

    /// Advance by one step and wake everything now due.
    pub fn tick(&self) -> Timestamp {
        let step = self.step;
        self.now.send_modify(|now| *now = now.saturating_add(step));
        let now = *self.now.borrow();
        debug!("Manual timer {} ticked to {}", self.label, now);
        now
    }

    /// Advance to `timestamp` if it lies in the future.
    pub fn advance_to(&self, timestamp: Timestamp) -> Timestamp {
        self.now.send_if_modified(|now| {
            if timestamp > *now {
                *now = timestamp;
                true
            } else {
                false
            }
        });
        *self.now.borrow()
    }
}

#[async_trait]
impl TimerService for ManualTimer {
    fn label(&self) -> &str {
        &self.label
    }

    fn current_timestamp(&self) -> Timestamp {
        *self.now.borrow()
    }

    async fn wake_at(&self, deadline: Timestamp) -> Result<Timestamp, TimerError> {
        let mut rx = self.now.subscribe();
        let now = rx
            .wait_for(|now| *now >= deadline)
            .await
            .map_err(|_| TimerError::Shutdown)?;
        Ok(*now)
    }
}

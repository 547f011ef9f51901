//! Scheduled tick sequences.
//!
//! A [`TickSource`] pairs a [`Schedule`] with a timer. Each call to
//! [`TickSource::ticks`] starts an independent cursor; a cursor is consumed
//! as it goes and never rewinds. Every due tick is delivered: a consumer that
//! falls behind gets the missed instants back to back.

use std::sync::Arc;

use futures_util::stream::{self, Stream};
use quote_oracle_types::{RelativeTime, Timestamp};

use crate::cron::CronSchedule;
use crate::error::{ScheduleError, TimerError};
use crate::timer::TimerService;

/// When ticks occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// `start`, `start + interval`, `start + 2 * interval`, ...
    Periodic {
        start: Timestamp,
        interval: RelativeTime,
    },
    Cron(CronSchedule),
}

impl Schedule {
    /// First scheduled instant at or after `position`.
    pub fn next_at_or_after(&self, position: Timestamp) -> Option<Timestamp> {
        match self {
            Schedule::Periodic { start, interval } => {
                if position <= *start {
                    return Some(*start);
                }
                let elapsed = position - start;
                let periods = elapsed.div_ceil(*interval);
                periods
                    .checked_mul(*interval)
                    .and_then(|offset| start.checked_add(offset))
            }
            Schedule::Cron(cron) => cron.next_at_or_after(position),
        }
    }
}

/// A schedule bound to a timer.
#[derive(Clone)]
pub struct TickSource {
    schedule: Schedule,
    timer: Arc<dyn TimerService>,
}

impl TickSource {
    pub fn new(timer: Arc<dyn TimerService>, schedule: Schedule) -> Result<Self, ScheduleError> {
        if let Schedule::Periodic { interval: 0, .. } = schedule {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Self { schedule, timer })
    }

    pub fn periodic(
        timer: Arc<dyn TimerService>,
        start: Timestamp,
        interval: RelativeTime,
    ) -> Result<Self, ScheduleError> {
        Self::new(timer, Schedule::Periodic { start, interval })
    }

    pub fn cron(timer: Arc<dyn TimerService>, expr: &str) -> Result<Self, ScheduleError> {
        Self::new(timer, Schedule::Cron(expr.parse()?))
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Ticks from the timer's current timestamp onward.
    pub fn ticks(&self) -> Ticks {
        self.ticks_from(self.timer.current_timestamp())
    }

    /// Ticks scheduled at or after `position`.
    pub fn ticks_from(&self, position: Timestamp) -> Ticks {
        Ticks {
            schedule: self.schedule.clone(),
            timer: Arc::clone(&self.timer),
            next: self.schedule.next_at_or_after(position),
        }
    }
}

/// One pass over a tick schedule.
pub struct Ticks {
    schedule: Schedule,
    timer: Arc<dyn TimerService>,
    next: Option<Timestamp>,
}

impl Ticks {
    /// Wait for the next scheduled instant and return it. Returns
    /// immediately when that instant has already passed. `None` once the
    /// schedule is exhausted.
    pub async fn next_tick(&mut self) -> Option<Result<Timestamp, TimerError>> {
        let due = self.next?;
        // Computed from `due`, not the wake-up time, so a late wake-up still
        // yields every tick. Committed only after waking: dropping this future
        // loses nothing.
        let after = due
            .checked_add(1)
            .and_then(|after| self.schedule.next_at_or_after(after));
        match self.timer.wake_at(due).await {
            Ok(_) => {
                self.next = after;
                Some(Ok(due))
            }
            Err(err) => {
                self.next = None;
                Some(Err(err))
            }
        }
    }

    /// The instant the next call to [`Ticks::next_tick`] will deliver.
    pub fn peek(&self) -> Option<Timestamp> {
        self.next
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Timestamp, TimerError>> + Send {
        stream::unfold(self, |mut ticks| async move {
            let tick = ticks.next_tick().await?;
            Some((tick, ticks))
        })
    }
}

//! Core in-process primitives for the quote oracle.
//!
//! - [`Notifier`]: single-slot versioned publish/subscribe
//! - [`ReplaceableNotifiers`]: stable subscriptions over swappable sources
//! - [`TimerService`]: clock and wake-ups, with system and manual timers
//! - [`TickSource`]: periodic and cron tick schedules with catch-up delivery

pub mod cron;
pub mod error;
pub mod notifier;
pub mod replaceable;
pub mod ticker;
pub mod timer;

pub use cron::CronSchedule;
pub use error::{NotifierError, NotifierResult, ScheduleError, TimerError};
pub use notifier::{make_notifier_kit, Notifier, Publisher, UpdateCount, UpdateRecord};
pub use replaceable::{Generation, ReplaceableNotifiers};
pub use ticker::{Schedule, TickSource, Ticks};
pub use timer::{make_repeater, set_wakeup, ManualTimer, SystemTimer, TimerService};

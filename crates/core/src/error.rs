//! Core primitive error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifierError {
    #[error("notifier failed: {0}")]
    Failed(String),

    #[error("cannot update state after termination")]
    Terminated,

    #[error("notifier has no value to finish with")]
    NoValue,

    #[error("notifier publisher dropped")]
    Abandoned,
}

pub type NotifierResult<T> = Result<T, NotifierError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("timer service shut down")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("tick interval must be positive")]
    ZeroInterval,

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

//! Control-surface error types

use thiserror::Error;

/// Validation and lookup errors surfaced synchronously to callers
///
/// Loop-internal and dispatch failures never reach the caller; they degrade
/// to a recorded execution state plus a log entry.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("gap fill requires at least one symbol")]
    NoSymbols,

    #[error("schedule store error: {0}")]
    Store(eyre::Report),
}

//! Domain types for backfill scheduling

pub mod execution;
pub mod granularity;
pub mod priority;
pub mod schedule;

pub use execution::{
    BackfillExecution, ExecutionStats, ExecutionStatus, ExecutionTrigger, SymbolExecutionResult, SymbolOutcome,
};
pub use granularity::BarInterval;
pub use priority::ExecutionPriority;
pub use schedule::{BackfillKind, BackfillSchedule, Periodicity};

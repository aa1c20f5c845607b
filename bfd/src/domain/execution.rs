//! Backfill execution domain type
//!
//! Tracks one concrete run derived from a schedule (or an ad-hoc request).
//! Terminal states are one-shot: once an execution is completed, failed,
//! skipped, or cancelled it is never mutated again.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::BackfillSchedule;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Enqueued, waiting for the execution loop
    #[default]
    Pending,
    /// Dispatch in progress
    Running,
    /// Job completed with no failed symbols
    Completed,
    /// Job completed but some symbols failed
    PartialSuccess,
    /// Dispatch or job failure
    Failed,
    /// Deliberate no-op (empty symbol list)
    Skipped,
    /// Job cancelled, including the timeout path
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartialSuccess | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::PartialSuccess => write!(f, "partial_success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What caused an execution to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTrigger {
    /// Dispatched by the scheduler loop
    Scheduled,
    /// Requested for a specific schedule by an operator
    Manual,
    /// Ad-hoc gap fill through the API surface
    Api,
    /// Synthesized at startup for occurrences missed during downtime
    CatchUp,
}

impl std::fmt::Display for ExecutionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
            Self::Api => write!(f, "api"),
            Self::CatchUp => write!(f, "catch_up"),
        }
    }
}

/// Terminal outcome for a single symbol within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolOutcome {
    Completed,
    Failed,
    /// Never attempted (job cancelled before the symbol was reached)
    Skipped,
}

/// Per-symbol result aggregated from job progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolExecutionResult {
    pub symbol: String,
    pub outcome: SymbolOutcome,
    pub bars_retrieved: u64,
    /// Provider that ultimately served the symbol
    pub provider: Option<String>,
    pub last_error: Option<String>,
}

/// Aggregate statistics for an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_symbols: usize,
    pub successful_symbols: usize,
    pub failed_symbols: usize,
    pub bars_retrieved: u64,
    pub requests_made: u64,
    pub gaps_found: usize,
}

/// One concrete run of a schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillExecution {
    /// Unique execution id
    pub id: Uuid,

    /// Owning schedule
    pub schedule_id: String,
    pub schedule_name: String,

    /// What created this execution
    pub trigger: ExecutionTrigger,

    /// When the execution was created/enqueued
    pub scheduled_at: DateTime<Utc>,

    /// Set when dispatch begins
    pub started_at: Option<DateTime<Utc>>,

    /// Set exactly once, when a terminal state is reached
    pub completed_at: Option<DateTime<Utc>>,

    /// Date range to backfill, inclusive
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,

    /// Symbols to backfill; resolved against configured defaults at dispatch
    pub symbols: Vec<String>,

    pub status: ExecutionStatus,

    /// Per-symbol outcomes, filled in after the job completes
    #[serde(default)]
    pub symbol_results: HashMap<String, SymbolExecutionResult>,

    #[serde(default)]
    pub stats: ExecutionStats,

    /// Job dispatched for this execution, if any
    pub job_id: Option<Uuid>,

    /// Failure message and trace, when status is Failed
    pub error: Option<String>,
    pub error_trace: Option<String>,

    /// Explanatory text for skip and fast-path outcomes
    pub message: Option<String>,
}

impl BackfillExecution {
    /// Create a pending execution from a schedule snapshot
    pub fn new(
        schedule: &BackfillSchedule,
        trigger: ExecutionTrigger,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            schedule_id: schedule.id.clone(),
            schedule_name: schedule.name.clone(),
            trigger,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            period_start,
            period_end,
            symbols: schedule.symbols.clone(),
            status: ExecutionStatus::Pending,
            symbol_results: HashMap::new(),
            stats: ExecutionStats::default(),
            job_id: None,
            error: None,
            error_trace: None,
            message: None,
        }
    }

    /// Whether the execution has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition Pending -> Running, recording the start time
    ///
    /// Returns false if the execution is not pending.
    pub fn mark_running(&mut self) -> bool {
        if self.status != ExecutionStatus::Pending {
            return false;
        }
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    fn finish(&mut self, status: ExecutionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Terminal transition to Completed
    pub fn mark_completed(&mut self) -> bool {
        self.finish(ExecutionStatus::Completed)
    }

    /// Terminal transition to PartialSuccess
    pub fn mark_partial_success(&mut self) -> bool {
        self.finish(ExecutionStatus::PartialSuccess)
    }

    /// Terminal transition to Failed with message and trace
    pub fn mark_failed(&mut self, error: impl Into<String>, trace: Option<String>) -> bool {
        if !self.finish(ExecutionStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        self.error_trace = trace;
        true
    }

    /// Terminal transition to Skipped with an explanatory message
    pub fn mark_skipped(&mut self, reason: impl Into<String>) -> bool {
        if !self.finish(ExecutionStatus::Skipped) {
            return false;
        }
        self.message = Some(reason.into());
        true
    }

    /// Terminal transition to Cancelled (timeout and shutdown paths included)
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> bool {
        if !self.finish(ExecutionStatus::Cancelled) {
            return false;
        }
        self.message = Some(reason.into());
        true
    }

    /// Wall-clock duration so far, or total once terminal
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) => Some(Utc::now() - start),
            _ => None,
        }
    }
}

//! Job execution boundary
//!
//! The job manager owns the mechanics of talking to data providers. The
//! scheduler only creates jobs, starts them, polls for completion, and
//! reads back statistics and per-symbol progress.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::BarInterval;

/// Job status as reported by the job manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-symbol progress within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SymbolJobStatus {
    #[default]
    Pending,
    Fetching,
    Completed,
    Failed,
    Skipped,
}

/// Progress for one symbol, exposed by the job manager while a job runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolProgress {
    pub symbol: String,
    pub status: SymbolJobStatus,
    pub bars_retrieved: u64,
    /// Provider that served (or last attempted) the symbol
    pub provider: Option<String>,
    pub last_error: Option<String>,
}

/// Aggregate counters for a job
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    pub bars_retrieved: u64,
    pub requests_made: u64,
}

/// Options carried from the schedule template into the job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Skip date/symbol combinations already present in storage
    #[serde(rename = "skip-existing", default = "default_skip_existing")]
    pub skip_existing: bool,
}

fn default_skip_existing() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        Self { skip_existing: true }
    }
}

/// Specification for a new backfill job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub symbols: Vec<String>,
    /// Inclusive date range to fetch
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub granularity: BarInterval,
    pub options: JobOptions,
    /// Providers to try first, in order
    pub preferred_providers: Vec<String>,
}

/// A job as reported by the job manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub statistics: JobStatistics,
    /// Keyed by symbol
    #[serde(default)]
    pub progress: HashMap<String, SymbolProgress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl BackfillJob {
    /// Create a pending job from a spec; useful for job-manager implementations
    pub fn from_spec(spec: &JobSpec) -> Self {
        let progress = spec
            .symbols
            .iter()
            .map(|symbol| {
                (
                    symbol.clone(),
                    SymbolProgress {
                        symbol: symbol.clone(),
                        status: SymbolJobStatus::Pending,
                        bars_retrieved: 0,
                        provider: None,
                        last_error: None,
                    },
                )
            })
            .collect();

        Self {
            id: Uuid::now_v7(),
            name: spec.name.clone(),
            status: JobStatus::Pending,
            statistics: JobStatistics::default(),
            progress,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Whether the job has reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Creates and drives backfill jobs against data providers
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Create a job from the spec; the job starts in Pending
    async fn create_job(&self, spec: JobSpec) -> Result<BackfillJob>;

    /// Begin executing a previously created job
    async fn start_job(&self, id: Uuid) -> Result<()>;

    /// Current view of a job, or None if unknown
    async fn get_job(&self, id: Uuid) -> Result<Option<BackfillJob>>;

    /// Request cancellation of a job
    async fn cancel_job(&self, id: Uuid) -> Result<()>;
}

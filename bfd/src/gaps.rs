//! Gap analysis boundary
//!
//! Gap detection internals live elsewhere; the scheduler only asks how many
//! gaps exist in a range to decide whether a gap-fill execution has work.

use async_trait::async_trait;
use chrono::NaiveDate;
use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::domain::BarInterval;

/// Result of a gap analysis over a date range
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GapReport {
    pub total_gaps: usize,
}

/// Detects missing bars in stored historical data
#[async_trait]
pub trait GapAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        symbols: &[String],
        from: NaiveDate,
        to: NaiveDate,
        granularity: BarInterval,
    ) -> Result<GapReport>;
}

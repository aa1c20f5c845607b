//! Priority classes for execution queueing

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Priority class for backfill executions
///
/// Priority only biases dequeue order in the execution queue; it carries
/// no other semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl ExecutionPriority {
    /// Offset added to the enqueue timestamp when building the queue key.
    ///
    /// Smaller keys dequeue first, so High sorts ahead of Normal ahead of Low.
    pub fn queue_offset(&self) -> Duration {
        match self {
            Self::High => Duration::hours(-1),
            Self::Normal => Duration::zero(),
            Self::Low => Duration::hours(1),
        }
    }
}

impl std::fmt::Display for ExecutionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for ExecutionPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

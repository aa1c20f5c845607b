//! Scheduler event types
//!
//! Observable lifecycle notifications: one event when a dispatch begins and
//! one when the execution reaches a terminal state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::BackfillExecution;

/// Lifecycle notification emitted by the execution loop
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    /// An execution was promoted to Running
    ExecutionStarted { execution: BackfillExecution },
    /// An execution reached a terminal state and was recorded
    ExecutionCompleted { execution: BackfillExecution },
}

impl SchedulerEvent {
    /// The execution this event is about
    pub fn execution(&self) -> &BackfillExecution {
        match self {
            Self::ExecutionStarted { execution } | Self::ExecutionCompleted { execution } => execution,
        }
    }

    /// The execution id this event is about
    pub fn execution_id(&self) -> Uuid {
        self.execution().id
    }

    /// Event type name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "ExecutionStarted",
            Self::ExecutionCompleted { .. } => "ExecutionCompleted",
        }
    }
}

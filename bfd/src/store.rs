//! Schedule persistence boundary
//!
//! Durable schedule storage is owned by the host service. The scheduler
//! consumes this trait; [`MemoryScheduleStore`] is the in-crate
//! implementation used by tests and by embedders that keep schedules in
//! configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Days, Utc};
use eyre::Result;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{BackfillExecution, BackfillSchedule, ExecutionTrigger};

/// Loads, queries, and persists backfill schedules and execution records
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Load (or reload) schedule definitions; called once at service start
    async fn load_schedules(&self) -> Result<()>;

    /// All enabled schedules
    async fn enabled_schedules(&self) -> Result<Vec<BackfillSchedule>>;

    /// Enabled schedules whose next due time has passed
    async fn due_schedules(&self) -> Result<Vec<BackfillSchedule>>;

    /// Look up one schedule by id
    async fn get_schedule(&self, id: &str) -> Result<Option<BackfillSchedule>>;

    /// Persist an updated schedule (next due time, enabled flag, ...)
    async fn update_schedule(&self, schedule: &BackfillSchedule) -> Result<()>;

    /// Record an execution against its schedule
    async fn record_execution(&self, schedule: &BackfillSchedule, execution: &BackfillExecution) -> Result<()>;

    /// Build a manual-trigger execution for the schedule
    async fn create_manual_execution(&self, schedule: &BackfillSchedule) -> Result<BackfillExecution>;
}

/// In-memory schedule store
///
/// Schedules are seeded through [`MemoryScheduleStore::insert`];
/// `load_schedules` initializes any missing next due times.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<String, BackfillSchedule>>,
    executions: RwLock<Vec<BackfillExecution>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a schedule definition
    pub async fn insert(&self, schedule: BackfillSchedule) {
        debug!(schedule = %schedule.id, "MemoryScheduleStore::insert");
        self.schedules.write().await.insert(schedule.id.clone(), schedule);
    }

    /// Recorded executions, oldest first
    pub async fn executions(&self) -> Vec<BackfillExecution> {
        self.executions.read().await.clone()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn load_schedules(&self) -> Result<()> {
        let now = Utc::now();
        let mut schedules = self.schedules.write().await;
        for schedule in schedules.values_mut() {
            if schedule.enabled && schedule.next_execution_at.is_none() {
                schedule.next_execution_at = schedule.calculate_next_execution(now);
            }
        }
        debug!(count = schedules.len(), "MemoryScheduleStore::load_schedules");
        Ok(())
    }

    async fn enabled_schedules(&self) -> Result<Vec<BackfillSchedule>> {
        let schedules = self.schedules.read().await;
        Ok(schedules.values().filter(|s| s.enabled).cloned().collect())
    }

    async fn due_schedules(&self) -> Result<Vec<BackfillSchedule>> {
        let now = Utc::now();
        let schedules = self.schedules.read().await;
        Ok(schedules.values().filter(|s| s.is_due(now)).cloned().collect())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<BackfillSchedule>> {
        Ok(self.schedules.read().await.get(id).cloned())
    }

    async fn update_schedule(&self, schedule: &BackfillSchedule) -> Result<()> {
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn record_execution(&self, schedule: &BackfillSchedule, execution: &BackfillExecution) -> Result<()> {
        debug!(
            schedule = %schedule.id,
            execution = %execution.id,
            status = %execution.status,
            "MemoryScheduleStore::record_execution"
        );
        if execution.is_terminal() {
            let mut schedules = self.schedules.write().await;
            if let Some(stored) = schedules.get_mut(&schedule.id) {
                stored.last_executed_at = execution.completed_at;
            }
        }
        self.executions.write().await.push(execution.clone());
        Ok(())
    }

    async fn create_manual_execution(&self, schedule: &BackfillSchedule) -> Result<BackfillExecution> {
        let today = Utc::now().date_naive();
        let start = today - Days::new(schedule.lookback_days as u64);
        let end = today - Days::new(1);
        Ok(BackfillExecution::new(schedule, ExecutionTrigger::Manual, start, end))
    }
}

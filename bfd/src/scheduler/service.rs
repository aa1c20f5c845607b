//! Backfill scheduler service
//!
//! Owns the two long-running loops and the public control surface. The
//! scheduler loop turns due schedules into queued executions; the execution
//! loop drains the queue and hands each item to the dispatcher. The loops
//! share nothing but the queue and the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Utc};
use eyre::{Context, Result};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{
    BackfillExecution, BackfillKind, BackfillSchedule, ExecutionPriority, ExecutionTrigger, Periodicity,
};
use crate::error::SchedulerError;
use crate::events::{EventBus, SchedulerEvent};
use crate::gaps::GapAnalyzer;
use crate::jobs::JobManager;
use crate::store::ScheduleStore;
use crate::workers::WorkerPool;

use super::catchup;
use super::config::SchedulerConfig;
use super::dispatch::Dispatcher;
use super::queue::ExecutionQueue;

/// Back-off after a failed scheduler tick
const SCHEDULER_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Back-off after a dispatch error escapes the execution loop
const EXECUTION_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// How long `stop` waits for each loop before giving up
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Orchestrates scheduled backfills against the store, gap-analysis, and
/// job-manager collaborators
pub struct BackfillScheduler {
    config: SchedulerConfig,
    store: Arc<dyn ScheduleStore>,
    workers: Arc<dyn WorkerPool>,
    queue: Arc<ExecutionQueue>,
    events: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    execution_task: Mutex<Option<JoinHandle<()>>>,
}

impl BackfillScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        gaps: Arc<dyn GapAnalyzer>,
        jobs: Arc<dyn JobManager>,
        workers: Arc<dyn WorkerPool>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = Arc::new(EventBus::with_default_capacity());
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            store.clone(),
            gaps,
            jobs,
            events.clone(),
            shutdown_rx.clone(),
        ));

        Self {
            config,
            store,
            workers,
            queue: Arc::new(ExecutionQueue::new()),
            events,
            dispatcher,
            shutdown_tx,
            shutdown_rx,
            scheduler_task: Mutex::new(None),
            execution_task: Mutex::new(None),
        }
    }

    /// Start the service: load schedules, run catch-up, spawn both loops,
    /// start the worker pool
    ///
    /// Calling start while already running is a warning, not an error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running().await {
            warn!("start requested but the scheduler is already running");
            return Ok(());
        }

        info!("starting backfill scheduler");
        self.shutdown_tx.send_replace(false);

        self.store.load_schedules().await.context("failed to load schedules")?;

        if self.config.catch_up.enabled {
            self.run_catch_up().await;
        } else {
            debug!("start: catch-up disabled");
        }

        let scheduler = self.clone();
        *self.scheduler_task.lock().await = Some(tokio::spawn(async move {
            scheduler.scheduler_loop().await;
        }));

        let executor = self.clone();
        *self.execution_task.lock().await = Some(tokio::spawn(async move {
            executor.execution_loop().await;
        }));

        self.workers.start().await.context("failed to start worker pool")?;

        info!("backfill scheduler started");
        Ok(())
    }

    /// Stop the service: signal shutdown, await both loops with a grace
    /// period, stop the worker pool
    ///
    /// Loops that miss the grace period are detached and torn down with the
    /// process.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping backfill scheduler");
        self.shutdown_tx.send_replace(true);

        for (name, slot) in [
            ("scheduler", &self.scheduler_task),
            ("execution", &self.execution_task),
        ] {
            if let Some(handle) = slot.lock().await.take() {
                if tokio::time::timeout(STOP_GRACE_PERIOD, handle).await.is_err() {
                    warn!(loop_name = name, "loop did not stop within the grace period");
                }
            }
        }

        self.workers.stop().await.context("failed to stop worker pool")?;

        info!("backfill scheduler stopped");
        Ok(())
    }

    /// Build and enqueue a manual execution for the schedule at High priority
    ///
    /// The returned execution reflects its enqueued state, not its outcome.
    pub async fn trigger_manual_execution(&self, schedule_id: &str) -> Result<BackfillExecution, SchedulerError> {
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await
            .map_err(SchedulerError::Store)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_string()))?;

        let execution = self
            .store
            .create_manual_execution(&schedule)
            .await
            .map_err(SchedulerError::Store)?;

        info!(
            schedule = %schedule.id,
            execution = %execution.id,
            "manual execution enqueued"
        );
        self.queue
            .enqueue(schedule, execution.clone(), ExecutionPriority::High)
            .await;
        Ok(execution)
    }

    /// Enqueue an ad-hoc gap-fill over the given symbols
    ///
    /// Fails before any execution is created when the symbol list is empty.
    pub async fn run_immediate_gap_fill(
        &self,
        symbols: Vec<String>,
        lookback_days: u32,
        priority: ExecutionPriority,
    ) -> Result<BackfillExecution, SchedulerError> {
        if symbols.is_empty() {
            return Err(SchedulerError::NoSymbols);
        }

        let now = Utc::now();
        let schedule = BackfillSchedule::new(
            format!("gap-fill-{}", uuid::Uuid::now_v7()),
            "Ad-hoc gap fill",
            Periodicity::Manual,
        )
        .with_kind(BackfillKind::GapFill)
        .with_symbols(symbols)
        .with_lookback_days(lookback_days)
        .with_priority(priority);

        let today = now.date_naive();
        let execution = BackfillExecution::new(
            &schedule,
            ExecutionTrigger::Api,
            today - Days::new(lookback_days as u64),
            today - Days::new(1),
        );

        info!(
            schedule = %schedule.id,
            execution = %execution.id,
            %priority,
            "ad-hoc gap fill enqueued"
        );
        self.queue.enqueue(schedule, execution.clone(), priority).await;
        Ok(execution)
    }

    /// Whether the scheduler loop task is alive and not completed
    pub async fn is_running(&self) -> bool {
        self.scheduler_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Current queue depth
    pub async fn queued_executions(&self) -> usize {
        self.queue.len().await
    }

    /// Subscribe to execution lifecycle events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Reconstruct and enqueue catch-up executions for occurrences missed
    /// while the service was down
    ///
    /// Best-effort: a failure for one schedule never blocks the rest.
    async fn run_catch_up(&self) {
        let now = Utc::now();
        let window = chrono::Duration::days(self.config.catch_up.window_days as i64);

        let schedules = match self.store.enabled_schedules().await {
            Ok(schedules) => schedules,
            Err(err) => {
                warn!(error = ?err, "catch-up skipped: failed to list enabled schedules");
                return;
            }
        };

        debug!(count = schedules.len(), "run_catch_up: examining schedules");
        for schedule in schedules {
            let missed = catchup::missed_occurrences(&schedule, now, window);
            if missed == 0 {
                continue;
            }

            match catchup::build_catch_up_execution(&schedule, now) {
                Some(execution) => {
                    info!(
                        schedule = %schedule.id,
                        missed,
                        period_start = %execution.period_start,
                        period_end = %execution.period_end,
                        "enqueueing catch-up execution"
                    );
                    self.queue
                        .enqueue(schedule, execution, ExecutionPriority::Normal)
                        .await;
                }
                None => {
                    debug!(schedule = %schedule.id, "run_catch_up: range empty, nothing to backfill yet");
                }
            }
        }
    }

    /// Scheduler loop: poll due schedules on a fixed interval until shutdown
    async fn scheduler_loop(self: Arc<Self>) {
        info!("scheduler loop started");
        let mut shutdown = self.shutdown_rx.clone();
        let mut interval = tokio::time::interval(self.config.schedule_check_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.run_scheduler_tick().await {
                        warn!(error = ?err, "scheduler tick failed, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(SCHEDULER_ERROR_BACKOFF) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("scheduler loop stopped");
    }

    /// One scheduler tick: enqueue every due schedule and advance its next
    /// due time
    pub(crate) async fn run_scheduler_tick(&self) -> Result<()> {
        let now = Utc::now();

        if self.config.market_hours.paused_at(now.time()) {
            debug!("run_scheduler_tick: inside market-hours pause window, skipping");
            return Ok(());
        }

        let due = self.store.due_schedules().await.context("failed to query due schedules")?;
        if due.is_empty() {
            debug!("run_scheduler_tick: no due schedules");
            return Ok(());
        }

        info!(count = due.len(), "dispatching due schedules");
        for mut schedule in due {
            let today = now.date_naive();
            let execution = BackfillExecution::new(
                &schedule,
                ExecutionTrigger::Scheduled,
                today - Days::new(schedule.lookback_days as u64),
                today - Days::new(1),
            );
            self.queue
                .enqueue(schedule.clone(), execution, schedule.priority)
                .await;

            // Advance past now so the schedule is never re-dispatched for
            // the same due time
            schedule.advance_next_execution(now);
            self.store
                .update_schedule(&schedule)
                .await
                .with_context(|| format!("failed to persist schedule {}", schedule.id))?;
        }

        Ok(())
    }

    /// Execution loop: drain the queue, dispatching one execution at a time
    async fn execution_loop(self: Arc<Self>) {
        info!("execution loop started");
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.try_dequeue().await {
                Some(item) => {
                    let execution_id = item.execution.id;
                    if let Err(err) = self.dispatcher.dispatch(item).await {
                        warn!(execution = %execution_id, error = ?err, "dispatch error, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(EXECUTION_ERROR_BACKOFF) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.queue_poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!("execution loop stopped");
    }
}

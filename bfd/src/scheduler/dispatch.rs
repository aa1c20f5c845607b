//! Execution dispatch state machine
//!
//! Drives one execution from Running to a terminal state: symbol
//! resolution, the zero-gap fast path, job creation, the bounded
//! completion wait, and result aggregation. A single-permit semaphore
//! serializes dispatch system-wide, so at most one execution is Running
//! at any instant regardless of queue depth.

use std::sync::Arc;

use eyre::{Context, Result, eyre};
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{BackfillExecution, BackfillKind, BackfillSchedule, SymbolExecutionResult, SymbolOutcome};
use crate::events::{EventBus, SchedulerEvent};
use crate::gaps::GapAnalyzer;
use crate::jobs::{BackfillJob, JobManager, JobOptions, JobSpec, JobStatus, SymbolJobStatus};
use crate::store::ScheduleStore;

use super::config::SchedulerConfig;
use super::queue::ScheduledExecution;

/// How the bounded job-completion wait ended
enum JobWait {
    /// The job reached a terminal state
    Finished(BackfillJob),
    /// `max-execution-duration` elapsed first
    TimedOut,
    /// The service shutdown signal fired mid-wait
    Interrupted,
}

pub(crate) struct Dispatcher {
    config: SchedulerConfig,
    store: Arc<dyn ScheduleStore>,
    gaps: Arc<dyn GapAnalyzer>,
    jobs: Arc<dyn JobManager>,
    events: Arc<EventBus>,
    /// Single permit: one dispatch at a time, system-wide
    slot: Semaphore,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        gaps: Arc<dyn GapAnalyzer>,
        jobs: Arc<dyn JobManager>,
        events: Arc<EventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            gaps,
            jobs,
            events,
            slot: Semaphore::new(1),
            shutdown,
        }
    }

    /// Run one execution to a terminal state
    ///
    /// Every exit path, including step failures, persists the execution and
    /// emits the completed event.
    pub(crate) async fn dispatch(&self, item: ScheduledExecution) -> Result<()> {
        let ScheduledExecution { schedule, mut execution } = item;

        let _permit = self
            .slot
            .acquire()
            .await
            .context("execution slot semaphore closed")?;

        execution.mark_running();
        info!(
            execution = %execution.id,
            schedule = %schedule.id,
            trigger = %execution.trigger,
            period_start = %execution.period_start,
            period_end = %execution.period_end,
            "dispatch: execution started"
        );
        self.events.emit(SchedulerEvent::ExecutionStarted {
            execution: execution.clone(),
        });

        if let Err(err) = self.run_steps(&schedule, &mut execution).await {
            warn!(execution = %execution.id, error = ?err, "dispatch: execution failed");
            if !execution.is_terminal() {
                execution.mark_failed(format!("{err:#}"), Some(format!("{err:?}")));
            }
        }

        self.finalize(&schedule, &mut execution).await;
        Ok(())
    }

    async fn run_steps(&self, schedule: &BackfillSchedule, execution: &mut BackfillExecution) -> Result<()> {
        // Resolve the effective symbol list; an empty result is a deliberate
        // no-op outcome, not an error
        let symbols = if execution.symbols.is_empty() {
            self.config.default_symbols.clone()
        } else {
            execution.symbols.clone()
        };
        if symbols.is_empty() {
            debug!(execution = %execution.id, "run_steps: no symbols, skipping");
            execution.mark_skipped("no symbols on the schedule and no default symbols configured");
            return Ok(());
        }
        execution.symbols = symbols.clone();
        execution.stats.total_symbols = symbols.len();

        // Gap-fill schedules are idempotent no-ops when nothing is missing
        if schedule.kind == BackfillKind::GapFill {
            let report = self
                .gaps
                .analyze(&symbols, execution.period_start, execution.period_end, schedule.granularity)
                .await
                .context("gap analysis failed")?;
            execution.stats.gaps_found = report.total_gaps;
            debug!(execution = %execution.id, gaps = report.total_gaps, "run_steps: gap analysis");

            if report.total_gaps == 0 {
                execution.message = Some("no gaps detected in range".to_string());
                execution.mark_completed();
                return Ok(());
            }
        }

        // Build and start the provider job
        let spec = JobSpec {
            name: format!(
                "{} {}..{}",
                schedule.name, execution.period_start, execution.period_end
            ),
            symbols,
            period_start: execution.period_start,
            period_end: execution.period_end,
            granularity: schedule.granularity,
            options: JobOptions::default(),
            preferred_providers: schedule.preferred_providers.clone(),
        };
        let job = self.jobs.create_job(spec).await.context("failed to create backfill job")?;
        execution.job_id = Some(job.id);
        self.jobs.start_job(job.id).await.context("failed to start backfill job")?;
        debug!(execution = %execution.id, job = %job.id, "run_steps: job started");

        match self.wait_for_job(job.id).await? {
            JobWait::Finished(job) => {
                aggregate_job_results(execution, &job);
            }
            JobWait::TimedOut => {
                warn!(execution = %execution.id, job = %job.id, "run_steps: execution timed out, cancelling job");
                if let Err(err) = self.jobs.cancel_job(job.id).await {
                    warn!(job = %job.id, error = ?err, "run_steps: job cancellation failed");
                }
                execution.mark_cancelled(format!(
                    "timed out after {:?}",
                    self.config.max_execution_duration()
                ));
            }
            JobWait::Interrupted => {
                info!(execution = %execution.id, job = %job.id, "run_steps: shutdown requested, cancelling job");
                if let Err(err) = self.jobs.cancel_job(job.id).await {
                    warn!(job = %job.id, error = ?err, "run_steps: job cancellation failed");
                }
                execution.mark_cancelled("shutdown requested during job wait");
            }
        }

        Ok(())
    }

    /// Poll the job manager until the job completes, the per-dispatch
    /// deadline passes, or shutdown is requested
    async fn wait_for_job(&self, id: Uuid) -> Result<JobWait> {
        let deadline = Instant::now() + self.config.max_execution_duration();
        let mut shutdown = self.shutdown.clone();

        loop {
            let job = self
                .jobs
                .get_job(id)
                .await
                .context("failed to poll job status")?
                .ok_or_else(|| eyre!("job {id} disappeared from the job manager"))?;

            if job.is_complete() {
                return Ok(JobWait::Finished(job));
            }
            if Instant::now() >= deadline {
                return Ok(JobWait::TimedOut);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.job_poll_interval()) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(JobWait::Interrupted);
                    }
                }
            }
        }
    }

    /// Persist and notify; runs on every exit path
    async fn finalize(&self, schedule: &BackfillSchedule, execution: &mut BackfillExecution) {
        if !execution.is_terminal() {
            execution.mark_failed("dispatch ended without a terminal status", None);
        }

        if let Err(err) = self.store.record_execution(schedule, execution).await {
            warn!(execution = %execution.id, error = ?err, "finalize: failed to record execution");
        }

        info!(
            execution = %execution.id,
            status = %execution.status,
            symbols_ok = execution.stats.successful_symbols,
            symbols_failed = execution.stats.failed_symbols,
            bars = execution.stats.bars_retrieved,
            "dispatch: execution finished"
        );
        self.events.emit(SchedulerEvent::ExecutionCompleted {
            execution: execution.clone(),
        });
    }
}

/// Translate final job statistics and per-symbol progress onto the execution
/// and derive its terminal status
fn aggregate_job_results(execution: &mut BackfillExecution, job: &BackfillJob) {
    for (symbol, progress) in &job.progress {
        let outcome = match progress.status {
            SymbolJobStatus::Completed => SymbolOutcome::Completed,
            SymbolJobStatus::Failed => SymbolOutcome::Failed,
            // Symbols the job never reached (cancelled mid-run) count as skipped
            SymbolJobStatus::Skipped | SymbolJobStatus::Pending | SymbolJobStatus::Fetching => SymbolOutcome::Skipped,
        };
        execution.symbol_results.insert(
            symbol.clone(),
            SymbolExecutionResult {
                symbol: symbol.clone(),
                outcome,
                bars_retrieved: progress.bars_retrieved,
                provider: progress.provider.clone(),
                last_error: progress.last_error.clone(),
            },
        );
    }

    execution.stats.successful_symbols = execution
        .symbol_results
        .values()
        .filter(|r| r.outcome == SymbolOutcome::Completed)
        .count();
    execution.stats.failed_symbols = execution
        .symbol_results
        .values()
        .filter(|r| r.outcome == SymbolOutcome::Failed)
        .count();
    execution.stats.bars_retrieved = job.statistics.bars_retrieved;
    execution.stats.requests_made = job.statistics.requests_made;

    match job.status {
        JobStatus::Completed if execution.stats.failed_symbols == 0 => {
            execution.mark_completed();
        }
        JobStatus::Completed => {
            execution.mark_partial_success();
        }
        JobStatus::Failed => {
            execution.mark_failed(
                job.error.clone().unwrap_or_else(|| "job failed".to_string()),
                None,
            );
        }
        JobStatus::Cancelled => {
            execution.mark_cancelled("job was cancelled");
        }
        JobStatus::Pending | JobStatus::Running => {
            execution.mark_failed("job reported as complete while still running", None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionStatus, ExecutionTrigger, Periodicity};
    use crate::gaps::GapReport;
    use crate::jobs::{JobStatistics, SymbolProgress};
    use crate::store::MemoryScheduleStore;
    use async_trait::async_trait;
    use chrono::{Days, NaiveDate, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct FixedGapAnalyzer {
        total_gaps: usize,
        calls: AtomicUsize,
    }

    impl FixedGapAnalyzer {
        fn new(total_gaps: usize) -> Self {
            Self {
                total_gaps,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GapAnalyzer for FixedGapAnalyzer {
        async fn analyze(
            &self,
            _symbols: &[String],
            _from: NaiveDate,
            _to: NaiveDate,
            _granularity: crate::domain::BarInterval,
        ) -> Result<GapReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GapReport {
                total_gaps: self.total_gaps,
            })
        }
    }

    /// Job manager whose jobs finish with a fixed status after one poll,
    /// or never finish when `completes` is false
    struct ScriptedJobManager {
        completes: bool,
        final_status: JobStatus,
        failed_symbols: Vec<String>,
        jobs: Mutex<HashMap<Uuid, BackfillJob>>,
        created: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl ScriptedJobManager {
        fn completing(final_status: JobStatus) -> Self {
            Self {
                completes: true,
                final_status,
                failed_symbols: Vec::new(),
                jobs: Mutex::new(HashMap::new()),
                created: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
            }
        }

        fn with_failed_symbols(mut self, symbols: Vec<String>) -> Self {
            self.failed_symbols = symbols;
            self
        }

        fn never_completing() -> Self {
            Self {
                completes: false,
                final_status: JobStatus::Running,
                failed_symbols: Vec::new(),
                jobs: Mutex::new(HashMap::new()),
                created: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
            }
        }

        fn created_count(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn cancelled_count(&self) -> usize {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobManager for ScriptedJobManager {
        async fn create_job(&self, spec: JobSpec) -> Result<BackfillJob> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let job = BackfillJob::from_spec(&spec);
            self.jobs.lock().await.insert(job.id, job.clone());
            Ok(job)
        }

        async fn start_job(&self, id: Uuid) -> Result<()> {
            let mut jobs = self.jobs.lock().await;
            let job = jobs.get_mut(&id).ok_or_else(|| eyre!("unknown job"))?;
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            Ok(())
        }

        async fn get_job(&self, id: Uuid) -> Result<Option<BackfillJob>> {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(None);
            };
            if self.completes && !job.is_complete() {
                job.status = self.final_status;
                job.completed_at = Some(Utc::now());
                job.statistics = JobStatistics {
                    bars_retrieved: 1000,
                    requests_made: 10,
                };
                for (symbol, progress) in job.progress.iter_mut() {
                    progress.status = if self.failed_symbols.contains(symbol) {
                        SymbolJobStatus::Failed
                    } else {
                        SymbolJobStatus::Completed
                    };
                    progress.bars_retrieved = 500;
                    progress.provider = Some("alpaca".to_string());
                    if self.failed_symbols.contains(symbol) {
                        progress.last_error = Some("provider error".to_string());
                    }
                }
            }
            Ok(Some(job.clone()))
        }

        async fn cancel_job(&self, id: Uuid) -> Result<()> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            let mut jobs = self.jobs.lock().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
            }
            Ok(())
        }
    }

    fn item(kind: BackfillKind, symbols: Vec<String>) -> ScheduledExecution {
        let schedule = BackfillSchedule::new("daily-spy", "Daily SPY", Periodicity::Manual)
            .with_kind(kind)
            .with_symbols(symbols);
        let today = Utc::now().date_naive();
        let execution = BackfillExecution::new(
            &schedule,
            ExecutionTrigger::Scheduled,
            today - Days::new(5),
            today - Days::new(1),
        );
        ScheduledExecution { schedule, execution }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<MemoryScheduleStore>,
        gaps: Arc<FixedGapAnalyzer>,
        jobs: Arc<ScriptedJobManager>,
        events: Arc<EventBus>,
        // Keeps the shutdown channel open for the dispatcher's lifetime
        _shutdown_tx: watch::Sender<bool>,
    }

    fn harness(config: SchedulerConfig, gaps: FixedGapAnalyzer, jobs: ScriptedJobManager) -> Harness {
        let store = Arc::new(MemoryScheduleStore::new());
        let gaps = Arc::new(gaps);
        let jobs = Arc::new(jobs);
        let events = Arc::new(EventBus::with_default_capacity());
        let (shutdown_tx, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            config,
            store.clone(),
            gaps.clone(),
            jobs.clone(),
            events.clone(),
            rx,
        );
        Harness {
            dispatcher,
            store,
            gaps,
            jobs,
            events,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            job_poll_interval_ms: 10,
            max_execution_duration_ms: 500,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_symbols_is_skipped() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(0),
            ScriptedJobManager::completing(JobStatus::Completed),
        );

        h.dispatcher.dispatch(item(BackfillKind::GapFill, Vec::new())).await.unwrap();

        let recorded = h.store.executions().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, ExecutionStatus::Skipped);
        assert!(recorded[0].message.as_deref().unwrap().contains("no symbols"));
        // Gap analysis and job creation never ran
        assert_eq!(h.gaps.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.jobs.created_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_gap_fast_path_skips_job_creation() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(0),
            ScriptedJobManager::completing(JobStatus::Completed),
        );

        h.dispatcher
            .dispatch(item(BackfillKind::GapFill, vec!["SPY".to_string()]))
            .await
            .unwrap();

        let recorded = h.store.executions().await;
        assert_eq!(recorded[0].status, ExecutionStatus::Completed);
        assert_eq!(recorded[0].stats.gaps_found, 0);
        assert!(recorded[0].job_id.is_none());
        assert_eq!(h.jobs.created_count(), 0);
    }

    #[tokio::test]
    async fn test_gap_fill_with_gaps_runs_job() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(12),
            ScriptedJobManager::completing(JobStatus::Completed),
        );

        h.dispatcher
            .dispatch(item(BackfillKind::GapFill, vec!["SPY".to_string()]))
            .await
            .unwrap();

        let recorded = h.store.executions().await;
        assert_eq!(recorded[0].status, ExecutionStatus::Completed);
        assert_eq!(recorded[0].stats.gaps_found, 12);
        assert!(recorded[0].job_id.is_some());
        assert_eq!(recorded[0].stats.bars_retrieved, 1000);
        assert_eq!(recorded[0].stats.successful_symbols, 1);
    }

    #[tokio::test]
    async fn test_full_backfill_skips_gap_analysis() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(0),
            ScriptedJobManager::completing(JobStatus::Completed),
        );

        h.dispatcher
            .dispatch(item(BackfillKind::Full, vec!["SPY".to_string()]))
            .await
            .unwrap();

        assert_eq!(h.gaps.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.jobs.created_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_success_when_some_symbols_fail() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(3),
            ScriptedJobManager::completing(JobStatus::Completed).with_failed_symbols(vec!["QQQ".to_string()]),
        );

        h.dispatcher
            .dispatch(item(BackfillKind::Full, vec!["SPY".to_string(), "QQQ".to_string()]))
            .await
            .unwrap();

        let recorded = h.store.executions().await;
        assert_eq!(recorded[0].status, ExecutionStatus::PartialSuccess);
        assert_eq!(recorded[0].stats.successful_symbols, 1);
        assert_eq!(recorded[0].stats.failed_symbols, 1);
        assert_eq!(
            recorded[0].symbol_results["QQQ"].last_error.as_deref(),
            Some("provider error")
        );
    }

    #[tokio::test]
    async fn test_failed_job_marks_execution_failed() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(1),
            ScriptedJobManager::completing(JobStatus::Failed),
        );

        h.dispatcher
            .dispatch(item(BackfillKind::Full, vec!["SPY".to_string()]))
            .await
            .unwrap();

        let recorded = h.store.executions().await;
        assert_eq!(recorded[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_cancels_job_and_marks_cancelled() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(1),
            ScriptedJobManager::never_completing(),
        );

        h.dispatcher
            .dispatch(item(BackfillKind::Full, vec!["SPY".to_string()]))
            .await
            .unwrap();

        let recorded = h.store.executions().await;
        assert_eq!(recorded[0].status, ExecutionStatus::Cancelled);
        assert!(recorded[0].message.as_deref().unwrap().contains("timed out"));
        assert_eq!(h.jobs.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn test_events_emitted_on_every_path() {
        let h = harness(
            fast_config(),
            FixedGapAnalyzer::new(0),
            ScriptedJobManager::completing(JobStatus::Completed),
        );
        let mut rx = h.events.subscribe();

        h.dispatcher
            .dispatch(item(BackfillKind::GapFill, vec!["SPY".to_string()]))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type(), "ExecutionStarted");
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.event_type(), "ExecutionCompleted");
        assert_eq!(completed.execution().status, ExecutionStatus::Completed);
    }

    struct FailingGapAnalyzer;

    #[async_trait]
    impl GapAnalyzer for FailingGapAnalyzer {
        async fn analyze(
            &self,
            _symbols: &[String],
            _from: NaiveDate,
            _to: NaiveDate,
            _granularity: crate::domain::BarInterval,
        ) -> Result<GapReport> {
            Err(eyre!("gap store unavailable"))
        }
    }

    #[tokio::test]
    async fn test_step_failure_is_recorded_and_notified() {
        let store = Arc::new(MemoryScheduleStore::new());
        let jobs = Arc::new(ScriptedJobManager::completing(JobStatus::Completed));
        let events = Arc::new(EventBus::with_default_capacity());
        let (_shutdown_tx, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            fast_config(),
            store.clone(),
            Arc::new(FailingGapAnalyzer),
            jobs,
            events.clone(),
            rx,
        );
        let mut event_rx = events.subscribe();

        dispatcher
            .dispatch(item(BackfillKind::GapFill, vec!["SPY".to_string()]))
            .await
            .unwrap();

        let recorded = store.executions().await;
        assert_eq!(recorded[0].status, ExecutionStatus::Failed);
        assert!(recorded[0].error.as_deref().unwrap().contains("gap analysis failed"));
        assert!(recorded[0].error_trace.is_some());

        // Started and completed events both fired despite the failure
        assert_eq!(event_rx.recv().await.unwrap().event_type(), "ExecutionStarted");
        assert_eq!(event_rx.recv().await.unwrap().event_type(), "ExecutionCompleted");
    }
}

//! Startup catch-up reconstruction
//!
//! Replays a schedule's periodicity forward from its last execution to find
//! occurrences missed while the service was down. However many occurrences
//! are missed, a schedule gets at most one consolidated catch-up execution.

use chrono::{DateTime, Days, Duration, Utc};
use tracing::debug;

use crate::domain::{BackfillExecution, BackfillSchedule, ExecutionTrigger};

/// Hard bound on the reconstruction walk, protecting against periodicities
/// that never advance past now (e.g. a zero-minute interval).
pub(crate) const MAX_CATCH_UP_ITERATIONS: usize = 1000;

/// Count occurrences missed since the schedule last executed
///
/// Walks `calculate_next_execution` forward from `last_executed_at`; an
/// occurrence counts as missed only when it falls inside the catch-up
/// window. The walk cursor advances on every occurrence regardless, so
/// reconstruction always moves forward in schedule-time.
pub(crate) fn missed_occurrences(schedule: &BackfillSchedule, now: DateTime<Utc>, window: Duration) -> usize {
    let Some(last) = schedule.last_executed_at else {
        return 0;
    };

    let mut check = last;
    let mut missed = 0;

    for _ in 0..MAX_CATCH_UP_ITERATIONS {
        let Some(next) = schedule.calculate_next_execution(check) else {
            break;
        };
        if next > now {
            break;
        }
        if now - next <= window {
            missed += 1;
        }
        check = next;
    }

    debug!(schedule = %schedule.id, missed, "missed_occurrences");
    missed
}

/// Build the single consolidated catch-up execution for a schedule
///
/// The range spans the day after the last execution through yesterday.
/// Returns None when that range is empty (outage shorter than two days).
pub(crate) fn build_catch_up_execution(
    schedule: &BackfillSchedule,
    now: DateTime<Utc>,
) -> Option<BackfillExecution> {
    let last = schedule.last_executed_at?;
    let start = last.date_naive() + Days::new(1);
    let end = now.date_naive() - Days::new(1);
    if start > end {
        return None;
    }
    Some(BackfillExecution::new(schedule, ExecutionTrigger::CatchUp, start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Periodicity;
    use chrono::NaiveTime;

    fn daily_schedule(last_executed_days_ago: i64) -> BackfillSchedule {
        let mut schedule = BackfillSchedule::new(
            "daily-spy",
            "Daily SPY",
            Periodicity::Daily {
                at: NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
            },
        )
        .with_symbols(vec!["SPY".to_string()])
        .with_lookback_days(30);
        schedule.last_executed_at = Some(Utc::now() - Duration::days(last_executed_days_ago));
        schedule
    }

    #[test]
    fn test_no_last_execution_means_nothing_missed() {
        let mut schedule = daily_schedule(5);
        schedule.last_executed_at = None;
        assert_eq!(missed_occurrences(&schedule, Utc::now(), Duration::days(7)), 0);
    }

    #[test]
    fn test_missed_occurrences_counted_within_window() {
        let schedule = daily_schedule(5);
        // Five days of daily occurrences, all within a 7-day window
        let missed = missed_occurrences(&schedule, Utc::now(), Duration::days(7));
        assert!(missed >= 4 && missed <= 5, "expected ~5 missed, got {missed}");
    }

    #[test]
    fn test_window_excludes_old_occurrences() {
        // Last executed 5 days ago, but only the most recent day is in window
        let schedule = daily_schedule(5);
        let missed = missed_occurrences(&schedule, Utc::now(), Duration::days(1));
        assert_eq!(missed, 1);
    }

    #[test]
    fn test_degenerate_periodicity_hits_iteration_bound() {
        // A zero-minute interval never advances past now; the walk must
        // terminate at the bound and count nothing missed outside the window
        let mut schedule = daily_schedule(5);
        schedule.periodicity = Periodicity::Every { minutes: 0 };
        let missed = missed_occurrences(&schedule, Utc::now(), Duration::days(1));
        assert_eq!(missed, 0);
    }

    #[test]
    fn test_degenerate_periodicity_inside_window_is_bounded() {
        let mut schedule = daily_schedule(0);
        schedule.last_executed_at = Some(Utc::now() - Duration::hours(1));
        schedule.periodicity = Periodicity::Every { minutes: 0 };
        let missed = missed_occurrences(&schedule, Utc::now(), Duration::days(1));
        assert_eq!(missed, MAX_CATCH_UP_ITERATIONS);
    }

    #[test]
    fn test_manual_periodicity_never_misses() {
        let mut schedule = daily_schedule(5);
        schedule.periodicity = Periodicity::Manual;
        assert_eq!(missed_occurrences(&schedule, Utc::now(), Duration::days(7)), 0);
    }

    #[test]
    fn test_catch_up_execution_range() {
        let schedule = daily_schedule(5);
        let now = Utc::now();
        let execution = build_catch_up_execution(&schedule, now).unwrap();

        let last = schedule.last_executed_at.unwrap().date_naive();
        assert_eq!(execution.period_start, last + Days::new(1));
        assert_eq!(execution.period_end, now.date_naive() - Days::new(1));
        assert_eq!(execution.trigger, ExecutionTrigger::CatchUp);
        assert_eq!(execution.symbols, vec!["SPY"]);
    }

    #[test]
    fn test_catch_up_execution_empty_range() {
        // Last executed within the last day: nothing backfillable yet
        let mut schedule = daily_schedule(0);
        schedule.last_executed_at = Some(Utc::now());
        assert!(build_catch_up_execution(&schedule, Utc::now()).is_none());
    }
}

//! Backfill schedule domain type
//!
//! A schedule is a named, recurring backfill definition. Its next due time
//! is always derived through [`Periodicity::next_occurrence`]; the service
//! never hand-rolls that calculation.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::granularity::BarInterval;
use super::priority::ExecutionPriority;

/// What a schedule backfills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackfillKind {
    /// Check for missing bars first; a no-op when nothing is missing
    #[default]
    GapFill,
    /// Re-fetch the full range unconditionally
    Full,
}

impl std::fmt::Display for BackfillKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GapFill => write!(f, "gap_fill"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Recurrence rule for a schedule
///
/// All times are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Periodicity {
    /// Every day at a fixed time
    Daily { at: NaiveTime },
    /// Once a week on the given weekday at a fixed time
    Weekly { weekday: Weekday, at: NaiveTime },
    /// Fixed interval in minutes
    Every { minutes: u32 },
    /// Never recurs; runs only when triggered manually or via the API
    Manual,
}

impl Periodicity {
    /// Calculate the next occurrence strictly derived from `from`
    ///
    /// Returns `None` for non-recurring schedules. `Every { minutes: 0 }`
    /// does not advance; callers that walk occurrences forward must bound
    /// their iteration.
    pub fn next_occurrence(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Daily { at } => {
                let today = from.date_naive().and_time(*at).and_utc();
                if today > from {
                    Some(today)
                } else {
                    Some(today + Duration::days(1))
                }
            }
            Self::Weekly { weekday, at } => {
                let days_ahead = (weekday.num_days_from_monday() as i64
                    - from.weekday().num_days_from_monday() as i64
                    + 7)
                    % 7;
                let candidate = (from.date_naive() + Duration::days(days_ahead))
                    .and_time(*at)
                    .and_utc();
                if candidate > from {
                    Some(candidate)
                } else {
                    Some(candidate + Duration::days(7))
                }
            }
            Self::Every { minutes } => Some(from + Duration::minutes(*minutes as i64)),
            Self::Manual => None,
        }
    }
}

/// A named, enabled/disabled recurring backfill definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSchedule {
    /// Caller-chosen identifier, e.g. `daily-spy`
    pub id: String,

    /// Display name
    pub name: String,

    /// Backfill kind (gap-fill vs full re-fetch)
    #[serde(default)]
    pub kind: BackfillKind,

    /// Symbols this schedule covers; empty falls back to the configured defaults
    #[serde(default)]
    pub symbols: Vec<String>,

    /// How far back each execution reaches, in days
    #[serde(rename = "lookback-days")]
    pub lookback_days: u32,

    /// Bar granularity requested from providers
    #[serde(default)]
    pub granularity: BarInterval,

    /// Queue priority for executions of this schedule
    #[serde(default)]
    pub priority: ExecutionPriority,

    /// Recurrence rule
    pub periodicity: Periodicity,

    /// Disabled schedules are never dispatched or caught up
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Providers to try first when building jobs
    #[serde(rename = "preferred-providers", default)]
    pub preferred_providers: Vec<String>,

    /// When an execution of this schedule last ran
    #[serde(rename = "last-executed-at", default)]
    pub last_executed_at: Option<DateTime<Utc>>,

    /// Next due time; recomputed by the scheduler loop on every dispatch
    #[serde(rename = "next-execution-at", default)]
    pub next_execution_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl BackfillSchedule {
    /// Create a new enabled schedule with defaults for the optional fields
    pub fn new(id: impl Into<String>, name: impl Into<String>, periodicity: Periodicity) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: BackfillKind::default(),
            symbols: Vec::new(),
            lookback_days: 30,
            granularity: BarInterval::default(),
            priority: ExecutionPriority::default(),
            periodicity,
            enabled: true,
            preferred_providers: Vec::new(),
            last_executed_at: None,
            next_execution_at: None,
        }
    }

    /// Builder method to set the symbol list
    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = symbols;
        self
    }

    /// Builder method to set the backfill kind
    pub fn with_kind(mut self, kind: BackfillKind) -> Self {
        self.kind = kind;
        self
    }

    /// Builder method to set the lookback window
    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    /// Builder method to set the priority
    pub fn with_priority(mut self, priority: ExecutionPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the granularity
    pub fn with_granularity(mut self, granularity: BarInterval) -> Self {
        self.granularity = granularity;
        self
    }

    /// Next occurrence of this schedule's periodicity after `reference`
    pub fn calculate_next_execution(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.periodicity.next_occurrence(reference)
    }

    /// Whether the schedule is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_execution_at.is_some_and(|t| t <= now)
    }

    /// Advance the next due time past `now`
    pub fn advance_next_execution(&mut self, now: DateTime<Utc>) {
        self.next_execution_at = self.calculate_next_execution(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Timelike};

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_daily_next_occurrence() {
        let periodicity = Periodicity::Daily { at: at(14, 30) };
        let morning = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let next = periodicity.next_occurrence(morning).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 14, 30, 0).unwrap());

        // Past today's time rolls to tomorrow
        let evening = Utc.with_ymd_and_hms(2025, 3, 10, 20, 0, 0).unwrap();
        let next = periodicity.next_occurrence(evening).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 11, 14, 30, 0).unwrap());
    }

    #[test]
    fn test_weekly_next_occurrence() {
        // 2025-03-10 is a Monday
        let periodicity = Periodicity::Weekly {
            weekday: Weekday::Fri,
            at: at(6, 0),
        };
        let monday = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let next = periodicity.next_occurrence(monday).unwrap();
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
        assert_eq!(next.hour(), 6);

        // Same weekday, time already past -> next week
        let friday_noon = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        let next = periodicity.next_occurrence(friday_noon).unwrap();
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2025, 3, 21).unwrap());
    }

    #[test]
    fn test_interval_next_occurrence() {
        let periodicity = Periodicity::Every { minutes: 15 };
        let now = Utc::now();
        let next = periodicity.next_occurrence(now).unwrap();
        assert_eq!(next - now, Duration::minutes(15));
    }

    #[test]
    fn test_manual_never_recurs() {
        assert_eq!(Periodicity::Manual.next_occurrence(Utc::now()), None);
    }

    #[test]
    fn test_schedule_is_due() {
        let mut schedule = BackfillSchedule::new("daily-spy", "Daily SPY", Periodicity::Daily { at: at(1, 0) });
        let now = Utc::now();

        // No next time computed yet
        assert!(!schedule.is_due(now));

        schedule.next_execution_at = Some(now - Duration::minutes(5));
        assert!(schedule.is_due(now));

        schedule.enabled = false;
        assert!(!schedule.is_due(now));
    }

    #[test]
    fn test_advance_next_execution() {
        let mut schedule = BackfillSchedule::new("daily-spy", "Daily SPY", Periodicity::Daily { at: at(1, 0) });
        let now = Utc::now();
        schedule.advance_next_execution(now);
        assert!(schedule.next_execution_at.unwrap() > now);
    }

    #[test]
    fn test_schedule_serde_roundtrip() {
        let schedule = BackfillSchedule::new("daily-spy", "Daily SPY", Periodicity::Daily { at: at(1, 0) })
            .with_symbols(vec!["SPY".to_string()])
            .with_priority(ExecutionPriority::High);

        let yaml = serde_yaml::to_string(&schedule).unwrap();
        let parsed: BackfillSchedule = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.id, "daily-spy");
        assert_eq!(parsed.priority, ExecutionPriority::High);
        assert_eq!(parsed.periodicity, schedule.periodicity);
    }
}

//! Scheduler configuration

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the backfill scheduler service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the scheduler loop checks for due schedules
    #[serde(rename = "schedule-check-interval-ms", default = "default_schedule_check_interval_ms")]
    pub schedule_check_interval_ms: u64,

    /// How long the execution loop sleeps when the queue is empty
    #[serde(rename = "queue-poll-interval-ms", default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,

    /// How often a dispatch polls the job manager for completion
    #[serde(rename = "job-poll-interval-ms", default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,

    /// Upper bound on a single execution; the job is cancelled past this
    #[serde(rename = "max-execution-duration-ms", default = "default_max_execution_duration_ms")]
    pub max_execution_duration_ms: u64,

    /// Startup catch-up for occurrences missed during downtime
    #[serde(rename = "catch-up", default)]
    pub catch_up: CatchUpConfig,

    /// Symbols used when a schedule or ad-hoc request names none
    #[serde(rename = "default-symbols", default)]
    pub default_symbols: Vec<String>,

    /// Optional dispatch pause while markets are open
    #[serde(rename = "market-hours", default)]
    pub market_hours: MarketHoursConfig,
}

fn default_schedule_check_interval_ms() -> u64 {
    60_000
}

fn default_queue_poll_interval_ms() -> u64 {
    5_000
}

fn default_job_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_execution_duration_ms() -> u64 {
    6 * 60 * 60 * 1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_check_interval_ms: default_schedule_check_interval_ms(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            max_execution_duration_ms: default_max_execution_duration_ms(),
            catch_up: CatchUpConfig::default(),
            default_symbols: Vec::new(),
            market_hours: MarketHoursConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn schedule_check_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_check_interval_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn max_execution_duration(&self) -> Duration {
        Duration::from_millis(self.max_execution_duration_ms)
    }
}

/// Catch-up reconstruction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchUpConfig {
    /// Whether startup catch-up runs at all
    #[serde(default = "default_catch_up_enabled")]
    pub enabled: bool,

    /// Only occurrences at most this many days old count as missed
    #[serde(rename = "window-days", default = "default_catch_up_window_days")]
    pub window_days: u32,
}

fn default_catch_up_enabled() -> bool {
    true
}

fn default_catch_up_window_days() -> u32 {
    7
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            enabled: default_catch_up_enabled(),
            window_days: default_catch_up_window_days(),
        }
    }
}

/// Market-hours dispatch pause
///
/// When enabled, the scheduler loop skips ticks whose wall-clock time falls
/// inside `[open, close)` UTC; due schedules are picked up on the first
/// tick after the close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoursConfig {
    #[serde(rename = "pause-during-market-hours", default)]
    pub pause_enabled: bool,

    #[serde(default = "default_market_open")]
    pub open: NaiveTime,

    #[serde(default = "default_market_close")]
    pub close: NaiveTime,
}

fn default_market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(14, 30, 0).expect("valid time literal")
}

fn default_market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(21, 0, 0).expect("valid time literal")
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            pause_enabled: false,
            open: default_market_open(),
            close: default_market_close(),
        }
    }
}

impl MarketHoursConfig {
    /// Whether dispatch is paused at the given UTC wall-clock time
    pub fn paused_at(&self, time: NaiveTime) -> bool {
        if !self.pause_enabled {
            return false;
        }
        if self.open <= self.close {
            self.open <= time && time < self.close
        } else {
            // Window wraps midnight
            time >= self.open || time < self.close
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.schedule_check_interval(), Duration::from_secs(60));
        assert_eq!(config.queue_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.job_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.max_execution_duration(), Duration::from_secs(6 * 60 * 60));
        assert!(config.catch_up.enabled);
        assert_eq!(config.catch_up.window_days, 7);
        assert!(!config.market_hours.pause_enabled);
    }

    #[test]
    fn test_market_hours_disabled_never_pauses() {
        let hours = MarketHoursConfig::default();
        assert!(!hours.paused_at(t(15, 0)));
    }

    #[test]
    fn test_market_hours_window() {
        let hours = MarketHoursConfig {
            pause_enabled: true,
            open: t(14, 30),
            close: t(21, 0),
        };
        assert!(!hours.paused_at(t(14, 0)));
        assert!(hours.paused_at(t(14, 30)));
        assert!(hours.paused_at(t(17, 0)));
        assert!(!hours.paused_at(t(21, 0)));
        assert!(!hours.paused_at(t(23, 0)));
    }

    #[test]
    fn test_market_hours_wrapping_window() {
        let hours = MarketHoursConfig {
            pause_enabled: true,
            open: t(22, 0),
            close: t(2, 0),
        };
        assert!(hours.paused_at(t(23, 0)));
        assert!(hours.paused_at(t(1, 0)));
        assert!(!hours.paused_at(t(12, 0)));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let yaml = r#"
schedule-check-interval-ms: 1000
catch-up:
  window-days: 3
"#;
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.schedule_check_interval_ms, 1000);
        assert_eq!(config.catch_up.window_days, 3);
        // Unspecified fields fall back to defaults
        assert!(config.catch_up.enabled);
        assert_eq!(config.queue_poll_interval_ms, 5_000);
    }
}

//! Engine configuration structures.
//!
//! All cost-incurring features are disabled by default. Every section has
//! serde defaults so a minimal config file only names what it overrides.

use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::calendar::WeeklyCalendar;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instrument symbols to subscribe to
    #[serde(default)]
    pub instruments: Vec<String>,

    /// Vendor dataset identifier
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Vendor record schema
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Instrument class the symbols belong to
    #[serde(default = "default_instrument_class")]
    pub instrument_class: String,

    /// Ledger database URL
    #[serde(default = "default_ledger_url")]
    pub ledger_url: String,

    /// Delivered-key retention for duplicate suppression
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Event queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Reconnect backoff configuration
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Gap detection configuration
    #[serde(default)]
    pub gap: GapConfig,

    /// Backfill configuration
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Session scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Trading calendar configuration
    #[serde(default)]
    pub calendar: CalendarConfig,
}

fn default_dataset() -> String {
    "GLBX.MDP3".to_string()
}

fn default_schema() -> String {
    "mbo".to_string()
}

fn default_instrument_class() -> String {
    "futures".to_string()
}

fn default_ledger_url() -> String {
    "sqlite://feed_ledger.db?mode=rwc".to_string()
}

fn default_dedup_capacity() -> usize {
    100_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            dataset: default_dataset(),
            schema: default_schema(),
            instrument_class: default_instrument_class(),
            ledger_url: default_ledger_url(),
            dedup_capacity: default_dedup_capacity(),
            queue: QueueConfig::default(),
            backoff: BackoffConfig::default(),
            gap: GapConfig::default(),
            backfill: BackfillConfig::default(),
            scheduler: SchedulerConfig::default(),
            calendar: CalendarConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.instruments.is_empty() {
            return Err("at least one instrument is required".to_string());
        }
        if self.dedup_capacity == 0 {
            return Err("dedup_capacity must be positive".to_string());
        }

        self.queue.validate()?;
        self.backoff.validate()?;
        self.gap.validate()?;
        self.backfill.validate()?;
        self.scheduler.validate()?;
        self.calendar.build()?;

        Ok(())
    }
}

/// Bounded event queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum buffered events
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// How long a producer may wait on a full queue before dropping (ms)
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    65_536
}

fn default_enqueue_timeout() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("queue capacity must be positive".to_string());
        }
        Ok(())
    }
}

/// Exponential backoff configuration for reconnect attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay (ms)
    #[serde(default = "default_backoff_base")]
    pub base_ms: u64,

    /// Delay ceiling (ms)
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,

    /// Give up after this many consecutive failures; 0 retries forever
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_max() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base(),
            max_ms: default_backoff_max(),
            max_attempts: 0,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_ms == 0 {
            return Err("backoff base_ms must be positive".to_string());
        }
        if self.max_ms < self.base_ms {
            return Err("backoff max_ms cannot be below base_ms".to_string());
        }
        Ok(())
    }
}

/// Gap detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// Disconnect windows shorter than this are not recorded (seconds)
    #[serde(default = "default_min_gap")]
    pub min_gap_secs: u64,

    /// Assumed average event rate for the missed-event heuristic
    #[serde(default = "default_events_per_sec")]
    pub assumed_events_per_sec: f64,
}

fn default_min_gap() -> u64 {
    30
}

fn default_events_per_sec() -> f64 {
    50.0
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            min_gap_secs: default_min_gap(),
            assumed_events_per_sec: default_events_per_sec(),
        }
    }
}

impl GapConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.assumed_events_per_sec <= 0.0 {
            return Err("assumed_events_per_sec must be positive".to_string());
        }
        Ok(())
    }
}

/// Backfill configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Master switch; must be explicitly enabled
    #[serde(default)]
    pub enabled: bool,

    /// Maximum spend per UTC day (USD)
    #[serde(default = "default_max_daily_cost")]
    pub max_daily_cost: f64,

    /// Emit a warning once daily spend passes this fraction of the budget
    #[serde(default = "default_warn_fraction")]
    pub warn_at_fraction: f64,
}

fn default_max_daily_cost() -> f64 {
    50.0
}

fn default_warn_fraction() -> f64 {
    0.8
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_daily_cost: default_max_daily_cost(),
            warn_at_fraction: default_warn_fraction(),
        }
    }
}

impl BackfillConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled {
            if self.max_daily_cost <= 0.0 {
                return Err("max_daily_cost must be positive".to_string());
            }
            if !(0.0..=1.0).contains(&self.warn_at_fraction) {
                return Err("warn_at_fraction must be within [0, 1]".to_string());
            }
        }
        Ok(())
    }
}

/// Session scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Calendar poll interval (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_secs == 0 {
            return Err("poll_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Trading calendar configuration, as it appears in config files.
///
/// Parsed into a [`WeeklyCalendar`] by [`CalendarConfig::build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// IANA timezone name
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Weekday of the weekly open edge
    #[serde(default = "default_open_day")]
    pub open_day: String,

    /// Local time of the weekly open edge (HH:MM:SS)
    #[serde(default = "default_open_time")]
    pub open_time: String,

    /// Weekday of the weekly close edge
    #[serde(default = "default_close_day")]
    pub close_day: String,

    /// Local time of the weekly close edge (HH:MM:SS)
    #[serde(default = "default_close_time")]
    pub close_time: String,
}

fn default_timezone() -> String {
    "America/Chicago".to_string()
}

fn default_open_day() -> String {
    "sun".to_string()
}

fn default_open_time() -> String {
    "17:00:00".to_string()
}

fn default_close_day() -> String {
    "fri".to_string()
}

fn default_close_time() -> String {
    "16:00:00".to_string()
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            open_day: default_open_day(),
            open_time: default_open_time(),
            close_day: default_close_day(),
            close_time: default_close_time(),
        }
    }
}

impl CalendarConfig {
    /// Parse the string fields into a usable calendar.
    pub fn build(&self) -> Result<WeeklyCalendar, String> {
        let timezone =
            Tz::from_str(&self.timezone).map_err(|e| format!("invalid timezone: {e}"))?;
        let open_day = Weekday::from_str(&self.open_day)
            .map_err(|_| format!("invalid open_day: {}", self.open_day))?;
        let close_day = Weekday::from_str(&self.close_day)
            .map_err(|_| format!("invalid close_day: {}", self.close_day))?;
        let open_time = NaiveTime::parse_from_str(&self.open_time, "%H:%M:%S")
            .map_err(|e| format!("invalid open_time: {e}"))?;
        let close_time = NaiveTime::parse_from_str(&self.close_time, "%H:%M:%S")
            .map_err(|e| format!("invalid close_time: {e}"))?;

        Ok(WeeklyCalendar::new(
            timezone, open_day, open_time, close_day, close_time,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_safe() {
        let config = EngineConfig::default();
        assert!(!config.backfill.enabled);
        assert_eq!(config.queue.capacity, 65_536);
        assert_eq!(config.backoff.base_ms, 1_000);
        assert_eq!(config.backoff.max_ms, 30_000);
        assert_eq!(config.gap.min_gap_secs, 30);
        assert_eq!(config.scheduler.poll_interval_secs, 60);
    }

    #[test]
    fn validation_requires_instruments() {
        let config = EngineConfig::default();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.instruments.push("ESH5".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_validation() {
        let mut backoff = BackoffConfig::default();
        assert!(backoff.validate().is_ok());

        backoff.max_ms = 500;
        assert!(backoff.validate().is_err());

        backoff = BackoffConfig::default();
        backoff.base_ms = 0;
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn backfill_limits_checked_only_when_enabled() {
        let mut backfill = BackfillConfig::default();
        backfill.max_daily_cost = 0.0;
        assert!(backfill.validate().is_ok());

        backfill.enabled = true;
        assert!(backfill.validate().is_err());
    }

    #[test]
    fn calendar_config_builds_default_week() {
        let calendar = CalendarConfig::default().build().unwrap();
        assert_eq!(calendar.open_day, Weekday::Sun);
        assert_eq!(calendar.close_day, Weekday::Fri);
        assert_eq!(calendar.timezone, chrono_tz::America::Chicago);
    }

    #[test]
    fn calendar_config_rejects_bad_fields() {
        let mut config = CalendarConfig::default();
        config.timezone = "Mars/Olympus".to_string();
        assert!(config.build().is_err());

        let mut config = CalendarConfig::default();
        config.open_time = "25:00:00".to_string();
        assert!(config.build().is_err());
    }

    #[test]
    fn minimal_config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"instruments": ["ESH5"]}"#).unwrap();
        assert_eq!(config.instruments, vec!["ESH5".to_string()]);
        assert_eq!(config.dataset, "GLBX.MDP3");
        assert_eq!(config.schema, "mbo");
        assert_eq!(config.instrument_class, "futures");
        assert_eq!(config.dedup_capacity, 100_000);
        assert!(!config.backfill.enabled);
    }
}

//! Backfill request types and the cost model.
//!
//! A backfill request is created when a qualifying gap fits inside the
//! remaining daily budget. Status transitions are monotonic; `Completed`
//! and `Failed` are terminal and never retried automatically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCategory, ErrorClassification};
use crate::gap::Gap;

/// Status of a backfill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    /// Request created, not yet started
    Pending,
    /// Historical fetch in progress
    InProgress,
    /// Fetch finished and recovered events were delivered
    Completed,
    /// Fetch failed; not retried
    Failed,
}

impl BackfillStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BackfillStatus::Completed | BackfillStatus::Failed)
    }

    /// Whether `self → next` is a legal (monotonic) transition.
    pub fn can_transition_to(self, next: BackfillStatus) -> bool {
        use BackfillStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Completed) | (InProgress, Failed)
        )
    }
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackfillStatus::Pending => write!(f, "pending"),
            BackfillStatus::InProgress => write!(f, "in_progress"),
            BackfillStatus::Completed => write!(f, "completed"),
            BackfillStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for BackfillStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackfillStatus::Pending),
            "in_progress" => Ok(BackfillStatus::InProgress),
            "completed" => Ok(BackfillStatus::Completed),
            "failed" => Ok(BackfillStatus::Failed),
            other => Err(format!("unknown backfill status: {other}")),
        }
    }
}

/// A request to recover the events missed during a gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRequest {
    /// Unique request id
    pub id: Uuid,
    /// Gap this request recovers
    pub gap_id: Uuid,
    /// Start of the recovery range (inclusive)
    pub start: DateTime<Utc>,
    /// End of the recovery range (inclusive)
    pub end: DateTime<Utc>,
    /// Instruments to recover
    pub instruments: Vec<String>,
    /// Current status
    pub status: BackfillStatus,
    /// Estimated cost in USD, computed before execution
    pub cost_estimate: f64,
    /// Actual cost in USD, known once completed
    pub actual_cost: Option<f64>,
    /// Events delivered to consumers from this request
    pub events_recovered: u64,
    /// Error message when failed
    pub error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl BackfillRequest {
    /// Create a pending request covering a gap's recovery range.
    pub fn for_gap(gap: &Gap, instruments: Vec<String>, cost_estimate: f64) -> Self {
        let (start, end) = gap.recovery_range();
        Self {
            id: Uuid::new_v4(),
            gap_id: gap.id,
            start,
            end,
            instruments,
            status: BackfillStatus::Pending,
            cost_estimate,
            actual_cost: None,
            events_recovered: 0,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Pricing for historical recovery, as vendor clients quote it.
///
/// Estimate = range duration in hours times the per-hour rate, plus a flat
/// per-request fee.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostModel {
    /// USD per hour of recovered range
    pub per_hour_rate: f64,
    /// Flat USD fee charged per request
    pub flat_request_fee: f64,
}

impl CostModel {
    pub fn new(per_hour_rate: f64, flat_request_fee: f64) -> Self {
        Self {
            per_hour_rate,
            flat_request_fee,
        }
    }

    /// Estimate the cost of recovering `[start, end]`.
    pub fn estimate(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        let hours = (end - start).num_milliseconds().max(0) as f64 / 3_600_000.0;
        hours * self.per_hour_rate + self.flat_request_fee
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            per_hour_rate: 0.50,
            flat_request_fee: 0.01,
        }
    }
}

/// Backfill failure modes.
#[derive(Error, Debug)]
pub enum BackfillError {
    /// Estimate would push the day over the configured budget
    #[error("budget exceeded: estimate ${estimate:.2} with ${remaining:.2} remaining today")]
    BudgetExceeded { estimate: f64, remaining: f64 },

    /// Another recovery job is already in flight
    #[error("a backfill job is already in flight")]
    Busy,

    /// Historical fetch failed
    #[error("historical fetch failed: {0}")]
    Fetch(String),

    /// Ledger failure
    #[error("ledger error: {0}")]
    Ledger(String),
}

impl ErrorClassification for BackfillError {
    fn category(&self) -> ErrorCategory {
        match self {
            BackfillError::BudgetExceeded { .. } => ErrorCategory::ResourceExhausted,
            BackfillError::Busy => ErrorCategory::ResourceExhausted,
            BackfillError::Fetch(_) => ErrorCategory::Transient,
            BackfillError::Ledger(_) => ErrorCategory::Internal,
        }
    }
}

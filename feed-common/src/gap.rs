//! Gap records.
//!
//! A gap is the window between a detected disconnect and the subsequent
//! successful reconnect, during which live events may have been missed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A data loss window observed on the live connection.
///
/// Created exactly once per disconnect→reconnect transition. Immutable after
/// creation except for `backfill_required`, which may be flipped to false if
/// the daily budget cannot cover recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    /// Unique gap id
    pub id: Uuid,
    /// When the disconnect was detected
    pub disconnect_time: DateTime<Utc>,
    /// When the connection was re-established
    pub reconnect_time: DateTime<Utc>,
    /// Timestamp of the last event seen before the disconnect, if any
    pub last_event_time: Option<DateTime<Utc>>,
    /// Heuristic count of events missed during the gap
    pub estimated_missed_events: u64,
    /// Whether this gap qualifies for backfill recovery
    pub backfill_required: bool,
}

impl Gap {
    /// Materialize a gap from a disconnect→reconnect pair.
    ///
    /// `assumed_events_per_sec` drives the missed-event heuristic:
    /// `duration × assumed average rate`.
    pub fn new(
        disconnect_time: DateTime<Utc>,
        reconnect_time: DateTime<Utc>,
        last_event_time: Option<DateTime<Utc>>,
        assumed_events_per_sec: f64,
        backfill_required: bool,
    ) -> Self {
        let duration_secs = (reconnect_time - disconnect_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let estimated_missed_events = (duration_secs * assumed_events_per_sec) as u64;

        Self {
            id: Uuid::new_v4(),
            disconnect_time,
            reconnect_time,
            last_event_time,
            estimated_missed_events,
            backfill_required,
        }
    }

    /// Gap duration: reconnect − disconnect.
    pub fn duration(&self) -> Duration {
        self.reconnect_time - self.disconnect_time
    }

    /// Time range a backfill must cover: `[last_event_time, disconnect_time]`.
    ///
    /// Falls back to the disconnect time when no event was ever seen
    /// (empty range, nothing to recover).
    pub fn recovery_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.last_event_time.unwrap_or(self.disconnect_time),
            self.disconnect_time,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn duration_and_estimate() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let gap = Gap::new(t0, t0 + Duration::seconds(60), Some(t0), 50.0, true);

        assert_eq!(gap.duration(), Duration::seconds(60));
        assert_eq!(gap.estimated_missed_events, 3000);
        assert!(gap.backfill_required);
    }

    #[test]
    fn recovery_range_uses_last_event_time() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let disconnect = t0 + Duration::seconds(45);
        let reconnect = t0 + Duration::seconds(50);
        let gap = Gap::new(disconnect, reconnect, Some(t0), 50.0, true);

        assert_eq!(gap.recovery_range(), (t0, disconnect));
    }

    #[test]
    fn recovery_range_without_prior_event_is_empty() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let gap = Gap::new(t0, t0 + Duration::seconds(40), None, 50.0, true);

        let (start, end) = gap.recovery_range();
        assert_eq!(start, end);
    }
}

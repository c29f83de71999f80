//! Disconnect/reconnect bookkeeping.
//!
//! The connection manager reports disconnects and reconnects here; the
//! tracker turns each disconnect→reconnect pair into exactly one gap record.
//! Windows shorter than the configured minimum are still persisted, but with
//! `backfill_required = false`: reconnects that fast are covered by the
//! vendor's own session replay, so no recovery is requested for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use feed_common::clock::Clock;
use feed_common::config::GapConfig;
use feed_common::gap::Gap;

use crate::ledger::{Ledger, LedgerResult};

/// Tracks data loss windows on the live connection.
pub struct GapTracker {
    min_gap: Duration,
    assumed_events_per_sec: f64,
    clock: Arc<dyn Clock>,
    ledger: Ledger,
    last_event_time: RwLock<Option<DateTime<Utc>>>,
    disconnected_at: RwLock<Option<DateTime<Utc>>>,
    gaps_recorded: AtomicU64,
    gaps_below_threshold: AtomicU64,
}

impl GapTracker {
    pub fn new(config: &GapConfig, clock: Arc<dyn Clock>, ledger: Ledger) -> Self {
        Self {
            min_gap: Duration::seconds(config.min_gap_secs as i64),
            assumed_events_per_sec: config.assumed_events_per_sec,
            clock,
            ledger,
            last_event_time: RwLock::new(None),
            disconnected_at: RwLock::new(None),
            gaps_recorded: AtomicU64::new(0),
            gaps_below_threshold: AtomicU64::new(0),
        }
    }

    /// Record the exchange timestamp of a delivered live event.
    pub fn record_event_time(&self, ts_event: DateTime<Utc>) {
        *self.last_event_time.write() = Some(ts_event);
    }

    /// Mark the connection as lost. Idempotent until the next reconnect.
    pub fn on_disconnect(&self) {
        let mut disconnected_at = self.disconnected_at.write();
        if disconnected_at.is_none() {
            let now = self.clock.now();
            debug!(at = %now, "disconnect observed");
            *disconnected_at = Some(now);
        }
    }

    /// Mark the connection as re-established.
    ///
    /// Every disconnect→reconnect pair persists exactly one gap. The gap is
    /// returned only when the outage is long enough to qualify for backfill;
    /// shorter outages are stored with `backfill_required = false`.
    pub async fn on_reconnect(&self) -> LedgerResult<Option<Gap>> {
        let disconnected_at = match self.disconnected_at.write().take() {
            Some(at) => at,
            None => return Ok(None),
        };

        let now = self.clock.now();
        let outage = now - disconnected_at;
        let qualifies = outage >= self.min_gap;

        let last_event = *self.last_event_time.read();
        let gap = Gap::new(
            disconnected_at,
            now,
            last_event,
            self.assumed_events_per_sec,
            qualifies,
        );
        self.ledger.record_gap(&gap).await?;
        self.gaps_recorded.fetch_add(1, Ordering::Relaxed);

        if !qualifies {
            self.gaps_below_threshold.fetch_add(1, Ordering::Relaxed);
            debug!(
                gap_id = %gap.id,
                outage_secs = outage.num_seconds(),
                "outage below backfill threshold, recorded without recovery"
            );
            return Ok(None);
        }

        info!(
            gap_id = %gap.id,
            outage_secs = outage.num_seconds(),
            estimated_missed = gap.estimated_missed_events,
            "gap recorded"
        );
        Ok(Some(gap))
    }

    /// Whether a disconnect is currently outstanding.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected_at.read().is_some()
    }

    pub fn gaps_recorded(&self) -> u64 {
        self.gaps_recorded.load(Ordering::Relaxed)
    }

    /// Gaps persisted without qualifying for backfill.
    pub fn gaps_below_threshold(&self) -> u64 {
        self.gaps_below_threshold.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_common::clock::ManualClock;

    async fn tracker_with_clock(min_gap_secs: u64) -> (GapTracker, Arc<ManualClock>, Ledger) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Ledger::in_memory().await.unwrap();
        let config = GapConfig {
            min_gap_secs,
            assumed_events_per_sec: 50.0,
        };
        (
            GapTracker::new(&config, clock.clone(), ledger.clone()),
            clock,
            ledger,
        )
    }

    #[tokio::test]
    async fn long_outage_records_one_gap() {
        let (tracker, clock, ledger) = tracker_with_clock(30).await;
        let t0 = clock.now();
        tracker.record_event_time(t0);

        tracker.on_disconnect();
        clock.advance(Duration::seconds(45));
        let gap = tracker.on_reconnect().await.unwrap().unwrap();

        assert_eq!(gap.disconnect_time, t0);
        assert_eq!(gap.duration(), Duration::seconds(45));
        assert_eq!(gap.last_event_time, Some(t0));
        assert_eq!(tracker.gaps_recorded(), 1);
        assert_eq!(ledger.gap_count().await.unwrap(), 1);

        // A second reconnect without a new disconnect produces nothing
        assert!(tracker.on_reconnect().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_outage_is_stored_without_backfill() {
        let (tracker, clock, ledger) = tracker_with_clock(30).await;

        tracker.on_disconnect();
        clock.advance(Duration::seconds(10));
        // Below the threshold: nothing to recover, but the loss is on record
        assert!(tracker.on_reconnect().await.unwrap().is_none());

        assert_eq!(tracker.gaps_below_threshold(), 1);
        assert_eq!(tracker.gaps_recorded(), 1);
        assert_eq!(ledger.gap_count().await.unwrap(), 1);
        let stored = &ledger.recent_gaps(1).await.unwrap()[0];
        assert!(!stored.backfill_required);
        assert_eq!(stored.duration(), Duration::seconds(10));
    }

    #[tokio::test]
    async fn repeated_disconnect_keeps_first_timestamp() {
        let (tracker, clock, _ledger) = tracker_with_clock(30).await;
        let t0 = clock.now();

        tracker.on_disconnect();
        clock.advance(Duration::seconds(20));
        tracker.on_disconnect(); // reconnect attempt failed, still down
        clock.advance(Duration::seconds(20));

        let gap = tracker.on_reconnect().await.unwrap().unwrap();
        assert_eq!(gap.disconnect_time, t0);
        assert_eq!(gap.duration(), Duration::seconds(40));
    }
}

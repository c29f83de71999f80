//! Budget-checked recovery of recorded gaps.
//!
//! The coordinator receives gaps from the connection manager, prices each
//! recovery against the daily budget, and runs at most one historical fetch
//! at a time. Recovered events go through the same dispatcher as live ones,
//! so duplicate suppression applies uniformly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use feed_common::backfill::{BackfillError, BackfillRequest};
use feed_common::clock::Clock;
use feed_common::config::BackfillConfig;
use feed_common::events::Provenance;
use feed_common::gap::Gap;

use crate::dispatch::Dispatcher;
use crate::ledger::{Ledger, LedgerError};
use crate::vendor::{HistoricalFeed, Subscription};

impl From<LedgerError> for BackfillError {
    fn from(err: LedgerError) -> Self {
        BackfillError::Ledger(err.to_string())
    }
}

/// Counters for the stats surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillStats {
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub rejected_budget: u64,
    pub rejected_busy: u64,
    pub skipped: u64,
    pub events_recovered: u64,
}

#[derive(Default)]
struct Counters {
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    rejected_budget: AtomicU64,
    rejected_busy: AtomicU64,
    skipped: AtomicU64,
    events_recovered: AtomicU64,
}

/// Coordinates gap recovery through the historical feed.
pub struct BackfillCoordinator {
    historical: Arc<dyn HistoricalFeed>,
    subscription: Subscription,
    config: BackfillConfig,
    clock: Arc<dyn Clock>,
    ledger: Ledger,
    dispatcher: Arc<Dispatcher>,
    in_flight: Semaphore,
    counters: Counters,
    warned_on: Mutex<Option<NaiveDate>>,
}

impl BackfillCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        historical: Arc<dyn HistoricalFeed>,
        subscription: Subscription,
        config: BackfillConfig,
        clock: Arc<dyn Clock>,
        ledger: Ledger,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            historical,
            subscription,
            config,
            clock,
            ledger,
            dispatcher,
            in_flight: Semaphore::new(1),
            counters: Counters::default(),
            warned_on: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> BackfillStats {
        BackfillStats {
            requests_completed: self.counters.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.counters.requests_failed.load(Ordering::Relaxed),
            rejected_budget: self.counters.rejected_budget.load(Ordering::Relaxed),
            rejected_busy: self.counters.rejected_busy.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            events_recovered: self.counters.events_recovered.load(Ordering::Relaxed),
        }
    }

    /// Recover one gap end to end.
    ///
    /// Returns the final request record, or `None` when the gap was skipped
    /// (backfill disabled, empty recovery range, or already requested).
    pub async fn handle_gap(&self, gap: &Gap) -> Result<Option<BackfillRequest>, BackfillError> {
        if !self.config.enabled {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            info!(gap_id = %gap.id, "backfill disabled, gap recorded only");
            return Ok(None);
        }

        // One request per gap, even across restarts
        if self.ledger.request_exists_for_gap(gap.id).await? {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            info!(gap_id = %gap.id, "gap already has a backfill request");
            return Ok(None);
        }

        let (start, end) = gap.recovery_range();
        if start >= end {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            self.ledger.set_gap_backfill_required(gap.id, false).await?;
            info!(gap_id = %gap.id, "empty recovery range, nothing to backfill");
            return Ok(None);
        }

        let estimate = match self
            .historical
            .estimate_cost(&self.subscription, start, end)
            .await
        {
            Ok(estimate) => estimate,
            Err(err) => {
                // Gap stays backfill_required so it can be resubmitted
                error!(gap_id = %gap.id, error = %err, "cost estimation failed");
                return Err(BackfillError::Fetch(err.to_string()));
            }
        };
        let day = self.clock.now().date_naive();
        let spent = self.ledger.spent_on(day).await?;
        let remaining = self.config.max_daily_cost - spent;
        if estimate > remaining {
            self.counters.rejected_budget.fetch_add(1, Ordering::Relaxed);
            self.ledger.set_gap_backfill_required(gap.id, false).await?;
            warn!(
                gap_id = %gap.id,
                estimate,
                remaining,
                "backfill rejected, daily budget would be exceeded"
            );
            return Err(BackfillError::BudgetExceeded { estimate, remaining });
        }

        let _permit = match self.in_flight.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.rejected_busy.fetch_add(1, Ordering::Relaxed);
                warn!(gap_id = %gap.id, "backfill rejected, a job is already in flight");
                return Err(BackfillError::Busy);
            }
        };

        let mut request =
            BackfillRequest::for_gap(gap, self.subscription.instruments.clone(), estimate);
        self.ledger.insert_request(&request).await?;
        self.ledger.mark_request_in_progress(request.id).await?;
        info!(
            request_id = %request.id,
            gap_id = %gap.id,
            start = %start,
            end = %end,
            estimate,
            "backfill started"
        );

        let events = match self
            .historical
            .fetch_range(&self.subscription, start, end)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
                self.ledger.fail_request(request.id, &err.to_string()).await?;
                error!(request_id = %request.id, error = %err, "backfill fetch failed");
                return Err(BackfillError::Fetch(err.to_string()));
            }
        };

        let fetched = events.len();
        let mut recovered = 0u64;
        for raw in events {
            let event = raw.into_market_event(self.clock.now(), Provenance::Backfill);
            if self.dispatcher.deliver(event).await {
                recovered += 1;
            }
        }

        // Spend posts only for executed fetches; the estimate is billed as-is
        let total = self.ledger.add_spent(day, estimate).await?;
        self.warn_if_near_budget(day, total);

        self.ledger
            .complete_request(request.id, estimate, recovered)
            .await?;
        self.counters.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .events_recovered
            .fetch_add(recovered, Ordering::Relaxed);
        info!(
            request_id = %request.id,
            fetched,
            recovered,
            suppressed = fetched as u64 - recovered,
            cost = estimate,
            spent_today = total,
            "backfill completed"
        );

        request.status = feed_common::backfill::BackfillStatus::Completed;
        request.actual_cost = Some(estimate);
        request.events_recovered = recovered;
        Ok(Some(request))
    }

    fn warn_if_near_budget(&self, day: NaiveDate, total: f64) {
        if total < self.config.max_daily_cost * self.config.warn_at_fraction {
            return;
        }
        let mut warned_on = self.warned_on.lock();
        if *warned_on != Some(day) {
            *warned_on = Some(day);
            warn!(
                spent = total,
                budget = self.config.max_daily_cost,
                "daily backfill spend nearing budget"
            );
        }
    }

    /// Coordinator loop: recovers gaps as the connection manager reports
    /// them, one at a time.
    pub async fn run(
        self: Arc<Self>,
        mut gap_rx: mpsc::UnboundedReceiver<Gap>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                gap = gap_rx.recv() => match gap {
                    Some(gap) => {
                        // Budget and fetch failures are already logged and
                        // persisted; the loop keeps going either way
                        let _ = self.handle_gap(&gap).await;
                    }
                    None => break,
                },
            }
        }
    }
}

//! Composition root.
//!
//! `FeedEngine::start` validates config, bootstraps state from the ledger,
//! and spawns the four long-lived tasks: session scheduler, connection
//! manager, delivery loop, and backfill coordinator. `shutdown` stops them
//! and flushes the delivered-key buffer.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use feed_common::backfill::{BackfillError, BackfillRequest};
use feed_common::clock::Clock;
use feed_common::config::EngineConfig;
use feed_common::gap::Gap;

use crate::backfill::{BackfillCoordinator, BackfillStats};
use crate::connection::{ConnectionManager, ConnectionShared, ConnectionStats};
use crate::dispatch::{Dispatcher, FeedObserver};
use crate::gap_tracker::GapTracker;
use crate::ledger::{Ledger, LedgerError};
use crate::queue::{EventQueue, EventSender};
use crate::scheduler::SessionScheduler;
use crate::vendor::{HistoricalFeed, LiveFeed, Subscription};

/// Startup failure modes.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStats {
    pub connection: ConnectionStats,
    pub backfill: BackfillStats,
    pub gaps_recorded: u64,
    pub gaps_below_threshold: u64,
    pub queue_depth: usize,
    pub queue_dropped: u64,
    pub events_delivered: u64,
    pub duplicates_suppressed: u64,
    pub spent_today: f64,
    pub uptime_secs: u64,
    pub events_per_sec: f64,
}

/// The running engine.
pub struct FeedEngine {
    clock: Arc<dyn Clock>,
    started_at: chrono::DateTime<chrono::Utc>,
    ledger: Ledger,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<BackfillCoordinator>,
    connection: Arc<ConnectionShared>,
    gap_tracker: Arc<GapTracker>,
    sender: EventSender,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl FeedEngine {
    /// Start the engine, connecting the ledger from config.
    pub async fn start(
        config: EngineConfig,
        live: Arc<dyn LiveFeed>,
        historical: Arc<dyn HistoricalFeed>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        let ledger = Ledger::connect(&config.ledger_url).await?;
        Self::start_with(config, live, historical, clock, ledger).await
    }

    /// Start the engine on an already-connected ledger.
    pub async fn start_with(
        config: EngineConfig,
        live: Arc<dyn LiveFeed>,
        historical: Arc<dyn HistoricalFeed>,
        clock: Arc<dyn Clock>,
        ledger: Ledger,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        let calendar = config.calendar.build().map_err(EngineError::Config)?;

        // A request caught mid-flight by a crash is failed, never resumed;
        // its gap keeps the record of what was lost
        for request in ledger.open_requests().await? {
            warn!(request_id = %request.id, "failing backfill request interrupted by restart");
            ledger
                .fail_request(request.id, "interrupted by restart")
                .await?;
        }

        let dispatcher = Arc::new(Dispatcher::new(config.dedup_capacity, ledger.clone()));
        let seed_limit = config.dedup_capacity.min(u32::MAX as usize) as u32;
        let seeded = ledger.recent_keys(seed_limit).await?;
        if !seeded.is_empty() {
            info!(keys = seeded.len(), "re-seeding duplicate suppression from ledger");
            dispatcher.seed_keys(&seeded);
        }

        let (sender, receiver) = EventQueue::bounded(&config.queue);
        let (session_tx, session_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gap_tx, gap_rx) = mpsc::unbounded_channel::<Gap>();

        let gap_tracker = Arc::new(GapTracker::new(&config.gap, clock.clone(), ledger.clone()));

        let subscription = Subscription {
            dataset: config.dataset.clone(),
            schema: config.schema.clone(),
            instrument_class: config.instrument_class.clone(),
            instruments: config.instruments.clone(),
        };

        let coordinator = Arc::new(BackfillCoordinator::new(
            historical,
            subscription.clone(),
            config.backfill.clone(),
            clock.clone(),
            ledger.clone(),
            dispatcher.clone(),
        ));

        let manager = ConnectionManager::new(
            live,
            subscription,
            config.backoff.clone(),
            clock.clone(),
            gap_tracker.clone(),
            sender.clone(),
            dispatcher.clone(),
            gap_tx,
            session_rx,
            shutdown_rx.clone(),
        );
        let connection = manager.shared();

        let scheduler = SessionScheduler::new(calendar, &config.scheduler, clock.clone(), session_tx);

        let tasks = vec![
            tokio::spawn(scheduler.run(shutdown_rx.clone())),
            tokio::spawn(manager.run()),
            tokio::spawn(dispatcher.clone().run(receiver, shutdown_rx.clone())),
            tokio::spawn(coordinator.clone().run(gap_rx, shutdown_rx)),
        ];

        info!(
            instruments = ?config.instruments,
            dataset = config.dataset,
            backfill_enabled = config.backfill.enabled,
            "feed engine started"
        );

        Ok(Self {
            started_at: clock.now(),
            clock,
            ledger,
            dispatcher,
            coordinator,
            connection,
            gap_tracker,
            sender,
            shutdown_tx,
            tasks,
        })
    }

    /// Register a consumer. Events delivered before registration are not
    /// replayed.
    pub fn subscribe(&self, observer: Arc<dyn FeedObserver>) {
        self.dispatcher.subscribe(observer);
    }

    /// Manually resubmit a recorded gap for recovery.
    pub async fn recover_gap(&self, gap: &Gap) -> Result<Option<BackfillRequest>, BackfillError> {
        self.coordinator.handle_gap(gap).await
    }

    pub async fn stats(&self) -> Result<FeedStats, LedgerError> {
        let now = self.clock.now();
        let day = now.date_naive();
        let uptime_secs = (now - self.started_at).num_seconds().max(0) as u64;
        let events_delivered = self.dispatcher.delivered();
        let events_per_sec = if uptime_secs > 0 {
            events_delivered as f64 / uptime_secs as f64
        } else {
            0.0
        };
        Ok(FeedStats {
            connection: self.connection.snapshot(),
            backfill: self.coordinator.stats(),
            gaps_recorded: self.gap_tracker.gaps_recorded(),
            gaps_below_threshold: self.gap_tracker.gaps_below_threshold(),
            queue_depth: self.sender.depth(),
            queue_dropped: self.sender.dropped(),
            events_delivered,
            duplicates_suppressed: self.dispatcher.duplicates_suppressed(),
            spent_today: self.ledger.spent_on(day).await?,
            uptime_secs,
            events_per_sec,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Stop all tasks and flush pending ledger writes.
    pub async fn shutdown(self) {
        info!("feed engine shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        if let Err(err) = self.dispatcher.flush_keys().await {
            warn!(error = %err, "failed to flush delivered keys at shutdown");
        }
        info!("feed engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use feed_common::backfill::BackfillStatus;
    use feed_common::clock::ManualClock;
    use feed_common::gap::Gap;

    use crate::vendor::MockVendor;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.instruments.push("ESH5".to_string());
        config
    }

    #[tokio::test]
    async fn interrupted_requests_fail_on_start() {
        let ledger = Ledger::in_memory().await.unwrap();
        let t0 = Utc::now();
        let gap = Gap::new(t0, t0 + chrono::Duration::seconds(60), Some(t0), 50.0, true);
        ledger.record_gap(&gap).await.unwrap();
        let request = BackfillRequest::for_gap(&gap, vec!["ESH5".to_string()], 0.5);
        ledger.insert_request(&request).await.unwrap();
        ledger.mark_request_in_progress(request.id).await.unwrap();

        let vendor = MockVendor::new();
        let engine = FeedEngine::start_with(
            test_config(),
            Arc::new(vendor.clone()),
            Arc::new(vendor),
            Arc::new(ManualClock::new(t0)),
            ledger.clone(),
        )
        .await
        .unwrap();

        let loaded = ledger.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BackfillStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("interrupted by restart"));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let vendor = MockVendor::new();
        let result = FeedEngine::start_with(
            EngineConfig::default(), // no instruments
            Arc::new(vendor.clone()),
            Arc::new(vendor),
            Arc::new(ManualClock::new(Utc::now())),
            Ledger::in_memory().await.unwrap(),
        )
        .await;

        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}

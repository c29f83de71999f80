//! Connection state machine and reconnect loop.
//!
//! One task owns the vendor session. While the trading session is open it
//! keeps the connection alive: connect, subscribe, drain the stream, and on
//! loss retry with exponential backoff. Scheduled session closes tear the
//! connection down without recording a gap; only unplanned losses do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use feed_common::clock::Clock;
use feed_common::config::BackoffConfig;
use feed_common::error::ErrorClassification;
use feed_common::events::{ConnectionState, Provenance};
use feed_common::gap::Gap;

use crate::dispatch::Dispatcher;
use crate::gap_tracker::GapTracker;
use crate::queue::EventSender;
use crate::vendor::{LiveFeed, Subscription, VendorError};

/// Exponential backoff schedule for reconnect attempts.
///
/// Attempt n waits `min(base * 2^(n-1), max)`. A successful connection
/// resets the schedule.
pub struct BackoffState {
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
    attempt: u32,
}

impl BackoffState {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_ms,
            max_ms: config.max_ms,
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<std::time::Duration> {
        if self.max_attempts != 0 && self.attempt >= self.max_attempts {
            return None;
        }

        let shift = self.attempt.min(32);
        let delay = self
            .base_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_ms);
        self.attempt += 1;
        Some(std::time::Duration::from_millis(delay))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Why the receive loop returned.
enum StreamEnd {
    /// Session close or shutdown was requested; not a data loss
    Stopped,
    /// The stream dropped out from under us
    Lost(VendorError),
    /// Unrecoverable (configuration) error; stop retrying
    Fatal(VendorError),
}

/// Counters shared with the stats surface.
#[derive(Default)]
pub struct ConnectionShared {
    state: RwLock<ConnectionState>,
    events_received: AtomicU64,
    malformed_skipped: AtomicU64,
    sessions_established: AtomicU64,
    failed_attempts: AtomicU64,
}

impl ConnectionShared {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            events_received: self.events_received.load(Ordering::Relaxed),
            malformed_skipped: self.malformed_skipped.load(Ordering::Relaxed),
            sessions_established: self.sessions_established.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub events_received: u64,
    pub malformed_skipped: u64,
    pub sessions_established: u64,
    pub failed_attempts: u64,
}

/// Owns the live vendor session for the lifetime of the engine.
pub struct ConnectionManager {
    feed: Arc<dyn LiveFeed>,
    subscription: Subscription,
    backoff_config: BackoffConfig,
    clock: Arc<dyn Clock>,
    gap_tracker: Arc<GapTracker>,
    sender: EventSender,
    dispatcher: Arc<Dispatcher>,
    gap_tx: mpsc::UnboundedSender<Gap>,
    session_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feed: Arc<dyn LiveFeed>,
        subscription: Subscription,
        backoff_config: BackoffConfig,
        clock: Arc<dyn Clock>,
        gap_tracker: Arc<GapTracker>,
        sender: EventSender,
        dispatcher: Arc<Dispatcher>,
        gap_tx: mpsc::UnboundedSender<Gap>,
        session_rx: watch::Receiver<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            feed,
            subscription,
            backoff_config,
            clock,
            gap_tracker,
            sender,
            dispatcher,
            gap_tx,
            session_rx,
            shutdown_rx,
            shared: Arc::new(ConnectionShared::default()),
        }
    }

    /// Stats handle for the engine.
    pub fn shared(&self) -> Arc<ConnectionShared> {
        self.shared.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.shared.state.write();
            if *current != state {
                info!(from = %*current, to = %state, "connection state");
                *current = state;
                true
            } else {
                false
            }
        };
        if changed {
            self.dispatcher.notify_status(state);
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn session_open(&self) -> bool {
        *self.session_rx.borrow()
    }

    /// Main loop. Runs until shutdown or a fatal vendor error.
    pub async fn run(mut self) {
        let mut backoff = BackoffState::new(&self.backoff_config);

        loop {
            if self.shutting_down() {
                break;
            }

            if !self.session_open() {
                self.set_state(ConnectionState::Disconnected);
                let mut session_rx = self.session_rx.clone();
                let mut shutdown_rx = self.shutdown_rx.clone();
                tokio::select! {
                    _ = session_rx.changed() => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            self.set_state(ConnectionState::Connecting);
            match self.establish().await {
                Ok(()) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    self.shared
                        .sessions_established
                        .fetch_add(1, Ordering::Relaxed);
                    self.report_reconnect().await;

                    match self.receive_loop().await {
                        StreamEnd::Stopped => {
                            debug!("session stop requested, closing connection");
                            self.feed.close().await;
                            self.set_state(ConnectionState::Disconnected);
                        }
                        StreamEnd::Lost(err) => {
                            warn!(error = %err, "live stream lost");
                            self.dispatcher.notify_error(&err.to_string());
                            self.feed.close().await;
                            self.set_state(ConnectionState::Disconnected);
                            self.gap_tracker.on_disconnect();
                        }
                        StreamEnd::Fatal(err) => {
                            error!(error = %err, "fatal vendor error, stopping connection manager");
                            self.dispatcher.notify_error(&err.to_string());
                            self.feed.close().await;
                            break;
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "fatal connect error, stopping connection manager");
                    break;
                }
                Err(err) => {
                    self.shared.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                error = %err,
                                attempt = backoff.attempt(),
                                delay_ms = delay.as_millis() as u64,
                                "connect failed, retrying"
                            );
                            let mut shutdown_rx = self.shutdown_rx.clone();
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown_rx.changed() => {}
                            }
                        }
                        None => {
                            error!(error = %err, "reconnect attempts exhausted");
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn establish(&self) -> Result<(), VendorError> {
        self.feed.connect().await?;
        self.feed.subscribe(&self.subscription).await?;
        Ok(())
    }

    /// Close the open disconnect window, forwarding any resulting gap to the
    /// backfill coordinator.
    async fn report_reconnect(&self) {
        match self.gap_tracker.on_reconnect().await {
            Ok(Some(gap)) => {
                if self.gap_tx.send(gap).is_err() {
                    warn!("backfill coordinator gone, gap recorded but not dispatched");
                }
            }
            Ok(None) => {}
            Err(err) => error!(error = %err, "failed to persist gap"),
        }
    }

    async fn receive_loop(&self) -> StreamEnd {
        let mut session_rx = self.session_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            // An edge published while `establish` was in flight is already
            // the current value and will never fire `changed`
            if *shutdown_rx.borrow() || !*session_rx.borrow() {
                return StreamEnd::Stopped;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return StreamEnd::Stopped;
                    }
                }
                _ = session_rx.changed() => {
                    if !*session_rx.borrow() {
                        return StreamEnd::Stopped;
                    }
                }
                result = self.feed.next_event() => match result {
                    Ok(Some(raw)) => {
                        self.shared.events_received.fetch_add(1, Ordering::Relaxed);
                        self.gap_tracker.record_event_time(raw.ts_event);
                        let event = raw.into_market_event(self.clock.now(), Provenance::Live);
                        self.sender.push(event).await;
                    }
                    Ok(None) => {
                        return StreamEnd::Lost(VendorError::Connection(
                            "stream ended by vendor".to_string(),
                        ));
                    }
                    Err(VendorError::Malformed(detail)) => {
                        // Bad records are skipped, not fatal to the stream
                        self.shared.malformed_skipped.fetch_add(1, Ordering::Relaxed);
                        warn!(detail, "skipping malformed record");
                    }
                    Err(err) if err.is_fatal() => return StreamEnd::Fatal(err),
                    Err(err) => return StreamEnd::Lost(err),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use feed_common::clock::ManualClock;
    use feed_common::config::{GapConfig, QueueConfig};
    use feed_common::events::EventKey;

    use crate::ledger::Ledger;
    use crate::queue::{EventQueue, EventReceiver};
    use crate::vendor::{MockVendor, RawEvent};

    #[test]
    fn backoff_doubles_and_caps() {
        let config = BackoffConfig {
            base_ms: 1_000,
            max_ms: 10_000,
            max_attempts: 0,
        };
        let mut backoff = BackoffState::new(&config);

        assert_eq!(backoff.next_delay().unwrap().as_millis(), 1_000);
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 2_000);
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 4_000);
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 8_000);
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 10_000);
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 10_000);

        backoff.reset();
        assert_eq!(backoff.next_delay().unwrap().as_millis(), 1_000);
    }

    #[test]
    fn backoff_exhausts_after_max_attempts() {
        let config = BackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
            max_attempts: 2,
        };
        let mut backoff = BackoffState::new(&config);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }

    struct Fixture {
        vendor: MockVendor,
        clock: Arc<ManualClock>,
        gap_tracker: Arc<GapTracker>,
        receiver: EventReceiver,
        gap_rx: mpsc::UnboundedReceiver<Gap>,
        session_tx: watch::Sender<bool>,
        shutdown_tx: watch::Sender<bool>,
        shared: Arc<ConnectionShared>,
    }

    async fn spawn_manager(backoff: BackoffConfig) -> Fixture {
        let vendor = MockVendor::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Ledger::in_memory().await.unwrap();
        let gap_config = GapConfig {
            min_gap_secs: 30,
            assumed_events_per_sec: 50.0,
        };
        let gap_tracker = Arc::new(GapTracker::new(&gap_config, clock.clone(), ledger.clone()));
        let dispatcher = Arc::new(Dispatcher::new(1_000, ledger));

        let (sender, receiver) = EventQueue::bounded(&QueueConfig {
            capacity: 64,
            enqueue_timeout_ms: 0,
        });
        let (gap_tx, gap_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = watch::channel(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = ConnectionManager::new(
            Arc::new(vendor.clone()),
            Subscription {
                dataset: "TEST".to_string(),
                schema: "mbo".to_string(),
                instrument_class: "futures".to_string(),
                instruments: vec!["ESH5".to_string()],
            },
            backoff,
            clock.clone(),
            gap_tracker.clone(),
            sender,
            dispatcher,
            gap_tx,
            session_rx,
            shutdown_rx,
        );
        let shared = manager.shared();
        tokio::spawn(manager.run());

        Fixture {
            vendor,
            clock,
            gap_tracker,
            receiver,
            gap_rx,
            session_tx,
            shutdown_tx,
            shared,
        }
    }

    fn raw(seq: u64) -> RawEvent {
        RawEvent {
            instrument_id: 1,
            sequence: seq,
            ts_event: Utc::now(),
            payload: Vec::new(),
        }
    }

    /// Backoff short enough that reconnects finish within the test.
    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base_ms: 10,
            max_ms: 50,
            max_attempts: 0,
        }
    }

    // The ledger does real I/O on a background thread, so these tests run on
    // real time and poll for the manager's observable effects.
    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..5_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn connects_and_forwards_events() {
        let mut fx = spawn_manager(BackoffConfig::default()).await;

        fx.vendor.push_live(raw(1));
        fx.vendor.push_live(raw(2));

        assert_eq!(fx.receiver.recv().await.unwrap().key, EventKey::new(1, 1));
        assert_eq!(fx.receiver.recv().await.unwrap().key, EventKey::new(1, 2));
        assert_eq!(fx.shared.state(), ConnectionState::Connected);
        assert_eq!(fx.vendor.subscriptions().len(), 1);

        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn stream_loss_triggers_reconnect_and_gap() {
        let mut fx = spawn_manager(fast_backoff()).await;

        fx.vendor.push_live(raw(1));
        let _ = fx.receiver.recv().await.unwrap();

        // Drop the stream, then stall reconnection long enough to qualify
        // for backfill. The backoff sleeps run on real time; the manual
        // clock drives gap duration separately.
        fx.vendor.fail_next_connects(2);
        fx.vendor.end_stream();
        wait_for("disconnect observed", || fx.gap_tracker.is_disconnected()).await;
        fx.clock.advance(chrono::Duration::seconds(45));

        let gap = fx.gap_rx.recv().await.unwrap();
        assert_eq!(gap.duration(), chrono::Duration::seconds(45));
        assert!(gap.backfill_required);
        assert_eq!(fx.gap_tracker.gaps_recorded(), 1);

        // Stream works again after reconnect
        fx.vendor.push_live(raw(2));
        assert_eq!(fx.receiver.recv().await.unwrap().key, EventKey::new(1, 2));

        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn scheduled_close_records_no_gap() {
        let mut fx = spawn_manager(BackoffConfig::default()).await;

        fx.vendor.push_live(raw(1));
        let _ = fx.receiver.recv().await.unwrap();

        // Session close tears the connection down
        let _ = fx.session_tx.send(false);
        wait_for("scheduled close", || {
            fx.shared.state() == ConnectionState::Disconnected
        })
        .await;
        fx.clock.advance(chrono::Duration::seconds(3_600));

        // Session reopens; connection comes back with no gap recorded
        let _ = fx.session_tx.send(true);
        fx.vendor.push_live(raw(2));
        assert_eq!(fx.receiver.recv().await.unwrap().key, EventKey::new(1, 2));
        assert_eq!(fx.gap_tracker.gaps_recorded(), 0);
        assert!(fx.gap_rx.try_recv().is_err());

        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let mut fx = spawn_manager(BackoffConfig::default()).await;

        fx.vendor.push_live(raw(1));
        fx.vendor
            .push_live_error(VendorError::Malformed("truncated".to_string()));
        fx.vendor.push_live(raw(2));

        assert_eq!(fx.receiver.recv().await.unwrap().key.sequence, 1);
        assert_eq!(fx.receiver.recv().await.unwrap().key.sequence, 2);
        assert_eq!(fx.shared.snapshot().malformed_skipped, 1);

        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn fatal_error_stops_retrying() {
        let fx = spawn_manager(fast_backoff()).await;
        // Let the first session establish, then kill it with an auth error
        fx.vendor
            .push_live_error(VendorError::Authentication("key revoked".to_string()));

        wait_for("manager stopped after fatal error", || {
            fx.shared.snapshot().sessions_established >= 1
                && fx.shared.state() == ConnectionState::Disconnected
        })
        .await;
        let attempts_after_fatal = fx.vendor.connect_attempts();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(fx.vendor.connect_attempts(), attempts_after_fatal);

        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn close_during_establish_tears_the_session_down() {
        let mut fx = spawn_manager(BackoffConfig::default()).await;

        fx.vendor.push_live(raw(1));
        let _ = fx.receiver.recv().await.unwrap();

        // Scheduled close, then reopen with the next connect held mid-flight
        let _ = fx.session_tx.send(false);
        wait_for("scheduled close", || {
            fx.shared.state() == ConnectionState::Disconnected
        })
        .await;
        let gate = fx.vendor.hold_next_connect();
        let _ = fx.session_tx.send(true);
        wait_for("reconnect in flight", || fx.vendor.connect_attempts() >= 2).await;

        // The session closes again while connect is still blocked; once it
        // completes, the manager must notice and come straight back down
        let _ = fx.session_tx.send(false);
        gate.notify_one();

        wait_for("post-establish close observed", || {
            fx.shared.snapshot().sessions_established >= 2
                && fx.shared.state() == ConnectionState::Disconnected
        })
        .await;
        assert_eq!(fx.gap_tracker.gaps_recorded(), 0);
        assert!(fx.gap_rx.try_recv().is_err());

        let _ = fx.shutdown_tx.send(true);
    }
}

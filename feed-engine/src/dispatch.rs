//! Observer registry and the single delivery path.
//!
//! Live and backfill events both funnel through [`Dispatcher::deliver`],
//! which consults the duplicate-suppression index before fanning out to
//! observers. Delivered keys are persisted to the ledger in batches so a
//! restarted engine does not re-deliver what consumers already saw.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error};

use feed_common::dedup::DedupIndex;
use feed_common::events::{ConnectionState, EventKey, MarketEvent};

use crate::ledger::{Ledger, LedgerResult};
use crate::queue::EventReceiver;

/// Keys buffered before a ledger write.
const KEY_FLUSH_THRESHOLD: usize = 256;

/// Consumer interface. Callbacks must be non-blocking.
pub trait FeedObserver: Send + Sync {
    /// An event cleared duplicate suppression and is being delivered.
    fn on_event(&self, event: &MarketEvent);

    /// Connection state changed.
    fn on_status(&self, _state: ConnectionState) {}

    /// A non-fatal engine error worth surfacing.
    fn on_error(&self, _message: &str) {}
}

/// Fans events out to observers, suppressing duplicates.
pub struct Dispatcher {
    observers: RwLock<Vec<Arc<dyn FeedObserver>>>,
    dedup: Mutex<DedupIndex>,
    pending_keys: Mutex<Vec<EventKey>>,
    // Ledger rows are capped at the same count as the in-memory index
    key_retention: usize,
    ledger: Ledger,
    delivered: AtomicU64,
    duplicates_suppressed: AtomicU64,
}

impl Dispatcher {
    pub fn new(dedup_capacity: usize, ledger: Ledger) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            dedup: Mutex::new(DedupIndex::new(dedup_capacity)),
            pending_keys: Mutex::new(Vec::new()),
            key_retention: dedup_capacity,
            ledger,
            delivered: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn FeedObserver>) {
        self.observers.write().push(observer);
    }

    /// Pre-load the suppression index, typically from the ledger at startup.
    pub fn seed_keys(&self, keys: &[EventKey]) {
        let mut dedup = self.dedup.lock();
        for key in keys {
            dedup.insert(*key);
        }
    }

    /// Deliver one event to all observers.
    ///
    /// Returns `false` if the key was already delivered (live or backfill)
    /// and the event was suppressed.
    pub async fn deliver(&self, event: MarketEvent) -> bool {
        if !self.dedup.lock().insert(event.key) {
            self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(key = %event.key, provenance = %event.provenance, "suppressing duplicate");
            return false;
        }

        let flush_now = {
            let mut pending = self.pending_keys.lock();
            pending.push(event.key);
            pending.len() >= KEY_FLUSH_THRESHOLD
        };

        for observer in self.observers.read().iter() {
            observer.on_event(&event);
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);

        if flush_now {
            if let Err(err) = self.flush_keys().await {
                error!(error = %err, "failed to persist delivered keys");
            }
        }
        true
    }

    /// Persist any buffered delivered keys.
    pub async fn flush_keys(&self) -> LedgerResult<()> {
        let keys = std::mem::take(&mut *self.pending_keys.lock());
        if keys.is_empty() {
            return Ok(());
        }
        self.ledger.record_seen_keys(&keys, self.key_retention).await
    }

    pub fn notify_status(&self, state: ConnectionState) {
        for observer in self.observers.read().iter() {
            observer.on_status(state);
        }
    }

    pub fn notify_error(&self, message: &str) {
        for observer in self.observers.read().iter() {
            observer.on_error(message);
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates_suppressed.load(Ordering::Relaxed)
    }

    /// Delivery loop: drains the live queue until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: EventReceiver,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = receiver.recv() => match event {
                    Some(event) => {
                        self.deliver(event).await;
                    }
                    None => break,
                },
            }
        }

        if let Err(err) = self.flush_keys().await {
            error!(error = %err, "failed to persist delivered keys at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use feed_common::events::Provenance;

    struct Recorder {
        events: Mutex<Vec<(EventKey, Provenance)>>,
        statuses: Mutex<Vec<ConnectionState>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                statuses: Mutex::new(Vec::new()),
            })
        }

        fn keys(&self) -> Vec<EventKey> {
            self.events.lock().iter().map(|(k, _)| *k).collect()
        }
    }

    impl FeedObserver for Recorder {
        fn on_event(&self, event: &MarketEvent) {
            self.events.lock().push((event.key, event.provenance));
        }

        fn on_status(&self, state: ConnectionState) {
            self.statuses.lock().push(state);
        }
    }

    fn event(seq: u64, provenance: Provenance) -> MarketEvent {
        MarketEvent {
            key: EventKey::new(1, seq),
            ts_event: Utc::now(),
            ts_recv: Utc::now(),
            payload: Vec::new(),
            provenance,
        }
    }

    #[tokio::test]
    async fn delivers_once_across_paths() {
        let ledger = Ledger::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(1_000, ledger);
        let recorder = Recorder::new();
        dispatcher.subscribe(recorder.clone());

        assert!(dispatcher.deliver(event(1, Provenance::Live)).await);
        // Same key arrives again via backfill; suppressed
        assert!(!dispatcher.deliver(event(1, Provenance::Backfill)).await);
        assert!(dispatcher.deliver(event(2, Provenance::Backfill)).await);

        assert_eq!(recorder.keys(), vec![EventKey::new(1, 1), EventKey::new(1, 2)]);
        assert_eq!(dispatcher.delivered(), 2);
        assert_eq!(dispatcher.duplicates_suppressed(), 1);
    }

    #[tokio::test]
    async fn seeded_keys_are_suppressed() {
        let ledger = Ledger::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(1_000, ledger);
        let recorder = Recorder::new();
        dispatcher.subscribe(recorder.clone());

        dispatcher.seed_keys(&[EventKey::new(1, 7)]);
        assert!(!dispatcher.deliver(event(7, Provenance::Backfill)).await);
        assert!(recorder.keys().is_empty());
    }

    #[tokio::test]
    async fn flush_persists_delivered_keys() {
        let ledger = Ledger::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(1_000, ledger.clone());

        dispatcher.deliver(event(1, Provenance::Live)).await;
        dispatcher.deliver(event(2, Provenance::Live)).await;
        dispatcher.flush_keys().await.unwrap();

        let keys = ledger.recent_keys(10).await.unwrap();
        assert_eq!(keys.len(), 2);

        // Flush with nothing pending is a no-op
        dispatcher.flush_keys().await.unwrap();
        assert_eq!(ledger.recent_keys(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persisted_keys_stay_within_dedup_capacity() {
        let ledger = Ledger::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(2, ledger.clone());

        for seq in 1..=4 {
            dispatcher.deliver(event(seq, Provenance::Live)).await;
        }
        dispatcher.flush_keys().await.unwrap();

        let keys = ledger.recent_keys(10).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&EventKey::new(1, 4)));
    }

    #[tokio::test]
    async fn status_fanout_reaches_all_observers() {
        let ledger = Ledger::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(16, ledger);
        let a = Recorder::new();
        let b = Recorder::new();
        dispatcher.subscribe(a.clone());
        dispatcher.subscribe(b.clone());

        dispatcher.notify_status(ConnectionState::Connected);
        assert_eq!(a.statuses.lock().as_slice(), &[ConnectionState::Connected]);
        assert_eq!(b.statuses.lock().as_slice(), &[ConnectionState::Connected]);
    }
}

//! Bounded event queue between the receive paths and delivery.
//!
//! Producers never stall the vendor stream: a full queue drops the incoming
//! event (after a short bounded wait) rather than applying backpressure to
//! the socket. Drops are counted and logged; a sustained non-zero drop rate
//! means the consumer is too slow for the configured capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use feed_common::config::QueueConfig;
use feed_common::events::MarketEvent;

/// Factory for the queue pair.
pub struct EventQueue;

impl EventQueue {
    /// Create a bounded queue from config.
    pub fn bounded(config: &QueueConfig) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(config.capacity);
        let sender = EventSender {
            tx,
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sender, EventReceiver { rx })
    }
}

/// Producer handle. Cloned by the live and backfill paths.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<MarketEvent>,
    enqueue_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Enqueue an event.
    ///
    /// Returns `false` if the event was dropped (queue full past the grace
    /// window) or the consumer is gone.
    pub async fn push(&self, event: MarketEvent) -> bool {
        let event = match self.tx.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(event)) => event,
        };

        if !self.enqueue_timeout.is_zero() {
            if let Ok(sent) = tokio::time::timeout(self.enqueue_timeout, self.tx.send(event)).await
            {
                return sent.is_ok();
            }
        }

        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(total_dropped = dropped, "event queue full, dropping event");
        false
    }

    /// Events dropped since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events currently buffered.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Consumer handle. Single owner, drained by the delivery loop.
pub struct EventReceiver {
    rx: mpsc::Receiver<MarketEvent>,
}

impl EventReceiver {
    /// Next buffered event, or `None` once all senders are gone.
    pub async fn recv(&mut self) -> Option<MarketEvent> {
        self.rx.recv().await
    }
}

//! Calendar-driven session signals.
//!
//! Polls the trading calendar and publishes the session-open flag on a watch
//! channel. The connection manager reacts to edges: open brings the
//! connection up, close tears it down without recording a gap. Each edge is
//! published exactly once; polling between edges is silent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use feed_common::calendar::WeeklyCalendar;
use feed_common::clock::Clock;
use feed_common::config::SchedulerConfig;

/// Publishes session open/close edges from the calendar.
pub struct SessionScheduler {
    calendar: WeeklyCalendar,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    session_tx: watch::Sender<bool>,
}

impl SessionScheduler {
    pub fn new(
        calendar: WeeklyCalendar,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        session_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            calendar,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            clock,
            session_tx,
        }
    }

    /// Whether the market is open right now.
    pub fn is_open_now(&self) -> bool {
        self.calendar.is_open(self.clock.now())
    }

    /// Poll loop. The first iteration publishes the current state, so a
    /// mid-session startup connects immediately.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut previous: Option<bool> = None;

        loop {
            let now = self.clock.now();
            let open = self.calendar.is_open(now);

            if previous != Some(open) {
                if open {
                    info!(next_close = %self.calendar.next_close(now), "session open");
                } else {
                    info!(next_open = %self.calendar.next_open(now), "session closed");
                }
                let _ = self.session_tx.send(open);
                previous = Some(open);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

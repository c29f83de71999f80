//! # Feed Engine
//!
//! Session-aware connection lifecycle and gap reconciliation for a live MBO
//! (market-by-order) feed.
//!
//! The engine keeps a single vendor connection alive during trading hours,
//! reconnects with exponential backoff when it drops, records every
//! qualifying data loss window as a gap, and recovers gaps through
//! cost-bounded historical backfill. Live and recovered events converge on
//! one delivery path with duplicate suppression, so consumers see each event
//! at most once regardless of which path carried it.
//!
//! ## Architecture
//!
//! - [`connection`]: connection state machine and reconnect loop
//! - [`queue`]: bounded event queue between the receive path and delivery
//! - [`gap_tracker`]: disconnect/reconnect bookkeeping and gap records
//! - [`backfill`]: budget-checked recovery of recorded gaps
//! - [`ledger`]: durable record of gaps, requests, spend, and delivered keys
//! - [`scheduler`]: calendar-driven session open/close signals
//! - [`dispatch`]: observer registry and the single delivery path
//! - [`engine`]: composition root wiring the tasks together

pub mod backfill;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod gap_tracker;
pub mod ledger;
pub mod queue;
pub mod scheduler;
pub mod vendor;

pub use backfill::BackfillCoordinator;
pub use connection::{ConnectionManager, ConnectionStats};
pub use dispatch::{Dispatcher, FeedObserver};
pub use engine::{FeedEngine, FeedStats};
pub use gap_tracker::GapTracker;
pub use ledger::Ledger;
pub use queue::{EventQueue, EventReceiver, EventSender};
pub use scheduler::SessionScheduler;
pub use vendor::{HistoricalFeed, LiveFeed, RawEvent, Subscription, VendorError, VendorResult};

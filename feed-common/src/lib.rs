//! # Feed Common
//!
//! Shared vocabulary types for the MBO feed engine.
//!
//! This crate carries everything the engine and its consumers need to agree
//! on without pulling in vendor clients or storage drivers:
//!
//! - **Market events**: the opaque, provenance-tagged event record
//! - **Gaps and backfill**: records describing data loss windows and their
//!   cost-bounded recovery
//! - **Session calendar**: the weekly open/close schedule that governs when
//!   the live connection should be up
//! - **Ambient infrastructure**: error classification, configuration,
//!   logging setup, clock abstraction

pub mod backfill;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod gap;
pub mod logging;

pub use backfill::{BackfillRequest, BackfillStatus, CostModel};
pub use calendar::WeeklyCalendar;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use dedup::DedupIndex;
pub use error::{ErrorCategory, ErrorClassification};
pub use events::{ConnectionState, EventKey, MarketEvent, Provenance};
pub use gap::Gap;

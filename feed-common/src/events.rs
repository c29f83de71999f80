//! Market event types.
//!
//! An event is an already-decoded, opaque order-level record. The engine
//! never inspects the payload; it only cares about the identity key, the
//! timestamps, and which path produced the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity key of a market event.
///
/// Instrument id plus the vendor's monotonic per-instrument sequence number.
/// Two events with the same key are the same event regardless of which path
/// (live or backfill) delivered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub instrument_id: u32,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(instrument_id: u32, sequence: u64) -> Self {
        Self {
            instrument_id,
            sequence,
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instrument_id, self.sequence)
    }
}

/// Which data path produced an event.
///
/// Consumers must treat provenance as the authority on recency: a
/// `Backfill` event may arrive after newer `Live` events, since the two
/// paths are independent producers feeding the same delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Received on the live streaming connection
    Live,
    /// Recovered from the historical API while reconciling a gap
    Backfill,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Live => write!(f, "live"),
            Provenance::Backfill => write!(f, "backfill"),
        }
    }
}

/// A single order-level market event.
///
/// Immutable once created; ownership transfers to the consumer callback on
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    /// Identity key (instrument id, sequence)
    pub key: EventKey,
    /// Event timestamp assigned by the venue
    pub ts_event: DateTime<Utc>,
    /// Receipt timestamp assigned by this process
    pub ts_recv: DateTime<Utc>,
    /// Opaque, already-decoded vendor record
    pub payload: Vec<u8>,
    /// Which path produced this event
    pub provenance: Provenance,
}

impl MarketEvent {
    pub fn new(
        key: EventKey,
        ts_event: DateTime<Utc>,
        ts_recv: DateTime<Utc>,
        payload: Vec<u8>,
        provenance: Provenance,
    ) -> Self {
        Self {
            key,
            ts_event,
            ts_recv,
            payload,
            provenance,
        }
    }

    pub fn is_backfill(&self) -> bool {
        self.provenance == Provenance::Backfill
    }
}

/// State of the live streaming connection.
///
/// Mutated only by the stream connection; read by the scheduler and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

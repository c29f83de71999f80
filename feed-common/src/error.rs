//! Error classification for retry and escalation decisions.
//!
//! Errors across the engine self-describe their characteristics so the
//! connection loop and backfill worker can decide generically whether a
//! failure is worth retrying or must be escalated to the consumer.

use std::time::Duration;

/// Classification of error types for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient errors that may resolve on retry (network issues, timeouts)
    Transient,
    /// Permanent errors that won't resolve on retry (bad data, not found)
    Permanent,
    /// Resource exhaustion (rate limits, full queues)
    ResourceExhausted,
    /// Configuration errors, including authentication failures
    Configuration,
    /// Internal errors (bugs, unexpected state)
    Internal,
}

/// Trait for errors that can classify themselves.
///
/// The stream connection uses this to distinguish transient I/O failures
/// (reconnect with backoff) from authentication failures (fatal, surfaced
/// to the consumer with no automatic retry).
pub trait ErrorClassification {
    /// Returns the category of this error
    fn category(&self) -> ErrorCategory;

    /// Returns true if this error is transient and may succeed on retry
    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }

    /// Returns true if this error requires operator intervention
    fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Suggests a delay before retrying, if applicable
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_millis(100)),
            ErrorCategory::ResourceExhausted => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

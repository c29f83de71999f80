//! Durable ledger for gaps, backfill requests, spend, and delivered keys.
//!
//! SQLite keeps the engine restartable: on startup the engine reloads daily
//! spend, re-seeds the duplicate-suppression index from recently delivered
//! keys, and fails any request that was interrupted mid-flight.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use feed_common::backfill::{BackfillRequest, BackfillStatus};
use feed_common::error::{ErrorCategory, ErrorClassification};
use feed_common::events::EventKey;
use feed_common::gap::Gap;

/// Ledger failure modes.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("backfill request {0} not found")]
    MissingRequest(Uuid),

    #[error("illegal status transition for request {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: BackfillStatus,
        to: BackfillStatus,
    },
}

impl ErrorClassification for LedgerError {
    fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::Database(_) => ErrorCategory::Internal,
            LedgerError::CorruptRow(_) => ErrorCategory::Internal,
            LedgerError::MissingRequest(_) => ErrorCategory::Internal,
            LedgerError::IllegalTransition { .. } => ErrorCategory::Internal,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// SQLite-backed ledger.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Connect and run schema setup.
    ///
    /// A single connection is used; SQLite serializes writers anyway and an
    /// in-memory database exists per connection.
    pub async fn connect(url: &str) -> LedgerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        info!(url, "ledger ready");
        Ok(ledger)
    }

    /// Fresh in-memory ledger, used by tests.
    pub async fn in_memory() -> LedgerResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn init_schema(&self) -> LedgerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gaps (
                id TEXT PRIMARY KEY,
                disconnect_time TEXT NOT NULL,
                reconnect_time TEXT NOT NULL,
                last_event_time TEXT,
                estimated_missed_events INTEGER NOT NULL,
                backfill_required INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backfill_requests (
                id TEXT PRIMARY KEY,
                gap_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                instruments TEXT NOT NULL,
                status TEXT NOT NULL,
                cost_estimate REAL NOT NULL,
                actual_cost REAL,
                events_recovered INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS seen_keys (
                instrument_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                PRIMARY KEY (instrument_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS daily_spend (
                day TEXT PRIMARY KEY,
                spent REAL NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- gaps ---

    pub async fn record_gap(&self, gap: &Gap) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO gaps \
             (id, disconnect_time, reconnect_time, last_event_time, estimated_missed_events, backfill_required) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(gap.id.to_string())
        .bind(gap.disconnect_time)
        .bind(gap.reconnect_time)
        .bind(gap.last_event_time)
        .bind(gap.estimated_missed_events as i64)
        .bind(gap.backfill_required)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_gap_backfill_required(
        &self,
        gap_id: Uuid,
        required: bool,
    ) -> LedgerResult<()> {
        sqlx::query("UPDATE gaps SET backfill_required = ? WHERE id = ?")
            .bind(required)
            .bind(gap_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn gap_count(&self) -> LedgerResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM gaps")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    /// Most recent gaps, newest first.
    pub async fn recent_gaps(&self, limit: u32) -> LedgerResult<Vec<Gap>> {
        let rows = sqlx::query(
            "SELECT id, disconnect_time, reconnect_time, last_event_time, \
                    estimated_missed_events, backfill_required \
             FROM gaps ORDER BY disconnect_time DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Gap {
                    id: parse_uuid(row.try_get("id")?)?,
                    disconnect_time: row.try_get("disconnect_time")?,
                    reconnect_time: row.try_get("reconnect_time")?,
                    last_event_time: row.try_get("last_event_time")?,
                    estimated_missed_events: row.try_get::<i64, _>("estimated_missed_events")?
                        as u64,
                    backfill_required: row.try_get("backfill_required")?,
                })
            })
            .collect()
    }

    // --- backfill requests ---

    pub async fn insert_request(&self, request: &BackfillRequest) -> LedgerResult<()> {
        let instruments = serde_json::to_string(&request.instruments)
            .map_err(|e| LedgerError::CorruptRow(e.to_string()))?;

        sqlx::query(
            "INSERT INTO backfill_requests \
             (id, gap_id, start_time, end_time, instruments, status, cost_estimate, \
              actual_cost, events_recovered, error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id.to_string())
        .bind(request.gap_id.to_string())
        .bind(request.start)
        .bind(request.end)
        .bind(instruments)
        .bind(request.status.to_string())
        .bind(request.cost_estimate)
        .bind(request.actual_cost)
        .bind(request.events_recovered as i64)
        .bind(request.error.as_deref())
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_request_in_progress(&self, id: Uuid) -> LedgerResult<()> {
        self.check_transition(id, BackfillStatus::InProgress).await?;
        sqlx::query("UPDATE backfill_requests SET status = ? WHERE id = ?")
            .bind(BackfillStatus::InProgress.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_request(
        &self,
        id: Uuid,
        actual_cost: f64,
        events_recovered: u64,
    ) -> LedgerResult<()> {
        self.check_transition(id, BackfillStatus::Completed).await?;
        sqlx::query(
            "UPDATE backfill_requests \
             SET status = ?, actual_cost = ?, events_recovered = ? WHERE id = ?",
        )
        .bind(BackfillStatus::Completed.to_string())
        .bind(actual_cost)
        .bind(events_recovered as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_request(&self, id: Uuid, error: &str) -> LedgerResult<()> {
        self.check_transition(id, BackfillStatus::Failed).await?;
        sqlx::query("UPDATE backfill_requests SET status = ?, error = ? WHERE id = ?")
            .bind(BackfillStatus::Failed.to_string())
            .bind(error)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Status transitions are monotonic; a stored row may only move
    /// forward through pending -> in_progress -> completed/failed.
    async fn check_transition(&self, id: Uuid, to: BackfillStatus) -> LedgerResult<()> {
        let row = sqlx::query("SELECT status FROM backfill_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or(LedgerError::MissingRequest(id))?;
        let status: String = row.try_get("status")?;
        let from = BackfillStatus::from_str(&status).map_err(LedgerError::CorruptRow)?;
        if !from.can_transition_to(to) {
            return Err(LedgerError::IllegalTransition { id, from, to });
        }
        Ok(())
    }

    /// Whether any request already covers this gap.
    pub async fn request_exists_for_gap(&self, gap_id: Uuid) -> LedgerResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM backfill_requests WHERE gap_id = ?")
            .bind(gap_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Requests still pending or in progress, oldest first.
    pub async fn open_requests(&self) -> LedgerResult<Vec<BackfillRequest>> {
        let rows = sqlx::query(
            "SELECT id, gap_id, start_time, end_time, instruments, status, cost_estimate, \
                    actual_cost, events_recovered, error, created_at \
             FROM backfill_requests \
             WHERE status IN ('pending', 'in_progress') \
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_request).collect()
    }

    pub async fn get_request(&self, id: Uuid) -> LedgerResult<Option<BackfillRequest>> {
        let row = sqlx::query(
            "SELECT id, gap_id, start_time, end_time, instruments, status, cost_estimate, \
                    actual_cost, events_recovered, error, created_at \
             FROM backfill_requests WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_request).transpose()
    }

    // --- daily spend ---

    /// Add to the spend for `day`, returning the new total.
    pub async fn add_spent(&self, day: NaiveDate, amount: f64) -> LedgerResult<f64> {
        sqlx::query(
            "INSERT INTO daily_spend (day, spent) VALUES (?, ?) \
             ON CONFLICT(day) DO UPDATE SET spent = spent + excluded.spent",
        )
        .bind(day.to_string())
        .bind(amount)
        .execute(&self.pool)
        .await?;

        self.spent_on(day).await
    }

    pub async fn spent_on(&self, day: NaiveDate) -> LedgerResult<f64> {
        let row = sqlx::query("SELECT spent FROM daily_spend WHERE day = ?")
            .bind(day.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("spent")?,
            None => 0.0,
        })
    }

    // --- delivered keys ---

    /// Persist delivered keys, keeping only the newest `retain` rows.
    /// Duplicates are ignored. The table mirrors the bounded in-memory
    /// index, so rows past the retention window carry no information.
    pub async fn record_seen_keys(&self, keys: &[EventKey], retain: usize) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query("INSERT OR IGNORE INTO seen_keys (instrument_id, sequence) VALUES (?, ?)")
                .bind(key.instrument_id as i64)
                .bind(key.sequence as i64)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "DELETE FROM seen_keys \
             WHERE rowid <= (SELECT COALESCE(MAX(rowid), 0) FROM seen_keys) - ?",
        )
        .bind(retain as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Most recently inserted keys, for re-seeding the in-memory index.
    pub async fn recent_keys(&self, limit: u32) -> LedgerResult<Vec<EventKey>> {
        let rows = sqlx::query(
            "SELECT instrument_id, sequence FROM seen_keys ORDER BY rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EventKey::new(
                    row.try_get::<i64, _>("instrument_id")? as u32,
                    row.try_get::<i64, _>("sequence")? as u64,
                ))
            })
            .collect()
    }
}

fn parse_uuid(s: &str) -> LedgerResult<Uuid> {
    Uuid::from_str(s).map_err(|e| LedgerError::CorruptRow(format!("bad uuid {s}: {e}")))
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> LedgerResult<BackfillRequest> {
    let status: String = row.try_get("status")?;
    let instruments: String = row.try_get("instruments")?;

    Ok(BackfillRequest {
        id: parse_uuid(row.try_get("id")?)?,
        gap_id: parse_uuid(row.try_get("gap_id")?)?,
        start: row.try_get("start_time")?,
        end: row.try_get("end_time")?,
        instruments: serde_json::from_str(&instruments)
            .map_err(|e| LedgerError::CorruptRow(e.to_string()))?,
        status: BackfillStatus::from_str(&status).map_err(LedgerError::CorruptRow)?,
        cost_estimate: row.try_get("cost_estimate")?,
        actual_cost: row.try_get("actual_cost")?,
        events_recovered: row.try_get::<i64, _>("events_recovered")? as u64,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

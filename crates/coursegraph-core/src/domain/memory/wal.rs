//! Durable fact log (WAL) for conversation-derived learning events
//!
//! Appends are committed to a `synchronous = FULL` SQLite database before
//! returning, so a record acknowledged to the caller survives a crash.
//! Only the sync worker moves records between states.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{Database, DatabaseConfig};

use super::event::LearningEvent;

/// Lifecycle state of a WAL record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalState {
    Pending,
    Writing,
    Committed,
    Failed,
    DeadLetter,
}

impl WalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Writing => "WRITING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "WRITING" => Some(Self::Writing),
            "COMMITTED" => Some(Self::Committed),
            "FAILED" => Some(Self::Failed),
            "DEAD_LETTER" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Terminal records are never transitioned again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::DeadLetter)
    }

    /// Whether `self -> to` is a legal forward transition
    pub fn can_transition_to(&self, to: WalState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Writing)
                | (Self::Writing, Self::Committed)
                | (Self::Writing, Self::Failed)
                | (Self::Failed, Self::Writing)
                | (Self::Failed, Self::DeadLetter)
        )
    }
}

impl fmt::Display for WalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the fact log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Append order
    pub seq: i64,
    pub record_id: String,
    pub payload: LearningEvent,
    pub state: WalState,
    pub attempt_count: u32,
    pub idempotency_key: String,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Number of records in each state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalStats {
    pub pending: u64,
    pub writing: u64,
    pub committed: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

/// Append-only, crash-recoverable store of learning events
#[derive(Debug, Clone)]
pub struct FactLog {
    pool: SqlitePool,
}

impl FactLog {
    /// Open (creating if needed) a durable fact log at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::new(DatabaseConfig::durable(path.as_ref()))
            .await
            .map_err(|e| Error::Other(format!("Failed to open fact log: {:#}", e)))?;
        Ok(Self::new(db.pool().clone()))
    }

    /// Open an in-memory fact log (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        let db = Database::in_memory()
            .await
            .map_err(|e| Error::Other(format!("Failed to open fact log: {:#}", e)))?;
        Ok(Self::new(db.pool().clone()))
    }

    /// Create a log over an already-migrated pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Durably append an event, returning its record id
    ///
    /// Appending an event whose idempotency key is already logged returns the
    /// existing record id and writes nothing.
    pub async fn append(&self, event: &LearningEvent) -> Result<String> {
        let idempotency_key = event.idempotency_key();
        let record_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(event)?;

        let result = sqlx::query(
            r#"
            INSERT INTO wal_records (record_id, idempotency_key, payload, state)
            VALUES (?, ?, ?, 'PENDING')
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(&record_id)
        .bind(&idempotency_key)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(record_id = %record_id, concept = %event.concept_name, "Appended WAL record");
            return Ok(record_id);
        }

        let (existing,): (String,) =
            sqlx::query_as("SELECT record_id FROM wal_records WHERE idempotency_key = ?")
                .bind(&idempotency_key)
                .fetch_one(&self.pool)
                .await?;
        debug!(record_id = %existing, "Duplicate append folded into existing WAL record");
        Ok(existing)
    }

    /// All records in `state`, in append order
    pub async fn scan(&self, state: WalState) -> Result<Vec<WalRecord>> {
        let rows: Vec<WalRow> = sqlx::query_as(
            r#"
            SELECT seq, record_id, idempotency_key, payload, state, attempt_count, last_error, next_attempt_at
            FROM wal_records WHERE state = ? ORDER BY seq
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WalRow::into_record).collect()
    }

    /// Records the worker may dispatch at `now`: PENDING, plus FAILED
    /// records whose backoff has elapsed, in append order
    pub async fn scan_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<WalRecord>> {
        let rows: Vec<WalRow> = sqlx::query_as(
            r#"
            SELECT seq, record_id, idempotency_key, payload, state, attempt_count, last_error, next_attempt_at
            FROM wal_records
            WHERE state = 'PENDING'
               OR (state = 'FAILED' AND (next_attempt_at IS NULL OR next_attempt_at <= ?))
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WalRow::into_record).collect()
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<WalRecord>> {
        let row: Option<WalRow> = sqlx::query_as(
            r#"
            SELECT seq, record_id, idempotency_key, payload, state, attempt_count, last_error, next_attempt_at
            FROM wal_records WHERE record_id = ?
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WalRow::into_record).transpose()
    }

    /// Move a record to `to`
    ///
    /// Fails with `InvalidTransition` for terminal records and any backward
    /// move. Entering WRITING counts one attempt.
    pub async fn transition(&self, record_id: &str, to: WalState) -> Result<WalRecord> {
        self.apply_transition(record_id, to, None, None).await
    }

    /// Move a WRITING record to FAILED, recording the error and retry time
    pub async fn fail(
        &self,
        record_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<WalRecord> {
        self.apply_transition(record_id, WalState::Failed, Some(error), next_attempt_at)
            .await
    }

    async fn apply_transition(
        &self,
        record_id: &str,
        to: WalState,
        error: Option<&str>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<WalRecord> {
        let current = self
            .get(record_id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(record_id.to_string()))?;

        if !current.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                record_id: record_id.to_string(),
                from: current.state.to_string(),
                to: to.to_string(),
            });
        }

        let attempt_increment: i64 = if to == WalState::Writing { 1 } else { 0 };

        let result = sqlx::query(
            r#"
            UPDATE wal_records SET
                state = ?,
                attempt_count = attempt_count + ?,
                last_error = COALESCE(?, last_error),
                next_attempt_at = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE record_id = ? AND state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(attempt_increment)
        .bind(error)
        .bind(next_attempt_at.map(|t| t.timestamp_millis()))
        .bind(record_id)
        .bind(current.state.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            // Another writer moved the record between read and update
            return Err(Error::InvalidTransition {
                record_id: record_id.to_string(),
                from: current.state.to_string(),
                to: to.to_string(),
            });
        }

        debug!(record_id = %record_id, from = %current.state, to = %to, "WAL transition");

        Ok(WalRecord {
            state: to,
            attempt_count: current.attempt_count + attempt_increment as u32,
            last_error: error.map(str::to_string).or(current.last_error),
            next_attempt_at,
            ..current
        })
    }

    /// Move records left in WRITING by a crashed process to FAILED
    ///
    /// Called once before the sync worker starts. The interrupted attempt
    /// is handed back, so a crash never counts toward dead-lettering.
    /// PENDING records need no recovery; they are simply scanned again.
    pub async fn recover(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE wal_records SET
                state = 'FAILED',
                attempt_count = MAX(attempt_count - 1, 0),
                last_error = 'interrupted while writing',
                next_attempt_at = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE state = 'WRITING'
            "#,
        )
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "Recovered WAL records interrupted mid-write");
        } else {
            info!("Fact log clean; nothing to recover");
        }
        Ok(recovered)
    }

    /// Dead-lettered records awaiting operator attention
    pub async fn dead_letters(&self) -> Result<Vec<WalRecord>> {
        self.scan(WalState::DeadLetter).await
    }

    pub async fn stats(&self) -> Result<WalStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM wal_records GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = WalStats::default();
        for (state, count) in rows {
            let count = count as u64;
            match WalState::parse(&state) {
                Some(WalState::Pending) => stats.pending = count,
                Some(WalState::Writing) => stats.writing = count,
                Some(WalState::Committed) => stats.committed = count,
                Some(WalState::Failed) => stats.failed = count,
                Some(WalState::DeadLetter) => stats.dead_letter = count,
                None => {}
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, FromRow)]
struct WalRow {
    seq: i64,
    record_id: String,
    idempotency_key: String,
    payload: String,
    state: String,
    attempt_count: i64,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
}

impl WalRow {
    fn into_record(self) -> Result<WalRecord> {
        let state = WalState::parse(&self.state)
            .ok_or_else(|| Error::Other(format!("Invalid WAL state: {}", self.state)))?;
        let payload: LearningEvent = serde_json::from_str(&self.payload)?;
        let next_attempt_at = self
            .next_attempt_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(WalRecord {
            seq: self.seq,
            record_id: self.record_id,
            payload,
            state,
            attempt_count: self.attempt_count as u32,
            idempotency_key: self.idempotency_key,
            last_error: self.last_error,
            next_attempt_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::memory::LearningEventType;

    fn event(concept: &str) -> LearningEvent {
        LearningEvent::new("student_0badc0de", concept, LearningEventType::Reviewed, 0.7, "worked an example")
    }

    #[tokio::test]
    async fn test_append_and_scan_in_order() {
        let log = FactLog::in_memory().await.expect("open log");

        let a = log.append(&event("Paxos")).await.expect("append a");
        let b = log.append(&event("Raft")).await.expect("append b");

        let pending = log.scan(WalState::Pending).await.expect("scan");
        let ids: Vec<_> = pending.iter().map(|r| r.record_id.clone()).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(pending[0].attempt_count, 0);
        assert_eq!(pending[0].payload.concept_name, "Paxos");
    }

    #[tokio::test]
    async fn test_duplicate_append_returns_existing_record() {
        let log = FactLog::in_memory().await.expect("open log");

        let first = log.append(&event("Raft")).await.expect("append");
        let second = log.append(&event("Raft")).await.expect("append duplicate");

        assert_eq!(first, second);
        assert_eq!(log.stats().await.expect("stats").pending, 1);
    }

    #[tokio::test]
    async fn test_forward_transitions() {
        let log = FactLog::in_memory().await.expect("open log");
        let id = log.append(&event("Raft")).await.expect("append");

        let writing = log.transition(&id, WalState::Writing).await.expect("to writing");
        assert_eq!(writing.attempt_count, 1);

        let failed = log.fail(&id, "store down", None).await.expect("to failed");
        assert_eq!(failed.last_error.as_deref(), Some("store down"));

        let retry = log.transition(&id, WalState::Writing).await.expect("retry");
        assert_eq!(retry.attempt_count, 2);

        log.transition(&id, WalState::Committed).await.expect("commit");
        let stored = log.get(&id).await.expect("get").expect("record exists");
        assert_eq!(stored.state, WalState::Committed);
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_terminal_records_reject_transitions() {
        let log = FactLog::in_memory().await.expect("open log");
        let id = log.append(&event("Raft")).await.expect("append");
        log.transition(&id, WalState::Writing).await.expect("to writing");
        log.transition(&id, WalState::Committed).await.expect("commit");

        let err = log
            .transition(&id, WalState::Writing)
            .await
            .expect_err("committed is terminal");
        assert_eq!(err.code(), "E401");

        let err = log
            .transition(&id, WalState::Pending)
            .await
            .expect_err("no regression");
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_pending_cannot_skip_writing() {
        let log = FactLog::in_memory().await.expect("open log");
        let id = log.append(&event("Raft")).await.expect("append");

        assert!(log.transition(&id, WalState::Committed).await.is_err());
        assert!(matches!(
            log.transition("missing", WalState::Writing).await,
            Err(Error::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_ready_respects_backoff() {
        let log = FactLog::in_memory().await.expect("open log");
        let now = Utc::now();

        let due = log.append(&event("Paxos")).await.expect("append");
        let later = log.append(&event("Raft")).await.expect("append");
        let pending = log.append(&event("Gossip")).await.expect("append");

        for id in [&due, &later] {
            log.transition(id, WalState::Writing).await.expect("to writing");
        }
        log.fail(&due, "down", Some(now - chrono::Duration::seconds(1)))
            .await
            .expect("fail due");
        log.fail(&later, "down", Some(now + chrono::Duration::seconds(60)))
            .await
            .expect("fail later");

        let ready = log.scan_ready(10, now).await.expect("scan ready");
        let ids: Vec<_> = ready.into_iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![due, pending]);
    }

    #[tokio::test]
    async fn test_recover_moves_writing_to_failed() {
        let log = FactLog::in_memory().await.expect("open log");
        let id = log.append(&event("Raft")).await.expect("append");
        log.transition(&id, WalState::Writing).await.expect("to writing");

        assert_eq!(log.recover().await.expect("recover"), 1);

        let record = log.get(&id).await.expect("get").expect("record exists");
        assert_eq!(record.state, WalState::Failed);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.last_error.as_deref(), Some("interrupted while writing"));
        assert_eq!(log.recover().await.expect("recover again"), 0);
    }

    #[tokio::test]
    async fn test_interrupted_attempts_are_not_charged() {
        let log = FactLog::in_memory().await.expect("open log");
        let id = log.append(&event("Paxos")).await.expect("append");

        log.transition(&id, WalState::Writing).await.expect("to writing");
        log.fail(&id, "store refused", None).await.expect("to failed");
        log.transition(&id, WalState::Writing).await.expect("retry");
        assert_eq!(log.recover().await.expect("recover"), 1);

        // One real failure survives; the crashed retry does not
        let record = log.get(&id).await.expect("get").expect("record exists");
        assert_eq!(record.attempt_count, 1);
        let again = log.transition(&id, WalState::Writing).await.expect("retry after recovery");
        assert_eq!(again.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_append_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wal.db");

        let id = {
            let log = FactLog::open(&path).await.expect("open log");
            let id = log.append(&event("Raft")).await.expect("append");
            log.pool.close().await;
            id
        };

        let reopened = FactLog::open(&path).await.expect("reopen log");
        reopened.recover().await.expect("recover");
        let pending = reopened.scan(WalState::Pending).await.expect("scan");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, id);
    }
}

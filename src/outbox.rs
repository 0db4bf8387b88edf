// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable outbox of pending replication intents.
//!
//! One SQLite row per mutation the secondary has not yet confirmed. The
//! coordinator appends; the sync worker claims, applies, and deletes.
//!
//! # Tables
//!
//! ```text
//! outbox                                 outbox_dead_letters
//! ──────────────────────────────────     ──────────────────────────────
//! id             INTEGER PK AUTOINC      (same intent columns)
//! operation_id   TEXT UNIQUE             reason      unknown_entity |
//! model_name     TEXT                                attempts_exhausted |
//! op             create|update|delete                malformed
//! payload        {"data":{},"where":{}}  last_error  TEXT
//! attempts       INTEGER                 dead_at     INTEGER (ms)
//! created_at     INTEGER (ms)
//! ── bookkeeping ──
//! next_attempt_at, last_error, claimed_by, claimed_until
//! ```
//!
//! The intent columns (`operation_id`, `model_name`, `op`, `payload`,
//! `created_at`) are never updated. Only `attempts` and the bookkeeping
//! columns change.
//!
//! # Claiming
//!
//! [`Outbox::claim_due`] leases the oldest due rows in one `UPDATE ...
//! RETURNING`. A row is skipped while an older row of the same model is
//! backing off or leased, so a later mutation of an entity never overtakes
//! an earlier one that has not landed yet.
//!
//! Every later write to a claimed row (`renew_lease`, `release`,
//! `record_failure`, `delete`, `dead_letter`) is conditional on
//! `claimed_by` still naming the caller. Once a lease has expired and another
//! worker has claimed the row, the first worker's writes affect nothing and
//! report `false`.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms).

use crate::config::OutboxConfig;
use crate::error::{MirrorError, Result};
use crate::operation::{NewOperation, OpKind, Payload};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const RECORD_COLUMNS: &str =
    "id, operation_id, model_name, op, payload, attempts, created_at, next_attempt_at, last_error";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "Outbox operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_outbox_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One pending outbox row.
///
/// `op` and `payload` are kept as stored; [`operation`](Self::operation)
/// decodes them.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OperationRecord {
    pub id: i64,
    pub operation_id: String,
    pub model_name: String,
    pub op: String,
    pub payload: String,
    pub attempts: i64,
    pub created_at: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

impl OperationRecord {
    /// Decode `op` and `payload`.
    pub fn operation(&self) -> Result<(OpKind, Payload)> {
        let op = OpKind::from_str(&self.op).map_err(|message| MirrorError::MalformedRecord {
            id: self.id,
            message,
        })?;
        let payload = Payload::from_json(&self.payload).map_err(|e| MirrorError::MalformedRecord {
            id: self.id,
            message: format!("payload: {e}"),
        })?;
        Ok((op, payload))
    }
}

/// Why a row left the outbox without being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    UnknownEntity,
    AttemptsExhausted,
    Malformed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::UnknownEntity => "unknown_entity",
            DeadLetterReason::AttemptsExhausted => "attempts_exhausted",
            DeadLetterReason::Malformed => "malformed",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unknown_entity" => Ok(Self::UnknownEntity),
            "attempts_exhausted" => Ok(Self::AttemptsExhausted),
            "malformed" => Ok(Self::Malformed),
            other => Err(format!("unknown dead-letter reason `{other}`")),
        }
    }
}

/// A row in the dead-letter table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub operation_id: String,
    pub model_name: String,
    pub op: String,
    pub payload: String,
    pub attempts: i64,
    pub created_at: i64,
    pub reason: String,
    pub last_error: Option<String>,
    pub dead_at: i64,
}

impl DeadLetter {
    pub fn reason(&self) -> Option<DeadLetterReason> {
        self.reason.parse().ok()
    }
}

/// Snapshot of outbox depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogStats {
    pub pending: u64,
    pub dead: u64,
    /// `created_at` of the oldest pending row.
    pub oldest_created_at: Option<i64>,
    pub max_attempts: u32,
}

impl BacklogStats {
    /// Age of the oldest pending row relative to `now_ms`.
    pub fn oldest_age(&self, now_ms: i64) -> Option<Duration> {
        self.oldest_created_at
            .map(|created| Duration::from_millis(now_ms.saturating_sub(created).max(0) as u64))
    }
}

/// SQLite-backed outbox.
pub struct Outbox {
    pub(crate) pool: SqlitePool,
    path: String,
}

impl Outbox {
    /// Open (or create) an outbox file with default settings.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let config = OutboxConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..OutboxConfig::default()
        };
        Self::open(&config).await
    }

    /// Open (or create) the outbox described by `config`.
    pub async fn open(config: &OutboxConfig) -> Result<Self> {
        if config.is_in_memory() {
            return Self::in_memory().await;
        }
        let path = config.sqlite_path.clone();
        info!(path = %path, wal = config.wal_mode, "Initializing outbox");

        let journal = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let outbox = Self { pool, path };
        outbox.create_tables().await?;

        let stats = outbox.backlog_stats().await?;
        if stats.pending > 0 || stats.dead > 0 {
            info!(pending = stats.pending, dead = stats.dead, "Restored outbox from previous run");
        }
        Ok(outbox)
    }

    /// Private in-memory outbox (single pooled connection, never recycled).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let outbox = Self {
            pool,
            path: ":memory:".to_string(),
        };
        outbox.create_tables().await?;
        Ok(outbox)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id TEXT NOT NULL UNIQUE,
                model_name TEXT NOT NULL,
                op TEXT NOT NULL CHECK (op IN ('create', 'update', 'delete')),
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                claimed_by TEXT,
                claimed_until INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_model ON outbox (model_name, id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id TEXT NOT NULL UNIQUE,
                model_name TEXT NOT NULL,
                op TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                reason TEXT NOT NULL,
                last_error TEXT,
                dead_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append an intent. Returns the row id.
    pub async fn append(&self, op: &NewOperation) -> std::result::Result<i64, sqlx::Error> {
        let payload = op.payload.to_json().map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let now = now_ms();
        let pool = &self.pool;

        let id = execute_with_retry("outbox_append", || async {
            sqlx::query(
                r#"
                INSERT INTO outbox (operation_id, model_name, op, payload, attempts, created_at, next_attempt_at)
                VALUES (?, ?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(&op.operation_id)
            .bind(&op.model_name)
            .bind(op.op.as_str())
            .bind(&payload)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
            .map(|r| r.last_insert_rowid())
        })
        .await?;

        debug!(
            id,
            operation_id = %op.operation_id,
            entity = %op.model_name,
            op = %op.op,
            "Outbox record appended"
        );
        crate::metrics::record_enqueue(&op.model_name, op.op.as_str());
        Ok(id)
    }

    /// Oldest pending rows, in insertion order, regardless of schedule.
    pub async fn list_oldest(&self, limit: u32) -> Result<Vec<OperationRecord>> {
        let pool = &self.pool;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox ORDER BY id LIMIT ?");
        let rows = execute_with_retry("outbox_list", || async {
            sqlx::query_as::<_, OperationRecord>(&sql)
                .bind(limit as i64)
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(rows)
    }

    /// Lease up to `limit` due rows to `worker` for `lease`.
    pub async fn claim_due(&self, worker: &str, limit: u32, lease: Duration) -> Result<Vec<OperationRecord>> {
        self.claim_due_at(worker, limit, lease, now_ms()).await
    }

    /// [`claim_due`](Self::claim_due) with an explicit clock.
    pub async fn claim_due_at(
        &self,
        worker: &str,
        limit: u32,
        lease: Duration,
        now: i64,
    ) -> Result<Vec<OperationRecord>> {
        let until = now + lease.as_millis() as i64;
        let pool = &self.pool;
        let sql = format!(
            r#"
            UPDATE outbox
            SET claimed_by = ?, claimed_until = ?
            WHERE id IN (
                SELECT o.id FROM outbox o
                WHERE o.next_attempt_at <= ?
                  AND (o.claimed_until IS NULL OR o.claimed_until <= ?)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox p
                      WHERE p.model_name = o.model_name
                        AND p.id < o.id
                        AND (p.next_attempt_at > ? OR (p.claimed_until IS NOT NULL AND p.claimed_until > ?))
                  )
                ORDER BY o.id
                LIMIT ?
            )
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let mut rows = execute_with_retry("outbox_claim", || async {
            sqlx::query_as::<_, OperationRecord>(&sql)
                .bind(worker)
                .bind(until)
                .bind(now)
                .bind(now)
                .bind(now)
                .bind(now)
                .bind(limit as i64)
                .fetch_all(pool)
                .await
        })
        .await?;

        // RETURNING order is unspecified
        rows.sort_by_key(|r| r.id);
        if !rows.is_empty() {
            debug!(worker, claimed = rows.len(), "Claimed outbox rows");
        }
        Ok(rows)
    }

    /// Extend `worker`'s lease on a row to `now + lease`.
    ///
    /// Returns `false` when the row is gone or another worker has claimed
    /// it since; the caller must then leave the row alone.
    pub async fn renew_lease(&self, id: i64, worker: &str, lease: Duration) -> Result<bool> {
        let until = now_ms() + lease.as_millis() as i64;
        let pool = &self.pool;
        let result = execute_with_retry("outbox_renew_lease", || async {
            sqlx::query("UPDATE outbox SET claimed_until = ? WHERE id = ? AND claimed_by = ?")
                .bind(until)
                .bind(id)
                .bind(worker)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop `worker`'s lease without touching attempts.
    ///
    /// Like every row update below, this only touches rows `worker` still
    /// holds and returns `false` when the lease was lost.
    pub async fn release(&self, id: i64, worker: &str) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry("outbox_release", || async {
            sqlx::query("UPDATE outbox SET claimed_by = NULL, claimed_until = NULL WHERE id = ? AND claimed_by = ?")
                .bind(id)
                .bind(worker)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count a failed apply: `attempts + 1`, schedule the next try, drop the lease.
    pub async fn record_failure(&self, id: i64, worker: &str, next_attempt_at: i64, error: &str) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry("outbox_record_failure", || async {
            sqlx::query(
                r#"
                UPDATE outbox
                SET attempts = attempts + 1,
                    next_attempt_at = ?,
                    last_error = ?,
                    claimed_by = NULL,
                    claimed_until = NULL
                WHERE id = ? AND claimed_by = ?
                "#,
            )
            .bind(next_attempt_at)
            .bind(error)
            .bind(id)
            .bind(worker)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove an applied row held by `worker`.
    pub async fn delete(&self, id: i64, worker: &str) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry("outbox_delete", || async {
            sqlx::query("DELETE FROM outbox WHERE id = ? AND claimed_by = ?")
                .bind(id)
                .bind(worker)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a row held by `worker` to the dead-letter table.
    ///
    /// For [`DeadLetterReason::AttemptsExhausted`] the final failed attempt
    /// is counted in the stored `attempts`.
    pub async fn dead_letter(&self, id: i64, worker: &str, reason: DeadLetterReason, error: &str) -> Result<bool> {
        let bump: i64 = if reason == DeadLetterReason::AttemptsExhausted { 1 } else { 0 };
        let now = now_ms();
        let pool = &self.pool;

        let moved = execute_with_retry("outbox_dead_letter", || async {
            let mut tx = pool.begin().await?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO outbox_dead_letters
                    (operation_id, model_name, op, payload, attempts, created_at, reason, last_error, dead_at)
                SELECT operation_id, model_name, op, payload, attempts + ?, created_at, ?, ?, ?
                FROM outbox WHERE id = ? AND claimed_by = ?
                "#,
            )
            .bind(bump)
            .bind(reason.as_str())
            .bind(error)
            .bind(now)
            .bind(id)
            .bind(worker)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if inserted == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            sqlx::query("DELETE FROM outbox WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        })
        .await?;

        if moved {
            crate::metrics::record_dead_letter(reason.as_str());
        }
        Ok(moved)
    }

    /// Most recent dead letters first.
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let pool = &self.pool;
        let rows = execute_with_retry("outbox_dead_letters", || async {
            sqlx::query_as::<_, DeadLetter>(
                r#"
                SELECT id, operation_id, model_name, op, payload, attempts, created_at, reason, last_error, dead_at
                FROM outbox_dead_letters ORDER BY id DESC LIMIT ?
                "#,
            )
            .bind(limit as i64)
            .fetch_all(pool)
            .await
        })
        .await?;
        Ok(rows)
    }

    /// Move a dead letter back to the outbox with `attempts = 0`.
    ///
    /// The row is appended behind anything already pending. Returns `false`
    /// if no dead letter has that operation id.
    pub async fn requeue_dead_letter(&self, operation_id: &str) -> Result<bool> {
        let now = now_ms();
        let pool = &self.pool;

        let moved = execute_with_retry("outbox_requeue", || async {
            let mut tx = pool.begin().await?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO outbox (operation_id, model_name, op, payload, attempts, created_at, next_attempt_at)
                SELECT operation_id, model_name, op, payload, 0, created_at, ?
                FROM outbox_dead_letters WHERE operation_id = ?
                "#,
            )
            .bind(now)
            .bind(operation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            sqlx::query("DELETE FROM outbox_dead_letters WHERE operation_id = ?")
                .bind(operation_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(inserted > 0)
        })
        .await?;

        if moved {
            info!(operation_id, "Dead letter requeued");
        }
        Ok(moved)
    }

    /// Pending/dead counts, oldest pending timestamp and highest attempt count.
    pub async fn backlog_stats(&self) -> Result<BacklogStats> {
        let pool = &self.pool;
        let (pending, oldest, max_attempts): (i64, Option<i64>, Option<i64>) =
            execute_with_retry("outbox_stats", || async {
                sqlx::query_as("SELECT COUNT(*), MIN(created_at), MAX(attempts) FROM outbox")
                    .fetch_one(pool)
                    .await
            })
            .await?;
        let (dead,): (i64,) = execute_with_retry("outbox_stats", || async {
            sqlx::query_as("SELECT COUNT(*) FROM outbox_dead_letters")
                .fetch_one(pool)
                .await
        })
        .await?;

        Ok(BacklogStats {
            pending: pending.max(0) as u64,
            dead: dead.max(0) as u64,
            oldest_created_at: oldest,
            max_attempts: max_attempts.unwrap_or(0).clamp(0, u32::MAX as i64) as u32,
        })
    }

    /// `(attempts, count)` pairs over pending rows, ascending by attempts.
    pub async fn attempts_distribution(&self) -> Result<Vec<(u32, u64)>> {
        let pool = &self.pool;
        let rows: Vec<(i64, i64)> = execute_with_retry("outbox_attempts", || async {
            sqlx::query_as("SELECT attempts, COUNT(*) FROM outbox GROUP BY attempts ORDER BY attempts")
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|(a, n)| (a.max(0) as u32, n.max(0) as u64))
            .collect())
    }

    /// Whether any row for `model_name` is still in the outbox, leased or not.
    pub async fn has_pending(&self, model_name: &str) -> Result<bool> {
        let pool = &self.pool;
        let (exists,): (i64,) = execute_with_retry("outbox_has_pending", || async {
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM outbox WHERE model_name = ?)")
                .bind(model_name)
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(exists != 0)
    }

    /// Distinct model names of pending rows.
    pub async fn model_names(&self) -> Result<Vec<String>> {
        let pool = &self.pool;
        let rows: Vec<(String,)> = execute_with_retry("outbox_models", || async {
            sqlx::query_as("SELECT DISTINCT model_name FROM outbox ORDER BY model_name")
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("outbox_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            error!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Outbox closed");
    }
}

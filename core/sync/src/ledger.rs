//! Transaction Ledger: append-only history of every sync attempt.
//!
//! Rows are only ever inserted. Each status transition of a transaction
//! is a new row, so the full history per entity can be rebuilt even when
//! retries interleave. [`TransactionLedger::archive_before`] is the only
//! path that deletes, and it never touches a transaction that still
//! describes an entity's current standing.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use syncbridge_common::{EntityRef, EntityState, Error, Result};

use crate::db::{format_timestamp, parse_timestamp, storage_err, Database};

/// Identifier of one sync transaction (UUID v4).
pub type TransactionId = String;

/// Status of a sync transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Waiting for a worker (initially, or between retries).
    Pending,
    /// A worker is running a sync cycle.
    InProgress,
    /// Outcome committed everywhere.
    Synced,
    /// Concurrent divergence needing operator action.
    Conflict,
    /// Retries exhausted or a non-retryable error.
    Failed,
}

impl TransactionStatus {
    /// Storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::InProgress => "IN_PROGRESS",
            TransactionStatus::Synced => "SYNCED",
            TransactionStatus::Conflict => "CONFLICT",
            TransactionStatus::Failed => "FAILED",
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Synced | TransactionStatus::Conflict | TransactionStatus::Failed
        )
    }

    /// Allowed transitions of the per-entity state machine.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Synced | Conflict | Failed | Pending)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "IN_PROGRESS" => Ok(TransactionStatus::InProgress),
            "SYNCED" => Ok(TransactionStatus::Synced),
            "CONFLICT" => Ok(TransactionStatus::Conflict),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(Error::Serialization(format!(
                "Unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    pub entity: EntityRef,
    pub status: TransactionStatus,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Terminal row counts for one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub synced: usize,
    pub conflict: usize,
    pub failed: usize,
}

impl StatusCounts {
    /// Total terminal rows.
    pub fn total(&self) -> usize {
        self.synced + self.conflict + self.failed
    }

    /// Fraction of terminal rows that ended SYNCED (1.0 when empty).
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.synced as f64 / total as f64,
        }
    }
}

/// Raw column values before parsing.
struct RawRecord {
    transaction_id: String,
    entity_type: String,
    entity_id: String,
    status: String,
    attempt_count: i64,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
    detail: Option<String>,
    recorded_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            transaction_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            status: row.get(3)?,
            attempt_count: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            error: row.get(7)?,
            detail: row.get(8)?,
            recorded_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<TransactionRecord> {
        Ok(TransactionRecord {
            transaction_id: self.transaction_id,
            entity: EntityRef::new(self.entity_type, self.entity_id)?,
            status: self.status.parse()?,
            attempt_count: self.attempt_count.max(0) as u32,
            started_at: parse_timestamp(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            error: self.error,
            detail: self.detail,
            recorded_at: parse_timestamp(&self.recorded_at)?,
        })
    }
}

const COLUMNS: &str = "transaction_id, entity_type, entity_id, status, attempt_count, \
                       started_at, completed_at, error, detail, recorded_at";

/// Append-only ledger of sync transactions.
#[derive(Clone)]
pub struct TransactionLedger {
    db: Database,
}

impl TransactionLedger {
    /// Create a ledger over the given database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open a transaction for an entity.
    ///
    /// # Postconditions
    /// - Two rows are appended: PENDING (attempt 0), then IN_PROGRESS (attempt 1)
    pub fn begin(&self, entity: &EntityRef) -> Result<TransactionId> {
        let transaction_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        for (status, attempt) in [
            (TransactionStatus::Pending, 0),
            (TransactionStatus::InProgress, 1),
        ] {
            let record = TransactionRecord {
                transaction_id: transaction_id.clone(),
                entity: entity.clone(),
                status,
                attempt_count: attempt,
                started_at: now,
                completed_at: None,
                error: None,
                detail: None,
                recorded_at: Utc::now(),
            };
            insert_row(&tx, &record)?;
        }
        tx.commit().map_err(storage_err)?;

        debug!("Began transaction {} for {}", transaction_id, entity);
        Ok(transaction_id)
    }

    /// Append a status row to an existing transaction.
    ///
    /// # Errors
    /// - `NotFound` if the transaction does not exist
    /// - `InvalidTransition` if the state machine forbids the move
    pub fn record_step(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
        detail: Option<&str>,
        error: Option<&str>,
    ) -> Result<TransactionRecord> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let previous = tx
            .query_row(
                &format!(
                    "SELECT {} FROM transactions WHERE transaction_id = ?1 \
                     ORDER BY row_id DESC LIMIT 1",
                    COLUMNS
                ),
                params![transaction_id],
                RawRecord::from_row,
            )
            .optional()
            .map_err(storage_err)?
            .ok_or_else(|| Error::NotFound(format!("Transaction not found: {}", transaction_id)))?
            .into_record()?;

        if !previous.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                transaction_id: transaction_id.to_string(),
                from: previous.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now();
        let attempt_count = if status == TransactionStatus::InProgress {
            previous.attempt_count + 1
        } else {
            previous.attempt_count
        };

        let record = TransactionRecord {
            transaction_id: previous.transaction_id,
            entity: previous.entity,
            status,
            attempt_count,
            started_at: previous.started_at,
            completed_at: status.is_terminal().then_some(now),
            error: error.map(String::from),
            detail: detail.map(String::from),
            recorded_at: now,
        };
        insert_row(&tx, &record)?;
        tx.commit().map_err(storage_err)?;

        debug!(
            "Transaction {} for {} -> {} (attempt {})",
            record.transaction_id, record.entity, status, attempt_count
        );
        Ok(record)
    }

    /// Most recent row for an entity.
    pub fn latest(&self, entity: &EntityRef) -> Result<Option<TransactionRecord>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM transactions WHERE entity_type = ?1 AND entity_id = ?2 \
                 ORDER BY row_id DESC LIMIT 1",
                COLUMNS
            ),
            params![entity.entity_type(), entity.entity_id()],
            RawRecord::from_row,
        )
        .optional()
        .map_err(storage_err)?
        .map(RawRecord::into_record)
        .transpose()
    }

    /// Full status history of an entity, oldest first.
    pub fn history(&self, entity: &EntityRef) -> Result<Vec<TransactionRecord>> {
        let conn = self.db.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT {} FROM transactions WHERE entity_type = ?1 AND entity_id = ?2 \
                 ORDER BY recorded_at, row_id",
                COLUMNS
            ),
            params![entity.entity_type(), entity.entity_id()],
        )
    }

    /// All rows of one transaction, oldest first.
    pub fn transaction(&self, transaction_id: &str) -> Result<Vec<TransactionRecord>> {
        let conn = self.db.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT {} FROM transactions WHERE transaction_id = ?1 ORDER BY row_id",
                COLUMNS
            ),
            params![transaction_id],
        )
    }

    /// Winning state recorded by the entity's most recent SYNCED row.
    ///
    /// SYNCED rows written after a resolution carry the outcome as JSON
    /// detail; rows without a readable outcome are skipped.
    pub fn last_synced_state(&self, entity: &EntityRef) -> Result<Option<EntityState>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT detail FROM transactions \
                 WHERE entity_type = ?1 AND entity_id = ?2 \
                   AND status = 'SYNCED' AND detail IS NOT NULL \
                 ORDER BY row_id DESC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![entity.entity_type(), entity.entity_id()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage_err)?;

        for row in rows {
            let detail = row.map_err(storage_err)?;
            let state = serde_json::from_str::<serde_json::Value>(&detail)
                .ok()
                .and_then(|value| value.pointer("/outcome/winning_state").cloned())
                .and_then(|state| serde_json::from_value::<EntityState>(state).ok());
            if state.is_some() {
                return Ok(state);
            }
        }
        Ok(None)
    }

    /// Entities whose latest row is PENDING or IN_PROGRESS.
    ///
    /// After a restart these have no worker and no backoff timer.
    pub fn unfinished(&self) -> Result<Vec<EntityRef>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT t.entity_type, t.entity_id FROM transactions t \
                 WHERE t.row_id = (SELECT MAX(t2.row_id) FROM transactions t2 \
                                   WHERE t2.entity_type = t.entity_type \
                                     AND t2.entity_id = t.entity_id) \
                   AND t.status IN ('PENDING', 'IN_PROGRESS') \
                 ORDER BY t.row_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(storage_err)?;

        let mut entities = Vec::new();
        for row in rows {
            let (entity_type, entity_id) = row.map_err(storage_err)?;
            entities.push(EntityRef::new(entity_type, entity_id)?);
        }
        Ok(entities)
    }

    /// Delete the rows of transactions that finished before `cutoff`.
    ///
    /// Two transactions per entity are always kept: the one owning its
    /// latest row, and its latest SYNCED one. Returns the number of rows
    /// removed.
    pub fn archive_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.db.lock()?;
        let removed = conn
            .execute(
                r#"
                DELETE FROM transactions
                WHERE transaction_id IN (
                    SELECT transaction_id FROM transactions
                    WHERE status IN ('SYNCED', 'CONFLICT', 'FAILED') AND recorded_at < ?1
                )
                AND transaction_id NOT IN (
                    SELECT l.transaction_id FROM transactions l
                    WHERE l.row_id = (SELECT MAX(l2.row_id) FROM transactions l2
                                      WHERE l2.entity_type = l.entity_type
                                        AND l2.entity_id = l.entity_id)
                )
                AND transaction_id NOT IN (
                    SELECT s.transaction_id FROM transactions s
                    WHERE s.row_id = (SELECT MAX(s2.row_id) FROM transactions s2
                                      WHERE s2.entity_type = s.entity_type
                                        AND s2.entity_id = s.entity_id
                                        AND s2.status = 'SYNCED')
                )
                "#,
                params![format_timestamp(&cutoff)],
            )
            .map_err(storage_err)?;

        if removed > 0 {
            info!(
                "Archived {} ledger rows finished before {}",
                removed,
                format_timestamp(&cutoff)
            );
        }
        Ok(removed)
    }

    /// Entities whose latest row is FAILED or CONFLICT, newest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<TransactionRecord>> {
        let conn = self.db.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT {} FROM transactions t \
                 WHERE t.row_id = (SELECT MAX(t2.row_id) FROM transactions t2 \
                                   WHERE t2.entity_type = t.entity_type \
                                     AND t2.entity_id = t.entity_id) \
                   AND t.status IN ('FAILED', 'CONFLICT') \
                 ORDER BY t.row_id DESC LIMIT ?1",
                COLUMNS
            ),
            params![limit as i64],
        )
    }

    /// Most recent rows across all entities, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<TransactionRecord>> {
        let conn = self.db.lock()?;
        query_records(
            &conn,
            &format!(
                "SELECT {} FROM transactions ORDER BY row_id DESC LIMIT ?1",
                COLUMNS
            ),
            params![limit as i64],
        )
    }

    /// Terminal row counts per entity type.
    pub fn entity_type_counts(&self) -> Result<BTreeMap<String, StatusCounts>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT entity_type, status, COUNT(*) FROM transactions
                WHERE status IN ('SYNCED', 'CONFLICT', 'FAILED')
                GROUP BY entity_type, status
                "#,
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(storage_err)?;

        let mut counts: BTreeMap<String, StatusCounts> = BTreeMap::new();
        for row in rows {
            let (entity_type, status, count) = row.map_err(storage_err)?;
            let entry = counts.entry(entity_type).or_default();
            match status.parse::<TransactionStatus>()? {
                TransactionStatus::Synced => entry.synced += count as usize,
                TransactionStatus::Conflict => entry.conflict += count as usize,
                TransactionStatus::Failed => entry.failed += count as usize,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Fraction of terminal rows since `cutoff` that ended FAILED.
    ///
    /// CONFLICT rows count toward the total but not as errors. Returns 0.0
    /// when nothing finished in the window.
    pub fn error_rate_since(&self, cutoff: DateTime<Utc>) -> Result<f64> {
        let conn = self.db.lock()?;
        let (total, failed): (i64, i64) = conn
            .query_row(
                r#"
                SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0)
                FROM transactions
                WHERE status IN ('SYNCED', 'CONFLICT', 'FAILED') AND recorded_at >= ?1
                "#,
                params![format_timestamp(&cutoff)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(storage_err)?;

        if total == 0 {
            Ok(0.0)
        } else {
            Ok(failed as f64 / total as f64)
        }
    }

    /// Mean wall-clock duration of SYNCED transactions, in milliseconds.
    pub fn average_duration_ms(&self) -> Result<Option<f64>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT started_at, completed_at FROM transactions \
                 WHERE status = 'SYNCED' AND completed_at IS NOT NULL",
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(storage_err)?;

        let mut total_ms = 0f64;
        let mut count = 0usize;
        for row in rows {
            let (started, completed) = row.map_err(storage_err)?;
            let duration = parse_timestamp(&completed)? - parse_timestamp(&started)?;
            total_ms += duration.num_microseconds().unwrap_or(0) as f64 / 1000.0;
            count += 1;
        }

        Ok((count > 0).then(|| total_ms / count as f64))
    }
}

fn insert_row(conn: &Connection, record: &TransactionRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            COLUMNS
        ),
        params![
            record.transaction_id,
            record.entity.entity_type(),
            record.entity.entity_id(),
            record.status.as_str(),
            record.attempt_count as i64,
            format_timestamp(&record.started_at),
            record.completed_at.as_ref().map(format_timestamp),
            record.error,
            record.detail,
            format_timestamp(&record.recorded_at),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<TransactionRecord>> {
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params, RawRecord::from_row)
        .map_err(storage_err)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(storage_err)?.into_record()?);
    }
    Ok(records)
}

//! Operation Log: durable record of local mutations awaiting sync.
//!
//! A local mutation is only accepted once its operation row is on disk.
//! Rows are marked acknowledged after the transaction that carried them
//! reaches SYNCED, and are physically removed only by [`OperationLog::compact`]
//! or an operator [`OperationLog::clear`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use syncbridge_common::{EntityRef, EntityState, Error, Payload, Result, Source, VersionVector};

use crate::db::{format_timestamp, parse_timestamp, storage_err, Database};
use crate::ledger::{TransactionRecord, TransactionStatus};
use crate::vectors::load_vector;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// Storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    /// Whether the kind carries a payload.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, OperationKind::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(Error::InvalidInput(format!(
                "Unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// A local mutation before it has been stamped and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub payload: Option<Payload>,
}

impl NewOperation {
    /// Create a record.
    pub fn insert(entity: EntityRef, payload: Payload) -> Self {
        Self {
            entity,
            kind: OperationKind::Insert,
            payload: Some(payload),
        }
    }

    /// Change some fields of a record.
    pub fn update(entity: EntityRef, payload: Payload) -> Self {
        Self {
            entity,
            kind: OperationKind::Update,
            payload: Some(payload),
        }
    }

    /// Delete a record.
    pub fn delete(entity: EntityRef) -> Self {
        Self {
            entity,
            kind: OperationKind::Delete,
            payload: None,
        }
    }
}

/// A stored, immutable local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: i64,
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub payload: Option<Payload>,
    /// Vector the mutation was made against, with `local` advanced.
    pub originating_vector: VersionVector,
    pub created_at: DateTime<Utc>,
}

impl Operation {
    /// Apply this operation on top of a prior local state.
    pub fn apply_to(&self, prior: Option<EntityState>) -> EntityState {
        match self.kind {
            OperationKind::Insert => {
                EntityState::Present(self.payload.clone().unwrap_or_default())
            }
            OperationKind::Update => {
                let mut base = match prior {
                    Some(EntityState::Present(payload)) => payload,
                    _ => Payload::new(),
                };
                if let Some(fields) = &self.payload {
                    base.overlay(fields);
                }
                EntityState::Present(base)
            }
            OperationKind::Delete => EntityState::Deleted,
        }
    }
}

struct RawOperation {
    operation_id: i64,
    entity_type: String,
    entity_id: String,
    kind: String,
    payload: Option<String>,
    vector_snapshot: String,
    created_at: String,
}

impl RawOperation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            operation_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            kind: row.get(3)?,
            payload: row.get(4)?,
            vector_snapshot: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_operation(self) -> Result<Operation> {
        Ok(Operation {
            operation_id: self.operation_id,
            entity: EntityRef::new(self.entity_type, self.entity_id)?,
            kind: self.kind.parse()?,
            payload: self
                .payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            originating_vector: serde_json::from_str(&self.vector_snapshot)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

const COLUMNS: &str =
    "operation_id, entity_type, entity_id, kind, payload, vector_snapshot, created_at";

/// Durable log of local operations.
#[derive(Clone)]
pub struct OperationLog {
    db: Database,
}

impl OperationLog {
    /// Create a log over the given database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Durably record a local mutation.
    ///
    /// The operation is stamped with the entity's newest known vector
    /// (stored vector merged with the latest unacknowledged operation's)
    /// with `local` advanced by one.
    ///
    /// # Errors
    /// - `InvalidInput` if an insert or update carries no payload
    /// - `LogUnavailable` if the operation could not be persisted
    pub fn append(&self, op: NewOperation) -> Result<Operation> {
        if op.kind.requires_payload() && op.payload.is_none() {
            return Err(Error::InvalidInput(format!(
                "{} of {} requires a payload",
                op.kind, op.entity
            )));
        }

        let created_at = Utc::now();
        let mut conn = self.db.lock().map_err(unavailable)?;
        let tx = conn.transaction().map_err(log_err)?;

        let mut vector = load_vector(&tx, &op.entity)
            .map_err(unavailable)?
            .unwrap_or_default();
        if let Some(latest) = latest_pending_vector(&tx, &op.entity)? {
            vector.merge(&latest);
        }
        vector.increment(Source::Local);

        let payload_json = op.payload.as_ref().map(serde_json::to_string).transpose()?;
        let vector_json = serde_json::to_string(&vector)?;

        tx.execute(
            r#"
            INSERT INTO operations (entity_type, entity_id, kind, payload, vector_snapshot, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                op.entity.entity_type(),
                op.entity.entity_id(),
                op.kind.as_str(),
                payload_json,
                vector_json,
                format_timestamp(&created_at),
            ],
        )
        .map_err(log_err)?;
        let operation_id = tx.last_insert_rowid();
        tx.commit().map_err(log_err)?;

        debug!(
            "Logged {} #{} for {} at {}",
            op.kind, operation_id, op.entity, vector
        );

        Ok(Operation {
            operation_id,
            entity: op.entity,
            kind: op.kind,
            payload: op.payload,
            originating_vector: vector,
            created_at,
        })
    }

    /// Unacknowledged operations for one entity, in creation order.
    pub fn drain(&self, entity: &EntityRef, max_count: usize) -> Result<Vec<Operation>> {
        let conn = self.db.lock()?;
        query_operations(
            &conn,
            &format!(
                "SELECT {} FROM operations \
                 WHERE entity_type = ?1 AND entity_id = ?2 AND acknowledged = 0 \
                 ORDER BY operation_id LIMIT ?3",
                COLUMNS
            ),
            params![entity.entity_type(), entity.entity_id(), max_count as i64],
        )
    }

    /// Mark an operation applied.
    ///
    /// # Errors
    /// - `NotFound` if no such operation exists
    /// - `InvalidInput` unless `transaction` is SYNCED for the same entity
    pub fn acknowledge(&self, operation_id: i64, transaction: &TransactionRecord) -> Result<()> {
        if transaction.status != TransactionStatus::Synced {
            return Err(Error::InvalidInput(format!(
                "Operation #{} cannot be acknowledged by a {} transaction",
                operation_id, transaction.status
            )));
        }

        let conn = self.db.lock()?;
        let owner = conn
            .query_row(
                "SELECT entity_type, entity_id FROM operations WHERE operation_id = ?1",
                params![operation_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(storage_err)?
            .ok_or_else(|| Error::NotFound(format!("Operation not found: #{}", operation_id)))?;

        if owner.0 != transaction.entity.entity_type() || owner.1 != transaction.entity.entity_id()
        {
            return Err(Error::InvalidInput(format!(
                "Operation #{} belongs to {}/{}, not {}",
                operation_id, owner.0, owner.1, transaction.entity
            )));
        }

        conn.execute(
            "UPDATE operations SET acknowledged = 1 WHERE operation_id = ?1",
            params![operation_id],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Entities with unacknowledged operations, oldest first.
    pub fn pending_entities(&self) -> Result<Vec<EntityRef>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT entity_type, entity_id, MIN(operation_id) AS first_op
                FROM operations WHERE acknowledged = 0
                GROUP BY entity_type, entity_id
                ORDER BY first_op
                "#,
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

    /// Number of unacknowledged operations.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM operations WHERE acknowledged = 0",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    /// Unacknowledged operations, optionally for one entity only.
    pub fn list(&self, entity: Option<&EntityRef>) -> Result<Vec<Operation>> {
        let conn = self.db.lock()?;
        match entity {
            Some(entity) => query_operations(
                &conn,
                &format!(
                    "SELECT {} FROM operations \
                     WHERE entity_type = ?1 AND entity_id = ?2 AND acknowledged = 0 \
                     ORDER BY operation_id",
                    COLUMNS
                ),
                params![entity.entity_type(), entity.entity_id()],
            ),
            None => query_operations(
                &conn,
                &format!(
                    "SELECT {} FROM operations WHERE acknowledged = 0 ORDER BY operation_id",
                    COLUMNS
                ),
                [],
            ),
        }
    }

    /// Drop an entity's unacknowledged operations (operator action).
    ///
    /// Returns the number of operations removed.
    pub fn clear(&self, entity: &EntityRef) -> Result<usize> {
        let conn = self.db.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM operations WHERE entity_type = ?1 AND entity_id = ?2 AND acknowledged = 0",
                params![entity.entity_type(), entity.entity_id()],
            )
            .map_err(storage_err)?;
        info!("Cleared {} pending operations for {}", removed, entity);
        Ok(removed)
    }

    /// Delete acknowledged operations. Returns the number removed.
    pub fn compact(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let removed = conn
            .execute("DELETE FROM operations WHERE acknowledged = 1", [])
            .map_err(storage_err)?;
        debug!("Compacted {} acknowledged operations", removed);
        Ok(removed)
    }
}

fn latest_pending_vector(conn: &Connection, entity: &EntityRef) -> Result<Option<VersionVector>> {
    let raw: Option<String> = conn
        .query_row(
            r#"
            SELECT vector_snapshot FROM operations
            WHERE entity_type = ?1 AND entity_id = ?2 AND acknowledged = 0
            ORDER BY operation_id DESC LIMIT 1
            "#,
            params![entity.entity_type(), entity.entity_id()],
            |row| row.get(0),
        )
        .optional()
        .map_err(log_err)?;

    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Error::from)
}

fn query_operations(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Operation>> {
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params, RawOperation::from_row)
        .map_err(storage_err)?;

    let mut operations = Vec::new();
    for row in rows {
        operations.push(row.map_err(storage_err)?.into_operation()?);
    }
    Ok(operations)
}

fn log_err(err: rusqlite::Error) -> Error {
    Error::LogUnavailable(err.to_string())
}

fn unavailable(err: Error) -> Error {
    match err {
        Error::Storage(msg) => Error::LogUnavailable(msg),
        other => other,
    }
}

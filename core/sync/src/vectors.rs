//! Version Vector Store: durable per-entity causal metadata.

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use syncbridge_common::{CausalOrder, EntityRef, Error, Result, Source, VersionVector};

use crate::db::{storage_err, Database};

/// Durable store of the last committed version vector per entity.
///
/// Writes use optimistic concurrency: a commit names the vector it
/// expects to replace and fails with `StaleWrite` if another writer got
/// there first. An absent vector and an empty vector are the same thing.
#[derive(Clone)]
pub struct VersionVectorStore {
    db: Database,
}

impl VersionVectorStore {
    /// Create a store over the given database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the committed vector for an entity.
    pub fn get(&self, entity: &EntityRef) -> Result<Option<VersionVector>> {
        let conn = self.db.lock()?;
        load_vector(&conn, entity)
    }

    /// Compare two vectors under the causal partial order.
    pub fn compare(v1: &VersionVector, v2: &VersionVector) -> CausalOrder {
        v1.compare(v2)
    }

    /// Atomically replace the stored vector.
    ///
    /// # Preconditions
    /// - `expected` is the vector the caller read before deciding
    ///
    /// # Errors
    /// - `StaleWrite` if the stored vector no longer equals `expected`
    pub fn commit(
        &self,
        entity: &EntityRef,
        expected: Option<&VersionVector>,
        new_vector: &VersionVector,
    ) -> Result<()> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let current = load_vector(&tx, entity)?.unwrap_or_default();
        let expected = expected.cloned().unwrap_or_default();
        if current != expected {
            return Err(Error::StaleWrite {
                entity: entity.to_string(),
            });
        }

        tx.execute(
            "DELETE FROM version_vectors WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity.entity_type(), entity.entity_id()],
        )
        .map_err(storage_err)?;

        for (source, counter) in new_vector.iter() {
            tx.execute(
                r#"
                INSERT INTO version_vectors (entity_type, entity_id, source, counter)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    entity.entity_type(),
                    entity.entity_id(),
                    source.as_str(),
                    counter as i64,
                ],
            )
            .map_err(storage_err)?;
        }

        tx.commit().map_err(storage_err)?;
        debug!("Committed vector {} for {}", new_vector, entity);
        Ok(())
    }

    /// Commit, retrying once against the fresh vector on `StaleWrite`.
    ///
    /// The retry commits `new_vector` merged with whatever the racing
    /// writer stored, so neither side's counters are lost. Returns the
    /// vector actually stored.
    pub fn commit_merging(
        &self,
        entity: &EntityRef,
        expected: Option<&VersionVector>,
        new_vector: &VersionVector,
    ) -> Result<VersionVector> {
        match self.commit(entity, expected, new_vector) {
            Ok(()) => Ok(new_vector.clone()),
            Err(Error::StaleWrite { .. }) => {
                warn!("Stale vector write for {}, retrying against fresh state", entity);
                let fresh = self.get(entity)?;
                let merged = match &fresh {
                    Some(current) => new_vector.merged_with(current),
                    None => new_vector.clone(),
                };
                self.commit(entity, fresh.as_ref(), &merged)?;
                Ok(merged)
            }
            Err(e) => Err(e),
        }
    }

    /// Number of entities with a stored vector.
    pub fn tracked_count(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn
            .query_row(
                r#"
                SELECT COUNT(*) FROM (
                    SELECT DISTINCT entity_type, entity_id FROM version_vectors
                )
                "#,
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count.max(0) as usize)
    }
}

/// Read an entity's vector on an already-locked connection.
pub(crate) fn load_vector(conn: &Connection, entity: &EntityRef) -> Result<Option<VersionVector>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT source, counter FROM version_vectors
            WHERE entity_type = ?1 AND entity_id = ?2
            "#,
        )
        .map_err(storage_err)?;

    let rows = stmt
        .query_map(params![entity.entity_type(), entity.entity_id()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(storage_err)?;

    let mut vector = VersionVector::new();
    for row in rows {
        let (source, counter) = row.map_err(storage_err)?;
        let source: Source = source.parse()?;
        vector.set(source, counter.max(0) as u64);
    }

    if vector.is_empty() {
        Ok(None)
    } else {
        Ok(Some(vector))
    }
}

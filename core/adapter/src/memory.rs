//! In-memory remote adapter for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

use syncbridge_common::{EntityRef, EntityState, Error, Payload, Result, Source, VersionVector};

use crate::adapter::{ChangeBatch, RemoteAdapter, RemoteSnapshot};

/// Failure injected into the next adapter call.
#[derive(Debug, Clone)]
struct InjectedFailure {
    message: String,
    retryable: bool,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<EntityRef, RemoteSnapshot>,
    /// Change feed: (sequence, entity) in arrival order.
    changes: Vec<(u64, EntityRef)>,
    next_seq: u64,
    failures: VecDeque<InjectedFailure>,
    push_count: usize,
}

/// In-memory remote adapter.
///
/// Useful for testing and development. Simulates a remote that stores
/// whatever vector it is pushed and advances its own counter on every
/// write. Remote-side edits are simulated with [`MemoryAdapter::remote_update`],
/// [`MemoryAdapter::remote_delete`] and [`MemoryAdapter::remote_purge`].
pub struct MemoryAdapter {
    source: Source,
    inner: RwLock<Inner>,
}

impl MemoryAdapter {
    /// Create an empty adapter speaking for `source`.
    ///
    /// # Errors
    /// - Returns error if `source` is not a remote
    pub fn new(source: Source) -> Result<Self> {
        if !source.is_remote() {
            return Err(Error::InvalidInput(format!(
                "Memory adapter must represent a remote, got {}",
                source
            )));
        }
        Ok(Self {
            source,
            inner: RwLock::new(Inner::default()),
        })
    }

    /// Simulate an edit made directly on the remote system.
    ///
    /// Returns the remote's new vector for the entity.
    pub async fn remote_update(&self, entity: &EntityRef, payload: Payload) -> VersionVector {
        self.remote_write(entity, EntityState::Present(payload)).await
    }

    /// Simulate a deletion made directly on the remote system.
    pub async fn remote_delete(&self, entity: &EntityRef) -> VersionVector {
        self.remote_write(entity, EntityState::Deleted).await
    }

    /// Simulate a hard delete: the remote forgets the entity entirely and
    /// answers `NotFound` from then on. Returns whether it held the entity.
    pub async fn remote_purge(&self, entity: &EntityRef) -> bool {
        let mut inner = self.inner.write().await;
        let held = inner.records.remove(entity).is_some();
        Self::record_change(&mut inner, entity);
        held
    }

    /// Install a snapshot verbatim (vector included) and record a change.
    pub async fn seed(&self, entity: &EntityRef, snapshot: RemoteSnapshot) {
        let mut inner = self.inner.write().await;
        inner.records.insert(entity.clone(), snapshot);
        Self::record_change(&mut inner, entity);
    }

    /// Make the next `count` calls fail.
    pub async fn fail_next(&self, count: usize, message: impl Into<String>, retryable: bool) {
        let message = message.into();
        let mut inner = self.inner.write().await;
        for _ in 0..count {
            inner.failures.push_back(InjectedFailure {
                message: message.clone(),
                retryable,
            });
        }
    }

    /// Current snapshot without going through failure injection.
    pub async fn snapshot(&self, entity: &EntityRef) -> Option<RemoteSnapshot> {
        self.inner.read().await.records.get(entity).cloned()
    }

    /// Number of successful pushes received.
    pub async fn push_count(&self) -> usize {
        self.inner.read().await.push_count
    }

    async fn remote_write(&self, entity: &EntityRef, state: EntityState) -> VersionVector {
        let mut inner = self.inner.write().await;
        let mut vector = inner
            .records
            .get(entity)
            .map(|r| r.vector.clone())
            .unwrap_or_default();
        vector.increment(self.source);
        inner.records.insert(
            entity.clone(),
            RemoteSnapshot {
                state,
                vector: vector.clone(),
                updated_at: Utc::now(),
            },
        );
        Self::record_change(&mut inner, entity);
        vector
    }

    fn record_change(inner: &mut Inner, entity: &EntityRef) {
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.changes.push((seq, entity.clone()));
    }

    async fn check_failure(&self) -> Result<()> {
        let failure = self.inner.write().await.failures.pop_front();
        match failure {
            Some(f) => Err(Error::Adapter {
                system: self.source,
                message: f.message,
                retryable: f.retryable,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteAdapter for MemoryAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, entity: &EntityRef) -> Result<Option<RemoteSnapshot>> {
        self.check_failure().await?;
        Ok(self.inner.read().await.records.get(entity).cloned())
    }

    async fn push(
        &self,
        entity: &EntityRef,
        state: &EntityState,
        vector: &VersionVector,
    ) -> Result<VersionVector> {
        self.check_failure().await?;

        let mut inner = self.inner.write().await;
        let mut new_vector = inner
            .records
            .get(entity)
            .map(|r| r.vector.merged_with(vector))
            .unwrap_or_else(|| vector.clone());
        new_vector.increment(self.source);

        debug!("{} accepted push for {} at {}", self.source, entity, new_vector);

        inner.records.insert(
            entity.clone(),
            RemoteSnapshot {
                state: state.clone(),
                vector: new_vector.clone(),
                updated_at: Utc::now(),
            },
        );
        inner.push_count += 1;

        Ok(new_vector)
    }

    async fn list_changed_since(&self, cursor: Option<&str>) -> Result<ChangeBatch> {
        self.check_failure().await?;

        let after = match cursor {
            Some(c) => c.parse::<u64>().map_err(|_| {
                Error::adapter_fatal(self.source, format!("Malformed cursor: {}", c))
            })?,
            None => 0,
        };

        let inner = self.inner.read().await;
        let mut entities: Vec<EntityRef> = Vec::new();
        for (seq, entity) in &inner.changes {
            if *seq > after && !entities.contains(entity) {
                entities.push(entity.clone());
            }
        }

        let last = inner.changes.last().map(|(seq, _)| *seq).unwrap_or(after);
        Ok(ChangeBatch {
            entities,
            cursor: Some(last.max(after).to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> EntityRef {
        EntityRef::new("topic", id).unwrap()
    }

    #[test]
    fn test_rejects_local_source() {
        assert!(MemoryAdapter::new(Source::Local).is_err());
    }

    #[tokio::test]
    async fn test_fetch_missing_is_none() {
        let adapter = MemoryAdapter::new(Source::SystemB).unwrap();
        assert!(adapter.fetch(&entity("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_advances_own_counter() {
        let adapter = MemoryAdapter::new(Source::SystemA).unwrap();
        let pushed = VersionVector::from_pairs([(Source::Local, 1)]);
        let state = EntityState::Present(Payload::new().with("title", "Intro"));

        let returned = adapter.push(&entity("1"), &state, &pushed).await.unwrap();
        assert_eq!(
            returned,
            VersionVector::from_pairs([(Source::Local, 1), (Source::SystemA, 1)])
        );

        let snapshot = adapter.fetch(&entity("1")).await.unwrap().unwrap();
        assert_eq!(snapshot.state, state);
        assert_eq!(adapter.push_count().await, 1);
    }

    #[tokio::test]
    async fn test_remote_update_appears_in_change_feed() {
        let adapter = MemoryAdapter::new(Source::SystemB).unwrap();
        adapter.remote_update(&entity("1"), Payload::new()).await;
        adapter.remote_update(&entity("2"), Payload::new()).await;
        adapter.remote_update(&entity("1"), Payload::new()).await;

        let batch = adapter.list_changed_since(None).await.unwrap();
        assert_eq!(batch.entities, vec![entity("1"), entity("2")]);
        assert_eq!(batch.cursor.as_deref(), Some("3"));

        let next = adapter.list_changed_since(batch.cursor.as_deref()).await.unwrap();
        assert!(next.entities.is_empty());
        assert_eq!(next.cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_purge_answers_not_found() {
        let adapter = MemoryAdapter::new(Source::SystemA).unwrap();
        adapter.remote_update(&entity("1"), Payload::new()).await;
        let batch = adapter.list_changed_since(None).await.unwrap();

        assert!(adapter.remote_purge(&entity("1")).await);
        assert!(adapter.fetch(&entity("1")).await.unwrap().is_none());
        assert!(!adapter.remote_purge(&entity("1")).await);

        let next = adapter.list_changed_since(batch.cursor.as_deref()).await.unwrap();
        assert_eq!(next.entities, vec![entity("1")]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let adapter = MemoryAdapter::new(Source::SystemA).unwrap();
        adapter.fail_next(1, "gateway timeout", true).await;

        let err = adapter.fetch(&entity("1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(adapter.fetch(&entity("1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_cursor() {
        let adapter = MemoryAdapter::new(Source::SystemA).unwrap();
        let err = adapter.list_changed_since(Some("abc")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}

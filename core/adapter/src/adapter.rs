//! Remote adapter trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use syncbridge_common::{EntityRef, EntityState, Result, Source, VersionVector};

/// An entity as currently held by a remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Current state (fields or tombstone).
    pub state: EntityState,
    /// Version vector the remote reports for this state.
    pub vector: VersionVector,
    /// Remote-side modification time, used for most-recent tie-breaks.
    pub updated_at: DateTime<Utc>,
}

/// One page of change notifications from a remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Entities changed since the requested cursor.
    pub entities: Vec<EntityRef>,
    /// Cursor to pass to the next call.
    pub cursor: Option<String>,
}

/// Remote adapter trait, implemented once per remote system.
///
/// Implementations handle their own authentication, pagination and rate
/// limiting. Transient failures (timeouts, 5xx-equivalents) must be
/// reported as retryable `Error::Adapter` values.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Which remote this adapter speaks for.
    fn source(&self) -> Source;

    /// Fetch the current state of an entity.
    ///
    /// # Returns
    /// - `Ok(None)` if the entity does not exist on this remote
    ///
    /// # Errors
    /// - Network/transport errors as `Error::Adapter`
    async fn fetch(&self, entity: &EntityRef) -> Result<Option<RemoteSnapshot>>;

    /// Write the winning state to this remote.
    ///
    /// # Preconditions
    /// - `vector` is the resolution's resulting vector
    ///
    /// # Postconditions
    /// - The remote holds `state`
    /// - Returns the remote's new source vector for the entity
    async fn push(
        &self,
        entity: &EntityRef,
        state: &EntityState,
        vector: &VersionVector,
    ) -> Result<VersionVector>;

    /// List entities changed since `cursor` (`None` = from the beginning).
    async fn list_changed_since(&self, cursor: Option<&str>) -> Result<ChangeBatch>;
}

//! Read-only operator surface over the ledger and the queues, plus the
//! manual resync trigger and ledger archiving.
//!
//! Nothing here writes to the operation log.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use syncbridge_common::{EntityRef, Error, Result};

use crate::ledger::{StatusCounts, TransactionRecord};
use crate::orchestrator::{Orchestrator, ResyncDisposition, SyncContext};
use crate::queue::{Priority, QueueDepth};

/// Snapshot of sync health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatistics {
    /// Terminal transaction counts per entity type.
    pub per_entity_type: BTreeMap<String, StatusCounts>,
    /// FAILED share of transactions that finished in the last 24 hours.
    pub error_rate_last_24h: f64,
    pub queue_depth: QueueDepth,
    pub average_sync_duration_ms: Option<f64>,
    /// Unacknowledged local operations.
    pub pending_operations: usize,
    pub scheduled_retries: usize,
    /// Entities that have synced at least once.
    pub tracked_entities: usize,
}

/// Monitoring and control surface.
#[derive(Clone)]
pub struct SyncMonitor {
    ctx: SyncContext,
    orchestrator: Option<Orchestrator>,
}

impl SyncMonitor {
    /// Monitor attached to a running orchestrator.
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            ctx: orchestrator.context().clone(),
            orchestrator: Some(orchestrator),
        }
    }

    /// Monitor over the stores alone, for offline inspection. Queue depth
    /// reads as empty and resync requests are rejected.
    pub fn detached(ctx: SyncContext) -> Self {
        Self {
            ctx,
            orchestrator: None,
        }
    }

    pub async fn get_statistics(&self) -> Result<SyncStatistics> {
        let (queue_depth, scheduled_retries) = match &self.orchestrator {
            Some(orchestrator) => (
                orchestrator.queue_depth().await,
                orchestrator.scheduled_retries().await,
            ),
            None => (QueueDepth::default(), 0),
        };

        Ok(SyncStatistics {
            per_entity_type: self.ctx.ledger.entity_type_counts()?,
            error_rate_last_24h: self
                .ctx
                .ledger
                .error_rate_since(Utc::now() - ChronoDuration::hours(24))?,
            queue_depth,
            average_sync_duration_ms: self.ctx.ledger.average_duration_ms()?,
            pending_operations: self.ctx.oplog.pending_count()?,
            scheduled_retries,
            tracked_entities: self.ctx.vectors.tracked_count()?,
        })
    }

    /// Entities currently FAILED or CONFLICT, newest first.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<TransactionRecord>> {
        self.ctx.ledger.pending(limit)
    }

    /// Re-queue an entity, cancelling any backoff timer.
    ///
    /// # Errors
    /// - `Config` when the monitor is detached
    pub async fn trigger_resync(
        &self,
        entity: EntityRef,
        priority: Priority,
    ) -> Result<ResyncDisposition> {
        let orchestrator = self.orchestrator.as_ref().ok_or_else(|| {
            Error::Config("Resync requires a running orchestrator".to_string())
        })?;
        info!("Operator resync requested for {} at {}", entity, priority);
        Ok(orchestrator.trigger_resync(entity, priority).await)
    }

    /// Full transaction history of an entity, oldest first.
    pub fn get_history(&self, entity: &EntityRef) -> Result<Vec<TransactionRecord>> {
        self.ctx.ledger.history(entity)
    }

    /// Latest ledger rows across every entity, newest first.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<TransactionRecord>> {
        self.ctx.ledger.recent(limit)
    }

    /// Every row of one transaction.
    ///
    /// # Errors
    /// - `NotFound` if the ledger has no such transaction
    pub fn get_transaction(&self, transaction_id: &str) -> Result<Vec<TransactionRecord>> {
        let rows = self.ctx.ledger.transaction(transaction_id)?;
        if rows.is_empty() {
            return Err(Error::NotFound(format!(
                "Transaction not found: {}",
                transaction_id
            )));
        }
        Ok(rows)
    }

    /// Drop ledger history of transactions finished more than `days` ago.
    /// Each entity keeps its current and last successful transaction.
    pub fn archive_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        info!("Archiving ledger history older than {} days", days);
        self.ctx.ledger.archive_before(cutoff)
    }
}

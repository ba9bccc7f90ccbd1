//! SyncBridge sync engine.
//!
//! This module keeps entities consistent between the local client and two
//! remote systems, including:
//! - Per-entity version vectors with optimistic commits
//! - A durable local operation log
//! - Causality-first conflict resolution with per-type strategies
//! - An append-only transaction ledger
//! - Prioritized, retrying sync workers and a periodic remote poller
//! - A read-only monitoring surface with a manual resync trigger

pub mod config;
pub mod conflict;
pub mod db;
pub mod ledger;
pub mod monitor;
pub mod oplog;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod vectors;

// Re-export main types
pub use config::{PolicyConfig, SyncConfig};
pub use conflict::{
    ConflictResolver, ConflictStrategy, EntityPolicy, PolicyMap, ResolutionInput,
    ResolutionOutcome, ResolutionStrategy,
};
pub use db::Database;
pub use ledger::{StatusCounts, TransactionId, TransactionLedger, TransactionRecord, TransactionStatus};
pub use monitor::{SyncMonitor, SyncStatistics};
pub use oplog::{NewOperation, Operation, OperationKind, OperationLog};
pub use orchestrator::{AdapterSet, CycleReport, Orchestrator, ResyncDisposition, SyncContext};
pub use queue::{Priority, QueueConfig, QueueDepth, SyncQueue};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SchedulerHandle, SyncMode};
pub use vectors::VersionVectorStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _queue = SyncQueue::default();
    }
}

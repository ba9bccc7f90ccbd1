//! Background scheduling: the worker pool and the periodic remote poller.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use syncbridge_common::{Error, Result};

use crate::orchestrator::Orchestrator;

/// How remote changes are discovered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Remotes are polled only when asked to.
    #[default]
    Manual,
    /// Poll both remotes at a fixed interval.
    Periodic { interval: Duration },
}

impl SyncMode {
    /// Polling interval, if any.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SyncMode::Periodic { interval } if interval.is_zero() => Err(Error::Config(
                "mode.Periodic.interval must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Running workers and poller. Dropping the handle leaves them running;
/// call [`SchedulerHandle::shutdown`] to stop them.
pub struct SchedulerHandle {
    orchestrator: Orchestrator,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether the periodic poller is running.
    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    /// Stop the workers and the poller, then disarm every backoff timer.
    ///
    /// A cycle already in progress runs to completion first.
    pub async fn shutdown(self) {
        info!("Sync scheduler shutting down");
        let _ = self.shutdown_tx.send(true);

        for task in self.workers.into_iter().chain(self.poller) {
            if let Err(e) = task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }

        self.orchestrator.cancel_all_retries().await;
        info!("Sync scheduler stopped");
    }
}

impl Orchestrator {
    /// Spawn `worker_count` workers, plus the remote poller in periodic
    /// mode. Work left over from an earlier run is queued first; see
    /// [`Orchestrator::enqueue_pending`].
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<SchedulerHandle> {
        let recovered = self.enqueue_pending().await?;
        if recovered > 0 {
            info!("Queued {} entities left over from an earlier run", recovered);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config();

        let workers = (0..config.worker_count)
            .map(|id| tokio::spawn(worker_loop(id, self.clone(), shutdown_rx.clone())))
            .collect();

        let poller = config
            .mode
            .interval()
            .map(|period| tokio::spawn(poll_loop(self.clone(), period, shutdown_rx)));

        info!(
            "Sync scheduler started: {} workers, mode {:?}",
            config.worker_count, config.mode
        );

        Ok(SchedulerHandle {
            orchestrator: self.clone(),
            shutdown_tx,
            workers,
            poller,
        })
    }
}

async fn worker_loop(id: usize, orchestrator: Orchestrator, mut shutdown: watch::Receiver<bool>) {
    debug!("Worker {} started", id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match orchestrator.process_next().await {
            Some(Ok(report)) => {
                debug!(
                    "Worker {} finished {}: {}",
                    id, report.entity, report.status
                );
            }
            Some(Err(e)) => error!("Worker {} cycle aborted: {}", id, e),
            None => {
                tokio::select! {
                    _ = orchestrator.work_available() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("Worker {} stopped", id);
}

async fn poll_loop(orchestrator: Orchestrator, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match orchestrator.poll_remotes().await {
                    Ok(0) => {}
                    Ok(queued) => debug!("Periodic poll queued {} entities", queued),
                    Err(e) => error!("Periodic poll failed: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Remote poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::sleep;

    use syncbridge_adapter::{MemoryAdapter, RemoteAdapter};
    use syncbridge_common::{EntityRef, EntityState, Payload, Source};

    use crate::config::SyncConfig;
    use crate::conflict::{ConflictStrategy, EntityPolicy};
    use crate::db::Database;
    use crate::ledger::TransactionStatus;
    use crate::oplog::OperationKind;
    use crate::orchestrator::AdapterSet;
    use crate::queue::Priority;
    use crate::retry::RetryConfig;

    struct Harness {
        orchestrator: Orchestrator,
        system_a: Arc<MemoryAdapter>,
        system_b: Arc<MemoryAdapter>,
    }

    fn harness(mode: SyncMode) -> Harness {
        let mut config = SyncConfig {
            worker_count: 2,
            mode,
            retry: RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
            ..Default::default()
        };
        config.policies.entity_types.push("assignment".to_string());
        config.policies.policies.insert(
            "assignment".to_string(),
            EntityPolicy::new(ConflictStrategy::PreferMostRecent),
        );

        let system_a = Arc::new(MemoryAdapter::new(Source::SystemA).unwrap());
        let system_b = Arc::new(MemoryAdapter::new(Source::SystemB).unwrap());
        let adapters = AdapterSet::new(system_a.clone(), system_b.clone()).unwrap();
        let orchestrator =
            Orchestrator::new(Database::in_memory().unwrap(), adapters, config).unwrap();

        Harness {
            orchestrator,
            system_a,
            system_b,
        }
    }

    fn assignment(id: &str) -> EntityRef {
        EntityRef::new("assignment", id).unwrap()
    }

    async fn wait_for_state(adapter: &MemoryAdapter, entity: &EntityRef, expected: &EntityState) {
        for _ in 0..500 {
            if let Ok(Some(snapshot)) = adapter.fetch(entity).await {
                if &snapshot.state == expected {
                    return;
                }
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("{} never reached {:?}", entity, expected);
    }

    #[test]
    fn test_mode_validation() {
        assert!(SyncMode::Manual.validate().is_ok());
        assert!(SyncMode::Periodic {
            interval: Duration::from_secs(5)
        }
        .validate()
        .is_ok());
        assert!(matches!(
            SyncMode::Periodic {
                interval: Duration::ZERO
            }
            .validate(),
            Err(Error::Config(_))
        ));
        assert_eq!(SyncMode::default().interval(), None);
    }

    #[tokio::test]
    async fn test_workers_sync_local_changes() {
        let h = harness(SyncMode::Manual);
        let handle = h.orchestrator.start().await.unwrap();
        assert_eq!(handle.worker_count(), 2);
        assert!(!handle.is_polling());

        let entity = assignment("1");
        let payload = Payload::new().with("title", "Lab report");
        h.orchestrator
            .record_local_change(
                entity.clone(),
                OperationKind::Insert,
                Some(payload.clone()),
                Priority::High,
            )
            .await
            .unwrap();

        let expected = EntityState::Present(payload);
        wait_for_state(&h.system_a, &entity, &expected).await;
        wait_for_state(&h.system_b, &entity, &expected).await;

        handle.shutdown().await;

        let latest = h.orchestrator.context().ledger.latest(&entity).unwrap().unwrap();
        assert_eq!(latest.status, TransactionStatus::Synced);
    }

    #[tokio::test]
    async fn test_start_recovers_unsynced_operations() {
        let h = harness(SyncMode::Manual);
        let entity = assignment("2");
        h.orchestrator
            .context()
            .oplog
            .append(crate::oplog::NewOperation::insert(
                entity.clone(),
                Payload::new().with("title", "Left over"),
            ))
            .unwrap();

        let handle = h.orchestrator.start().await.unwrap();
        wait_for_state(
            &h.system_b,
            &entity,
            &EntityState::Present(Payload::new().with("title", "Left over")),
        )
        .await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_poller_picks_up_remote_edits() {
        let h = harness(SyncMode::Periodic {
            interval: Duration::from_millis(10),
        });
        let handle = h.orchestrator.start().await.unwrap();
        assert!(handle.is_polling());

        let entity = assignment("3");
        let payload = Payload::new().with("title", "Posted on A");
        h.system_a.remote_update(&entity, payload.clone()).await;

        wait_for_state(&h.system_b, &entity, &EntityState::Present(payload)).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_processing() {
        let h = harness(SyncMode::Manual);
        let handle = h.orchestrator.start().await.unwrap();
        handle.shutdown().await;

        h.orchestrator
            .record_local_change(
                assignment("4"),
                OperationKind::Insert,
                Some(Payload::new().with("title", "Too late")),
                Priority::High,
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        assert_eq!(h.orchestrator.queue_depth().await.high, 1);
        assert_eq!(h.system_a.push_count().await, 0);
    }
}

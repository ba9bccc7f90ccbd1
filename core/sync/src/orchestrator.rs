//! Sync orchestrator: drives queued entities through fetch, resolve,
//! push, commit and ledger finalization.
//!
//! Per-entity state machine, as recorded in the ledger:
//!
//! ```text
//! PENDING -> IN_PROGRESS -> SYNCED
//!                        -> CONFLICT
//!                        -> FAILED
//!                        -> PENDING (retryable, backoff timer armed)
//! ```

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use syncbridge_adapter::RemoteAdapter;
use syncbridge_common::{EntityRef, Error, Payload, Result, Source, VersionVector};

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, PolicyMap, ResolutionInput, ResolutionOutcome};
use crate::db::Database;
use crate::ledger::{TransactionId, TransactionLedger, TransactionStatus};
use crate::oplog::{NewOperation, Operation, OperationKind, OperationLog};
use crate::queue::{Priority, QueueDepth, SyncQueue};
use crate::retry::RetryExecutor;
use crate::vectors::VersionVectorStore;

/// Handles to the durable stores and the resolver.
#[derive(Clone)]
pub struct SyncContext {
    pub db: Database,
    pub vectors: VersionVectorStore,
    pub oplog: OperationLog,
    pub ledger: TransactionLedger,
    pub resolver: ConflictResolver,
}

impl SyncContext {
    pub fn new(db: Database, policies: PolicyMap) -> Self {
        Self {
            vectors: VersionVectorStore::new(db.clone()),
            oplog: OperationLog::new(db.clone()),
            ledger: TransactionLedger::new(db.clone()),
            resolver: ConflictResolver::new(policies),
            db,
        }
    }
}

/// The two remote adapters.
#[derive(Clone)]
pub struct AdapterSet {
    system_a: Arc<dyn RemoteAdapter>,
    system_b: Arc<dyn RemoteAdapter>,
}

impl AdapterSet {
    /// # Errors
    /// - `Config` if an adapter speaks for the wrong source
    pub fn new(system_a: Arc<dyn RemoteAdapter>, system_b: Arc<dyn RemoteAdapter>) -> Result<Self> {
        for (adapter, expected) in [(&system_a, Source::SystemA), (&system_b, Source::SystemB)] {
            if adapter.source() != expected {
                return Err(Error::Config(format!(
                    "Adapter for {} reports source {}",
                    expected,
                    adapter.source()
                )));
            }
        }
        Ok(Self { system_a, system_b })
    }

    /// Adapter for a remote source.
    pub fn remote(&self, source: Source) -> Result<&Arc<dyn RemoteAdapter>> {
        match source {
            Source::SystemA => Ok(&self.system_a),
            Source::SystemB => Ok(&self.system_b),
            Source::Local => Err(Error::InvalidInput(
                "Local has no remote adapter".to_string(),
            )),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn RemoteAdapter>> {
        [&self.system_a, &self.system_b].into_iter()
    }
}

/// One in-process lock per entity, held for a whole sync cycle.
#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<EntityRef, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    /// Wait for exclusive use of an entity.
    pub async fn acquire(&self, entity: &EntityRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(entity.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Release a lock and forget it if nobody else is waiting.
    pub async fn release(&self, entity: &EntityRef, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().await;
        if locks.get(entity).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(entity);
        }
    }

    /// Number of entities currently locked or awaited.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Result of one sync cycle for one entity.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub entity: EntityRef,
    pub transaction_id: TransactionId,
    /// Status the cycle ended in; PENDING means a retry is scheduled.
    pub status: TransactionStatus,
    pub attempt: u32,
    pub outcome: Option<ResolutionOutcome>,
    pub error: Option<String>,
}

/// What happened to a manual resync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncDisposition {
    /// Queued now; `cancelled_retry` if a backoff timer was dropped.
    Queued { cancelled_retry: bool },
    /// A cycle is in flight; the request runs once it finishes.
    Deferred,
}

#[derive(Serialize)]
struct SyncedDetail<'a> {
    outcome: &'a ResolutionOutcome,
    committed_vector: &'a VersionVector,
    operations: &'a [i64],
}

/// A cycle that got as far as committing.
struct Applied {
    outcome: ResolutionOutcome,
    committed: VersionVector,
    operations: Vec<i64>,
}

#[derive(Default)]
struct Flight {
    active: HashSet<EntityRef>,
    deferred: HashMap<EntityRef, Priority>,
}

struct Shared {
    ctx: SyncContext,
    adapters: AdapterSet,
    config: SyncConfig,
    queue: Mutex<SyncQueue>,
    work: Notify,
    locks: EntityLocks,
    flight: Mutex<Flight>,
    timers: Mutex<HashMap<EntityRef, JoinHandle<()>>>,
    outcomes: broadcast::Sender<ResolutionOutcome>,
    poll_retry: RetryExecutor,
}

/// Multi-source sync orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Validate the config and build an orchestrator over `db`.
    pub fn new(db: Database, adapters: AdapterSet, config: SyncConfig) -> Result<Self> {
        let policies = config.validate()?;
        Ok(Self::with_context(SyncContext::new(db, policies), adapters, config))
    }

    /// Build from an existing context. The config is not re-validated.
    pub fn with_context(ctx: SyncContext, adapters: AdapterSet, config: SyncConfig) -> Self {
        let (outcomes, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                ctx,
                adapters,
                queue: Mutex::new(SyncQueue::new(config.queue)),
                work: Notify::new(),
                locks: EntityLocks::default(),
                flight: Mutex::new(Flight::default()),
                timers: Mutex::new(HashMap::new()),
                outcomes,
                poll_retry: RetryExecutor::new(config.retry.clone()),
                config,
            }),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.shared.ctx
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Subscribe to outcomes the local client must apply.
    pub fn subscribe(&self) -> broadcast::Receiver<ResolutionOutcome> {
        self.shared.outcomes.subscribe()
    }

    /// Record a local mutation and queue the entity.
    ///
    /// # Errors
    /// - `LogUnavailable` if the mutation could not be made durable
    /// - `InvalidInput` if an insert or update has no payload
    pub async fn record_local_change(
        &self,
        entity: EntityRef,
        kind: OperationKind,
        payload: Option<Payload>,
        priority: Priority,
    ) -> Result<Operation> {
        let operation = self.shared.ctx.oplog.append(NewOperation {
            entity: entity.clone(),
            kind,
            payload,
        })?;
        self.enqueue(entity, priority).await;
        Ok(operation)
    }

    /// Queue an entity for sync. Returns `false` if it was already queued
    /// at the same or a higher priority, or is waiting out a backoff delay.
    ///
    /// An entity in backoff is requeued by its timer; only
    /// [`Orchestrator::trigger_resync`] cuts the delay short.
    pub async fn enqueue(&self, entity: EntityRef, priority: Priority) -> bool {
        let timers = self.shared.timers.lock().await;
        if timers.contains_key(&entity) {
            debug!("{} is backing off; left to its retry timer", entity);
            return false;
        }
        let queued = self.shared.queue.lock().await.push(entity, priority);
        drop(timers);
        if queued {
            self.shared.work.notify_one();
        }
        queued
    }

    /// Manually re-queue an entity, dropping any pending backoff timer.
    ///
    /// If a worker is mid-cycle on the entity the request is held and
    /// applied after that cycle finalizes.
    pub async fn trigger_resync(&self, entity: EntityRef, priority: Priority) -> ResyncDisposition {
        {
            let mut flight = self.shared.flight.lock().await;
            if flight.active.contains(&entity) {
                let requested = flight.deferred.entry(entity.clone()).or_insert(priority);
                if priority < *requested {
                    *requested = priority;
                }
                info!("Resync of {} deferred until the current cycle finishes", entity);
                return ResyncDisposition::Deferred;
            }
        }

        let cancelled_retry = self.cancel_retry(&entity).await;
        info!("Resync of {} queued at {}", entity, priority);
        self.enqueue(entity, priority).await;
        ResyncDisposition::Queued { cancelled_retry }
    }

    /// Pop and sync the next queued entity. `None` when the queue is empty.
    pub async fn process_next(&self) -> Option<Result<CycleReport>> {
        let entry = self.shared.queue.lock().await.pop()?;
        Some(self.run_entity(entry.entity, entry.priority).await)
    }

    /// Sync one entity now, outside the queue. Drops any backoff timer.
    pub async fn sync_entity(&self, entity: &EntityRef) -> Result<CycleReport> {
        self.cancel_retry(entity).await;
        self.run_entity(entity.clone(), Priority::High).await
    }

    /// Process queued entities until the queue is empty.
    ///
    /// Entries whose retry timers fire later are not waited for.
    pub async fn run_until_idle(&self) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        while let Some(result) = self.process_next().await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => error!("Sync cycle aborted: {}", e),
            }
        }
        reports
    }

    /// Ask both remotes what changed since their stored cursors and
    /// queue those entities at background priority.
    ///
    /// A remote that keeps failing is skipped until the next poll.
    /// Returns the number of entities newly queued.
    pub async fn poll_remotes(&self) -> Result<usize> {
        let db = &self.shared.ctx.db;
        let mut queued = 0;

        for adapter in self.shared.adapters.iter() {
            let source = adapter.source();
            let cursor = db.load_cursor(source)?;

            let batch = match self
                .shared
                .poll_retry
                .execute(|| adapter.list_changed_since(cursor.as_deref()))
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Polling {} failed: {}", source, e);
                    continue;
                }
            };

            let changed = batch.entities.len();
            for entity in batch.entities {
                if self.enqueue(entity, Priority::Background).await {
                    queued += 1;
                }
            }
            if let Some(next) = batch.cursor {
                db.save_cursor(source, &next)?;
            }
            debug!("{} reported {} changed entities", source, changed);
        }

        Ok(queued)
    }

    /// Queue every entity with unacknowledged local operations or an
    /// unfinished transaction.
    ///
    /// Entities whose last transaction ended CONFLICT or FAILED are left
    /// for an operator to resync.
    pub async fn enqueue_pending(&self) -> Result<usize> {
        let ctx = &self.shared.ctx;
        let mut entities = ctx.oplog.pending_entities()?;
        for entity in ctx.ledger.unfinished()? {
            if !entities.contains(&entity) {
                entities.push(entity);
            }
        }

        let mut queued = 0;
        for entity in entities {
            let parked = ctx.ledger.latest(&entity)?.is_some_and(|record| {
                matches!(
                    record.status,
                    TransactionStatus::Conflict | TransactionStatus::Failed
                )
            });
            if parked {
                debug!("{} awaits a manual resync; not queued", entity);
                continue;
            }
            if self.enqueue(entity, Priority::High).await {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub async fn queue_depth(&self) -> QueueDepth {
        self.shared.queue.lock().await.depth()
    }

    /// Number of backoff timers currently armed.
    pub async fn scheduled_retries(&self) -> usize {
        self.shared.timers.lock().await.len()
    }

    /// Abort every armed backoff timer.
    pub async fn cancel_all_retries(&self) {
        let mut timers = self.shared.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Wait until new work is queued.
    pub(crate) async fn work_available(&self) {
        self.shared.work.notified().await;
    }

    async fn run_entity(&self, entity: EntityRef, priority: Priority) -> Result<CycleReport> {
        let guard = self.shared.locks.acquire(&entity).await;
        self.shared.flight.lock().await.active.insert(entity.clone());

        let result = self.run_cycle(&entity, priority).await;

        let deferred = {
            let mut flight = self.shared.flight.lock().await;
            flight.active.remove(&entity);
            flight.deferred.remove(&entity)
        };
        self.shared.locks.release(&entity, guard).await;

        if let Some(priority) = deferred {
            self.cancel_retry(&entity).await;
            info!("Applying deferred resync of {} at {}", entity, priority);
            self.enqueue(entity, priority).await;
        }

        result
    }

    async fn run_cycle(&self, entity: &EntityRef, priority: Priority) -> Result<CycleReport> {
        let ledger = &self.shared.ctx.ledger;
        let (transaction_id, attempt) = match ledger.latest(entity)? {
            Some(record) if record.status == TransactionStatus::Pending => {
                let step = ledger.record_step(
                    &record.transaction_id,
                    TransactionStatus::InProgress,
                    None,
                    None,
                )?;
                (step.transaction_id, step.attempt_count)
            }
            Some(record) if record.status == TransactionStatus::InProgress => {
                // Left behind by a cycle that never finished.
                ledger.record_step(
                    &record.transaction_id,
                    TransactionStatus::Failed,
                    None,
                    Some("cycle abandoned"),
                )?;
                (ledger.begin(entity)?, 1)
            }
            _ => (ledger.begin(entity)?, 1),
        };

        debug!(
            "Sync cycle for {} (transaction {}, attempt {})",
            entity, transaction_id, attempt
        );

        let result = self.attempt(entity).await;
        self.finalize(entity, priority, transaction_id, attempt, result)
            .await
    }

    /// Fetch, resolve, push and commit. `Ok(None)` when no source holds
    /// any state for the entity.
    async fn attempt(&self, entity: &EntityRef) -> Result<Option<Applied>> {
        let ctx = &self.shared.ctx;
        let adapters = &self.shared.adapters;

        let operations = ctx.oplog.drain(entity, self.shared.config.batch_size)?;
        let last_known = ctx.vectors.get(entity)?;
        let last_synced_state = ctx.ledger.last_synced_state(entity)?;

        let (system_a, system_b) = futures::future::try_join(
            adapters.system_a.fetch(entity),
            adapters.system_b.fetch(entity),
        )
        .await?;

        let input = ResolutionInput {
            entity,
            local_ops: &operations,
            system_a: system_a.as_ref(),
            system_b: system_b.as_ref(),
            last_known: last_known.as_ref(),
            last_synced_state: last_synced_state.as_ref(),
        };
        if !input.has_state() {
            return Ok(None);
        }
        for source in Source::REMOTES {
            if input.vanished(source) {
                debug!("{} no longer has {}; treating it as deleted", source, entity);
            }
        }

        let outcome = ctx.resolver.resolve(&input)?;

        let state = &outcome.winning_state;
        let vector = &outcome.resulting_vector;
        let pushes = outcome.remote_losers().map(|source| async move {
            let adapter = adapters.remote(source)?;
            debug!("Pushing {} to {}", entity, source);
            adapter.push(entity, state, vector).await
        });
        let returned = futures::future::try_join_all(pushes).await?;

        let mut committed = outcome.resulting_vector.clone();
        for source_vector in &returned {
            committed.merge(source_vector);
        }
        let committed = ctx
            .vectors
            .commit_merging(entity, last_known.as_ref(), &committed)?;

        Ok(Some(Applied {
            outcome,
            committed,
            operations: operations.iter().map(|op| op.operation_id).collect(),
        }))
    }

    async fn finalize(
        &self,
        entity: &EntityRef,
        priority: Priority,
        transaction_id: TransactionId,
        attempt: u32,
        result: Result<Option<Applied>>,
    ) -> Result<CycleReport> {
        let ctx = &self.shared.ctx;
        let mut report = CycleReport {
            entity: entity.clone(),
            transaction_id,
            status: TransactionStatus::Synced,
            attempt,
            outcome: None,
            error: None,
        };

        match result {
            Ok(Some(applied)) => {
                let detail = serde_json::to_string(&SyncedDetail {
                    outcome: &applied.outcome,
                    committed_vector: &applied.committed,
                    operations: &applied.operations,
                })?;
                let record = ctx.ledger.record_step(
                    &report.transaction_id,
                    TransactionStatus::Synced,
                    Some(&detail),
                    None,
                )?;
                for operation_id in &applied.operations {
                    ctx.oplog.acknowledge(*operation_id, &record)?;
                }

                info!(
                    "Synced {} via {} (attempt {}, vector {})",
                    entity, applied.outcome.strategy_used, attempt, applied.committed
                );

                if applied.outcome.local_lost() {
                    let _ = self.shared.outcomes.send(applied.outcome.clone());
                }
                if !ctx.oplog.drain(entity, 1)?.is_empty() {
                    self.enqueue(entity.clone(), Priority::High).await;
                }
                report.outcome = Some(applied.outcome);
            }
            Ok(None) => {
                ctx.ledger.record_step(
                    &report.transaction_id,
                    TransactionStatus::Synced,
                    Some("no state on any source"),
                    None,
                )?;
                debug!("Nothing to sync for {}", entity);
            }
            Err(err @ Error::UnresolvableConflict { .. }) => {
                warn!("Conflict on {}: {}", entity, err);
                let message = err.to_string();
                ctx.ledger.record_step(
                    &report.transaction_id,
                    TransactionStatus::Conflict,
                    None,
                    Some(&message),
                )?;
                report.status = TransactionStatus::Conflict;
                report.error = Some(message);
            }
            Err(err) if err.is_retryable() && self.shared.config.retry.allows_retry(attempt) => {
                let delay = self.shared.config.retry.delay_for_attempt(attempt - 1);
                warn!(
                    "Attempt {} for {} failed: {}. Retrying in {:?}",
                    attempt, entity, err, delay
                );
                let message = err.to_string();
                ctx.ledger.record_step(
                    &report.transaction_id,
                    TransactionStatus::Pending,
                    None,
                    Some(&message),
                )?;
                self.schedule_retry(entity, priority, delay).await;
                report.status = TransactionStatus::Pending;
                report.error = Some(message);
            }
            Err(err) => {
                error!("Sync of {} failed after {} attempts: {}", entity, attempt, err);
                let message = err.to_string();
                ctx.ledger.record_step(
                    &report.transaction_id,
                    TransactionStatus::Failed,
                    None,
                    Some(&message),
                )?;
                report.status = TransactionStatus::Failed;
                report.error = Some(message);
            }
        }

        Ok(report)
    }

    async fn schedule_retry(&self, entity: &EntityRef, priority: Priority, delay: Duration) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let target = entity.clone();

        let mut timers = self.shared.timers.lock().await;
        // Whatever was queued while the cycle ran waits for the timer too.
        self.shared.queue.lock().await.remove(entity);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                let orchestrator = Orchestrator { shared };
                orchestrator.shared.timers.lock().await.remove(&target);
                debug!("Backoff elapsed for {}", target);
                orchestrator.enqueue(target, priority).await;
            }
        });
        if let Some(previous) = timers.insert(entity.clone(), handle) {
            previous.abort();
        }
    }

    /// Abort an entity's backoff timer. Returns whether one was armed.
    async fn cancel_retry(&self, entity: &EntityRef) -> bool {
        match self.shared.timers.lock().await.remove(entity) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

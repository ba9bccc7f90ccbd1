//! Conflict detection and resolution.
//!
//! The resolver is a pure function over what each source currently
//! holds. Causality decides whenever it can; a configured per-entity-type
//! strategy only runs when the candidates' vectors are concurrent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use syncbridge_adapter::RemoteSnapshot;
use syncbridge_common::{
    CausalOrder, EntityRef, EntityState, Error, Payload, Result, Source, VersionVector,
};

use crate::oplog::Operation;

/// Conflict resolution strategy for concurrent divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Take System A's version.
    PreferSystemA,
    /// Take System B's version.
    PreferSystemB,
    /// Take the most recently modified version.
    PreferMostRecent,
    /// Field-level union, System A first.
    MergePreferSystemA,
    /// Field-level union, System B first.
    MergePreferSystemB,
    /// Never resolve automatically.
    Manual,
}

/// Conflict handling for one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPolicy {
    pub strategy: ConflictStrategy,
    /// A deletion on any concurrent source beats updates elsewhere.
    #[serde(default = "default_delete_wins")]
    pub delete_wins: bool,
}

fn default_delete_wins() -> bool {
    true
}

impl EntityPolicy {
    /// Policy with the default delete handling.
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            delete_wins: true,
        }
    }

    /// Let concurrent updates survive a deletion.
    pub fn without_delete_wins(mut self) -> Self {
        self.delete_wins = false;
        self
    }
}

/// Policies keyed by entity type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyMap {
    policies: HashMap<String, EntityPolicy>,
}

impl PolicyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, entity_type: impl Into<String>, policy: EntityPolicy) -> Self {
        self.insert(entity_type, policy);
        self
    }

    pub fn insert(&mut self, entity_type: impl Into<String>, policy: EntityPolicy) {
        self.policies.insert(entity_type.into(), policy);
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntityPolicy> {
        self.policies.get(entity_type)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// How a resolution was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Every source already agrees; nothing to write.
    InSync,
    /// Local changes causally follow every remote.
    LocalWins,
    /// A remote causally follows local; local is overwritten.
    FastForward,
    /// A concurrent deletion beat updates elsewhere.
    DeleteWins,
    /// A configured strategy settled concurrent divergence.
    Policy(ConflictStrategy),
    /// Nothing changed since the last sync, but the sources disagree and
    /// the laggards are brought back in line.
    Reconcile,
}

impl ResolutionStrategy {
    /// Whether a conflict strategy (including delete-wins) was applied.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ResolutionStrategy::DeleteWins | ResolutionStrategy::Policy(_)
        )
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::InSync => f.write_str("in-sync"),
            ResolutionStrategy::LocalWins => f.write_str("local-wins"),
            ResolutionStrategy::FastForward => f.write_str("fast-forward"),
            ResolutionStrategy::DeleteWins => f.write_str("delete-wins"),
            ResolutionStrategy::Policy(strategy) => write!(f, "policy:{:?}", strategy),
            ResolutionStrategy::Reconcile => f.write_str("reconcile"),
        }
    }
}

/// Everything the resolver looks at for one entity.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionInput<'a> {
    pub entity: &'a EntityRef,
    /// Unacknowledged local operations, in creation order.
    pub local_ops: &'a [Operation],
    pub system_a: Option<&'a RemoteSnapshot>,
    pub system_b: Option<&'a RemoteSnapshot>,
    /// Vector committed by the last successful sync.
    pub last_known: Option<&'a VersionVector>,
    /// State the last successful sync settled on. `None` if unrecorded.
    pub last_synced_state: Option<&'a EntityState>,
}

impl<'a> ResolutionInput<'a> {
    fn remote(&self, source: Source) -> Option<&'a RemoteSnapshot> {
        match source {
            Source::SystemA => self.system_a,
            Source::SystemB => self.system_b,
            Source::Local => None,
        }
    }

    /// A remote answered `NotFound` although the last sync left the entity
    /// on it. Remotes report hard deletes this way.
    ///
    /// A remote advances its own counter on every write it accepts, so a
    /// non-zero counter in the stored vector means it held the entity.
    pub fn vanished(&self, source: Source) -> bool {
        source.is_remote()
            && self.remote(source).is_none()
            && self.last_known.is_some_and(|known| known.get(source) > 0)
            && !self.last_synced_state.is_some_and(EntityState::is_deleted)
    }

    /// Whether any source contributes something to resolve.
    pub fn has_state(&self) -> bool {
        !self.local_ops.is_empty()
            || Source::REMOTES
                .into_iter()
                .any(|source| self.remote(source).is_some() || self.vanished(source))
    }
}

/// Result of resolving one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub entity: EntityRef,
    pub winning_state: EntityState,
    /// `None` when the winning state is a merge of several sources.
    pub winning_source: Option<Source>,
    pub strategy_used: ResolutionStrategy,
    /// Sources that must be brought up to `winning_state`.
    pub losing_sources: BTreeSet<Source>,
    pub resulting_vector: VersionVector,
}

impl ResolutionOutcome {
    /// Whether the local client must adopt the winning state.
    pub fn local_lost(&self) -> bool {
        self.losing_sources.contains(&Source::Local)
    }

    /// Remotes that need a push.
    pub fn remote_losers(&self) -> impl Iterator<Item = Source> + '_ {
        self.losing_sources.iter().copied().filter(Source::is_remote)
    }
}

/// One source's current version of the entity.
#[derive(Debug, Clone)]
struct Candidate {
    source: Source,
    state: EntityState,
    vector: VersionVector,
    timestamp: DateTime<Utc>,
}

impl Candidate {
    /// A remote whose vector the last committed vector already covers.
    fn is_stale(&self, last_known: Option<&VersionVector>) -> bool {
        self.source.is_remote()
            && last_known.is_some_and(|known| {
                matches!(
                    self.vector.compare(known),
                    CausalOrder::Before | CausalOrder::Equal
                )
            })
    }

    /// Local > SystemA > SystemB on exact timestamp ties.
    fn tie_rank(&self) -> u8 {
        match self.source {
            Source::Local => 2,
            Source::SystemA => 1,
            Source::SystemB => 0,
        }
    }
}

/// Stateless decision function over per-source candidates.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policies: PolicyMap,
}

impl ConflictResolver {
    /// Create a resolver with the given per-type policies.
    pub fn new(policies: PolicyMap) -> Self {
        Self { policies }
    }

    /// Decide the winning state for an entity.
    ///
    /// # Errors
    /// - `InvalidInput` if no source holds any state for the entity
    /// - `UnresolvableConflict` if vectors are concurrent and the entity
    ///   type has no automatic strategy
    pub fn resolve(&self, input: &ResolutionInput<'_>) -> Result<ResolutionOutcome> {
        let candidates = Self::candidates(input);
        if candidates.is_empty() {
            return Err(Error::InvalidInput(format!(
                "No state on any source for {}",
                input.entity
            )));
        }

        // Remotes unchanged since the last sync carry nothing new.
        let fresh: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| !c.is_stale(input.last_known))
            .collect();
        let all_stale = fresh.is_empty();
        let pool: Vec<&Candidate> = if all_stale {
            candidates.iter().collect()
        } else {
            fresh
        };

        let frontier: Vec<&Candidate> = pool
            .iter()
            .copied()
            .filter(|c| !pool.iter().any(|other| other.vector.dominates(&c.vector)))
            .collect();

        let mut distinct: Vec<&VersionVector> = Vec::new();
        for candidate in &frontier {
            if !distinct.contains(&&candidate.vector) {
                distinct.push(&candidate.vector);
            }
        }

        // Concurrent vectors over identical states have already converged.
        let converged = frontier.iter().all(|c| c.state == frontier[0].state);

        let (winning_state, winning_source, mut strategy) = if distinct.len() == 1 || converged {
            // Frontier is in Local > SystemA > SystemB order.
            let winner = frontier[0];
            let strategy = if winner.source == Source::Local {
                ResolutionStrategy::LocalWins
            } else {
                ResolutionStrategy::FastForward
            };
            (winner.state.clone(), Some(winner.source), strategy)
        } else {
            self.resolve_concurrent(input.entity, &frontier)?
        };

        let mut resulting_vector = input.last_known.cloned().unwrap_or_default();
        for candidate in &candidates {
            resulting_vector.merge(&candidate.vector);
        }
        if strategy.is_conflict() {
            resulting_vector.increment(Source::Local);
        }

        let mut losing_sources = BTreeSet::new();
        for source in Source::REMOTES {
            let held = input.remote(source).map(|s| &s.state);
            let loses = match (&winning_state, held) {
                (EntityState::Deleted, held) => held.is_some_and(|s| !s.is_deleted()),
                (_, None) => true,
                (winning, Some(held)) => held != winning,
            };
            if loses {
                losing_sources.insert(source);
            }
        }

        let local = candidates.iter().find(|c| c.source == Source::Local);
        let local_loses = match local {
            Some(local) => local.state != winning_state,
            None => input.last_known != Some(&resulting_vector),
        };
        if local_loses {
            losing_sources.insert(Source::Local);
        }

        if losing_sources.is_empty() && input.local_ops.is_empty() {
            strategy = ResolutionStrategy::InSync;
        } else if all_stale && !strategy.is_conflict() {
            strategy = ResolutionStrategy::Reconcile;
        }

        Ok(ResolutionOutcome {
            entity: input.entity.clone(),
            winning_state,
            winning_source,
            strategy_used: strategy,
            losing_sources,
            resulting_vector,
        })
    }

    fn candidates(input: &ResolutionInput<'_>) -> Vec<Candidate> {
        let remotes: Vec<Candidate> = Source::REMOTES
            .into_iter()
            .filter_map(|source| match input.remote(source) {
                Some(snapshot) => Some(Candidate {
                    source,
                    state: snapshot.state.clone(),
                    vector: snapshot.vector.clone(),
                    timestamp: snapshot.updated_at,
                }),
                None if input.vanished(source) => Some(Self::tombstone(input, source)),
                None => None,
            })
            .collect();

        let mut candidates = Vec::with_capacity(3);

        if let Some(last) = input.local_ops.last() {
            // Updates overlay the last synced state: a remote unchanged
            // since the last sync, else any remote still holding the entity.
            let base = remotes
                .iter()
                .filter(|c| !c.state.is_deleted())
                .find(|c| c.is_stale(input.last_known))
                .or_else(|| remotes.iter().find(|c| !c.state.is_deleted()))
                .map(|c| c.state.clone());

            let state = input
                .local_ops
                .iter()
                .fold(base, |state, op| Some(op.apply_to(state)))
                .unwrap_or(EntityState::Deleted);
            candidates.push(Candidate {
                source: Source::Local,
                state,
                vector: last.originating_vector.clone(),
                timestamp: last.created_at,
            });
        }

        candidates.extend(remotes);
        candidates
    }

    /// Deletion inferred for a vanished remote: one step past everything
    /// that remote was known to hold. The deletion time is unknown, so it
    /// never wins a most-recent comparison.
    fn tombstone(input: &ResolutionInput<'_>, source: Source) -> Candidate {
        let mut vector = input.last_known.cloned().unwrap_or_default();
        vector.increment(source);
        Candidate {
            source,
            state: EntityState::Deleted,
            vector,
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }

    fn resolve_concurrent(
        &self,
        entity: &EntityRef,
        frontier: &[&Candidate],
    ) -> Result<(EntityState, Option<Source>, ResolutionStrategy)> {
        let policy = self.policies.get(entity.entity_type());

        let delete_wins = policy.map_or(true, |p| p.delete_wins);
        if delete_wins {
            if let Some(deleted) = frontier.iter().find(|c| c.state.is_deleted()) {
                return Ok((
                    EntityState::Deleted,
                    Some(deleted.source),
                    ResolutionStrategy::DeleteWins,
                ));
            }
        }

        let policy = policy.ok_or_else(|| Error::UnresolvableConflict {
            entity: entity.to_string(),
            reason: format!(
                "concurrent versions and no policy for entity type '{}'",
                entity.entity_type()
            ),
        })?;

        let applied = ResolutionStrategy::Policy(policy.strategy);
        match policy.strategy {
            ConflictStrategy::PreferSystemA | ConflictStrategy::PreferSystemB => {
                let preferred = if policy.strategy == ConflictStrategy::PreferSystemA {
                    Source::SystemA
                } else {
                    Source::SystemB
                };
                let winner = frontier
                    .iter()
                    .find(|c| c.source == preferred)
                    .copied()
                    .unwrap_or_else(|| most_recent(frontier));
                Ok((winner.state.clone(), Some(winner.source), applied))
            }
            ConflictStrategy::PreferMostRecent => {
                let winner = most_recent(frontier);
                Ok((winner.state.clone(), Some(winner.source), applied))
            }
            ConflictStrategy::MergePreferSystemA => {
                Ok((merge_fields(frontier, Source::SystemA), None, applied))
            }
            ConflictStrategy::MergePreferSystemB => {
                Ok((merge_fields(frontier, Source::SystemB), None, applied))
            }
            ConflictStrategy::Manual => Err(Error::UnresolvableConflict {
                entity: entity.to_string(),
                reason: "policy requires manual resolution".to_string(),
            }),
        }
    }
}

/// Latest timestamp wins; ties go Local > SystemA > SystemB.
fn most_recent<'a>(frontier: &[&'a Candidate]) -> &'a Candidate {
    let mut best = frontier[0];
    for candidate in &frontier[1..] {
        if (candidate.timestamp, candidate.tie_rank()) > (best.timestamp, best.tie_rank()) {
            best = candidate;
        }
    }
    best
}

/// Field-level union: preferred remote, then the other remote, then local.
///
/// A `null` field counts as unset and falls through to the next source.
/// Tombstoned candidates contribute no fields.
fn merge_fields(frontier: &[&Candidate], preferred: Source) -> EntityState {
    let other = if preferred == Source::SystemA {
        Source::SystemB
    } else {
        Source::SystemA
    };

    let ordered: Vec<&Payload> = [preferred, other, Source::Local]
        .into_iter()
        .filter_map(|source| frontier.iter().find(|c| c.source == source))
        .filter_map(|c| c.state.payload())
        .collect();

    if ordered.is_empty() {
        return EntityState::Deleted;
    }

    let mut merged = Payload::new();
    for payload in &ordered {
        for field in payload.fields() {
            if merged.get(field).is_some() {
                continue;
            }
            let value = ordered
                .iter()
                .find_map(|p| p.get_set(field))
                .or_else(|| payload.get(field));
            if let Some(value) = value {
                merged.insert(field.clone(), value.clone());
            }
        }
    }
    EntityState::Present(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OperationKind;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::Value;

    fn entity() -> EntityRef {
        EntityRef::new("submission", "9").unwrap()
    }

    fn vv(pairs: &[(Source, u64)]) -> VersionVector {
        VersionVector::from_pairs(pairs.iter().copied())
    }

    fn op(
        id: i64,
        kind: OperationKind,
        payload: Option<Payload>,
        vector: VersionVector,
        created_at: DateTime<Utc>,
    ) -> Operation {
        Operation {
            operation_id: id,
            entity: entity(),
            kind,
            payload,
            originating_vector: vector,
            created_at,
        }
    }

    fn snapshot(payload: Payload, vector: VersionVector, updated_at: DateTime<Utc>) -> RemoteSnapshot {
        RemoteSnapshot {
            state: EntityState::Present(payload),
            vector,
            updated_at,
        }
    }

    fn resolver(strategy: ConflictStrategy) -> ConflictResolver {
        ConflictResolver::new(PolicyMap::new().with("submission", EntityPolicy::new(strategy)))
    }

    fn input<'a>(
        entity: &'a EntityRef,
        ops: &'a [Operation],
        a: Option<&'a RemoteSnapshot>,
        b: Option<&'a RemoteSnapshot>,
        last_known: Option<&'a VersionVector>,
    ) -> ResolutionInput<'a> {
        ResolutionInput {
            entity,
            local_ops: ops,
            system_a: a,
            system_b: b,
            last_known,
            last_synced_state: None,
        }
    }

    #[test]
    fn test_new_local_entity_pushes_everywhere() {
        let entity = entity();
        let payload = Payload::new().with("grade", "A");
        let ops = [op(
            1,
            OperationKind::Insert,
            Some(payload.clone()),
            vv(&[(Source::Local, 1)]),
            Utc::now(),
        )];

        let outcome = ConflictResolver::default()
            .resolve(&input(&entity, &ops, None, None, None))
            .unwrap();

        assert_eq!(outcome.strategy_used, ResolutionStrategy::LocalWins);
        assert_eq!(outcome.winning_state, EntityState::Present(payload));
        assert_eq!(outcome.winning_source, Some(Source::Local));
        assert_eq!(outcome.resulting_vector, vv(&[(Source::Local, 1)]));
        assert_eq!(
            outcome.remote_losers().collect::<Vec<_>>(),
            vec![Source::SystemA, Source::SystemB]
        );
        assert!(!outcome.local_lost());
    }

    #[test]
    fn test_concurrent_prefer_most_recent() {
        let entity = entity();
        let now = Utc::now();
        let last_known = vv(&[(Source::Local, 1), (Source::SystemA, 1)]);
        let ops = [op(
            1,
            OperationKind::Update,
            Some(Payload::new().with("grade", "B")),
            vv(&[(Source::Local, 2), (Source::SystemA, 1)]),
            now,
        )];
        let remote = snapshot(
            Payload::new().with("grade", "C"),
            vv(&[(Source::SystemA, 2)]),
            now - Duration::minutes(5),
        );

        let outcome = resolver(ConflictStrategy::PreferMostRecent)
            .resolve(&input(&entity, &ops, Some(&remote), None, Some(&last_known)))
            .unwrap();

        assert_eq!(
            outcome.strategy_used,
            ResolutionStrategy::Policy(ConflictStrategy::PreferMostRecent)
        );
        assert_eq!(outcome.winning_source, Some(Source::Local));
        assert_eq!(
            outcome.resulting_vector,
            vv(&[(Source::Local, 3), (Source::SystemA, 2)])
        );
        assert!(outcome.losing_sources.contains(&Source::SystemA));
        assert!(!outcome.local_lost());

        // A newer remote edit takes it instead.
        let newer = snapshot(
            Payload::new().with("grade", "C"),
            vv(&[(Source::SystemA, 2)]),
            now + Duration::minutes(5),
        );
        let outcome = resolver(ConflictStrategy::PreferMostRecent)
            .resolve(&input(&entity, &ops, Some(&newer), None, Some(&last_known)))
            .unwrap();
        assert_eq!(outcome.winning_source, Some(Source::SystemA));
        assert!(outcome.local_lost());
        assert!(!outcome.losing_sources.contains(&Source::SystemA));
    }

    #[test]
    fn test_local_delete_beats_concurrent_remote_update() {
        let entity = entity();
        let now = Utc::now();
        let ops = [op(
            1,
            OperationKind::Delete,
            None,
            vv(&[(Source::Local, 2), (Source::SystemB, 1)]),
            now - Duration::hours(1),
        )];
        let remote = snapshot(
            Payload::new().with("body", "edited"),
            vv(&[(Source::Local, 1), (Source::SystemB, 2)]),
            now,
        );

        let outcome = resolver(ConflictStrategy::PreferSystemB)
            .resolve(&input(&entity, &ops, None, Some(&remote), None))
            .unwrap();
        assert_eq!(outcome.strategy_used, ResolutionStrategy::DeleteWins);
        assert_eq!(outcome.winning_state, EntityState::Deleted);
        assert_eq!(
            outcome.losing_sources,
            BTreeSet::from([Source::SystemB])
        );

        // The same divergence with deletes not winning follows the strategy.
        let keep_updates = ConflictResolver::new(PolicyMap::new().with(
            "submission",
            EntityPolicy::new(ConflictStrategy::PreferSystemB).without_delete_wins(),
        ));
        let outcome = keep_updates
            .resolve(&input(&entity, &ops, None, Some(&remote), None))
            .unwrap();
        assert_eq!(outcome.winning_source, Some(Source::SystemB));
        assert!(outcome.local_lost());
    }

    #[test]
    fn test_fast_forward_when_remote_dominates() {
        let entity = entity();
        let last_known = vv(&[(Source::Local, 1), (Source::SystemA, 1)]);
        let remote = snapshot(
            Payload::new().with("grade", "A+"),
            vv(&[(Source::Local, 1), (Source::SystemA, 2)]),
            Utc::now(),
        );

        let outcome = ConflictResolver::default()
            .resolve(&input(&entity, &[], Some(&remote), None, Some(&last_known)))
            .unwrap();

        assert_eq!(outcome.strategy_used, ResolutionStrategy::FastForward);
        assert_eq!(outcome.winning_source, Some(Source::SystemA));
        assert_eq!(
            outcome.losing_sources,
            BTreeSet::from([Source::Local, Source::SystemB])
        );
        assert_eq!(outcome.resulting_vector, remote.vector);
    }

    #[test]
    fn test_in_sync_when_everything_agrees() {
        let entity = entity();
        let vector = vv(&[(Source::Local, 1), (Source::SystemA, 1), (Source::SystemB, 1)]);
        let payload = Payload::new().with("grade", "A");
        let a = snapshot(payload.clone(), vector.clone(), Utc::now());
        let b = snapshot(payload, vector.clone(), Utc::now());

        let outcome = ConflictResolver::default()
            .resolve(&input(&entity, &[], Some(&a), Some(&b), Some(&vector)))
            .unwrap();
        assert_eq!(outcome.strategy_used, ResolutionStrategy::InSync);
        assert!(outcome.losing_sources.is_empty());
        assert_eq!(outcome.resulting_vector, vector);
    }

    #[test]
    fn test_unconfigured_type_is_unresolvable() {
        let entity = entity();
        let ops = [op(
            1,
            OperationKind::Update,
            Some(Payload::new().with("grade", "B")),
            vv(&[(Source::Local, 1)]),
            Utc::now(),
        )];
        let remote = snapshot(
            Payload::new().with("grade", "C"),
            vv(&[(Source::SystemA, 1)]),
            Utc::now(),
        );

        let err = ConflictResolver::default()
            .resolve(&input(&entity, &ops, Some(&remote), None, None))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvableConflict { .. }));

        let err = resolver(ConflictStrategy::Manual)
            .resolve(&input(&entity, &ops, Some(&remote), None, None))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvableConflict { .. }));
    }

    #[test]
    fn test_no_state_anywhere_is_invalid() {
        let entity = entity();
        let err = ConflictResolver::default()
            .resolve(&input(&entity, &[], None, None, None))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_merge_prefers_source_and_keeps_local_fields() {
        let entity = entity();
        let now = Utc::now();
        let ops = [op(
            1,
            OperationKind::Update,
            Some(
                Payload::new()
                    .with("title", "local title")
                    .with("draft_note", "mine"),
            ),
            vv(&[(Source::Local, 1)]),
            now,
        )];
        let a = snapshot(
            Payload::new().with("title", Value::Null).with("points", 10),
            vv(&[(Source::SystemA, 1)]),
            now,
        );
        let b = snapshot(
            Payload::new().with("title", "forum title").with("points", 5),
            vv(&[(Source::SystemB, 1)]),
            now,
        );

        let outcome = resolver(ConflictStrategy::MergePreferSystemA)
            .resolve(&input(&entity, &ops, Some(&a), Some(&b), None))
            .unwrap();

        let merged = outcome.winning_state.payload().unwrap();
        assert_eq!(merged.get("points"), Some(&Value::from(10)));
        assert_eq!(merged.get("title"), Some(&Value::from("forum title")));
        assert_eq!(merged.get("draft_note"), Some(&Value::from("mine")));
        assert_eq!(outcome.winning_source, None);
        assert_eq!(
            outcome.resulting_vector,
            vv(&[(Source::Local, 2), (Source::SystemA, 1), (Source::SystemB, 1)])
        );
        assert_eq!(outcome.losing_sources.len(), 3);
    }

    #[test]
    fn test_prefer_absent_source_falls_back_to_most_recent() {
        let entity = entity();
        let now = Utc::now();
        let ops = [op(
            1,
            OperationKind::Update,
            Some(Payload::new().with("body", "local")),
            vv(&[(Source::Local, 1)]),
            now - Duration::seconds(30),
        )];
        let b = snapshot(
            Payload::new().with("body", "remote"),
            vv(&[(Source::SystemB, 1)]),
            now,
        );

        let outcome = resolver(ConflictStrategy::PreferSystemA)
            .resolve(&input(&entity, &ops, None, Some(&b), None))
            .unwrap();
        assert_eq!(outcome.winning_source, Some(Source::SystemB));
    }

    #[test]
    fn test_timestamp_ties_favor_local() {
        let entity = entity();
        let now = Utc::now();
        let ops = [op(
            1,
            OperationKind::Update,
            Some(Payload::new().with("body", "local")),
            vv(&[(Source::Local, 1)]),
            now,
        )];
        let a = snapshot(Payload::new().with("body", "a"), vv(&[(Source::SystemA, 1)]), now);

        let outcome = resolver(ConflictStrategy::PreferMostRecent)
            .resolve(&input(&entity, &ops, Some(&a), None, None))
            .unwrap();
        assert_eq!(outcome.winning_source, Some(Source::Local));
    }

    #[test]
    fn test_remote_not_found_after_sync_is_a_deletion() {
        let entity = entity();
        let last_known = vv(&[(Source::Local, 1), (Source::SystemA, 1), (Source::SystemB, 1)]);
        let b = snapshot(Payload::new().with("grade", "A"), last_known.clone(), Utc::now());

        let outcome = ConflictResolver::default()
            .resolve(&input(&entity, &[], None, Some(&b), Some(&last_known)))
            .unwrap();

        assert_eq!(outcome.strategy_used, ResolutionStrategy::FastForward);
        assert_eq!(outcome.winning_state, EntityState::Deleted);
        assert_eq!(outcome.winning_source, Some(Source::SystemA));
        assert_eq!(
            outcome.losing_sources,
            BTreeSet::from([Source::Local, Source::SystemB])
        );
        assert_eq!(
            outcome.resulting_vector,
            vv(&[(Source::Local, 1), (Source::SystemA, 2), (Source::SystemB, 1)])
        );
    }

    #[test]
    fn test_vanished_remote_beats_concurrent_local_update() {
        let entity = entity();
        let now = Utc::now();
        let last_known = vv(&[(Source::Local, 1), (Source::SystemA, 1), (Source::SystemB, 1)]);
        let ops = [op(
            1,
            OperationKind::Update,
            Some(Payload::new().with("grade", "B")),
            vv(&[(Source::Local, 2), (Source::SystemA, 1), (Source::SystemB, 1)]),
            now,
        )];
        let b = snapshot(Payload::new().with("grade", "A"), last_known.clone(), now);

        let outcome = resolver(ConflictStrategy::PreferMostRecent)
            .resolve(&input(&entity, &ops, None, Some(&b), Some(&last_known)))
            .unwrap();
        assert_eq!(outcome.strategy_used, ResolutionStrategy::DeleteWins);
        assert_eq!(outcome.winning_state, EntityState::Deleted);
        assert!(outcome.local_lost());
        assert!(outcome.losing_sources.contains(&Source::SystemB));
        assert!(!outcome.losing_sources.contains(&Source::SystemA));

        // Without delete-wins the local edit is newer than any inferred deletion.
        let keep_updates = ConflictResolver::new(PolicyMap::new().with(
            "submission",
            EntityPolicy::new(ConflictStrategy::PreferMostRecent).without_delete_wins(),
        ));
        let outcome = keep_updates
            .resolve(&input(&entity, &ops, None, Some(&b), Some(&last_known)))
            .unwrap();
        assert_eq!(outcome.winning_source, Some(Source::Local));
        assert!(outcome.losing_sources.contains(&Source::SystemA));
    }

    #[test]
    fn test_absence_after_synced_deletion_stays_in_sync() {
        let entity = entity();
        let last_known = vv(&[(Source::Local, 1), (Source::SystemA, 2), (Source::SystemB, 2)]);
        let b = RemoteSnapshot {
            state: EntityState::Deleted,
            vector: last_known.clone(),
            updated_at: Utc::now(),
        };
        let deleted = EntityState::Deleted;
        let mut input = input(&entity, &[], None, Some(&b), Some(&last_known));
        input.last_synced_state = Some(&deleted);

        assert!(!input.vanished(Source::SystemA));
        let outcome = ConflictResolver::default().resolve(&input).unwrap();
        assert_eq!(outcome.strategy_used, ResolutionStrategy::InSync);
        assert!(outcome.losing_sources.is_empty());
        assert_eq!(outcome.resulting_vector, last_known);
    }

    #[test]
    fn test_absence_without_remote_history_is_not_a_deletion() {
        let entity = entity();
        let never_synced = input(&entity, &[], None, None, None);
        assert!(!never_synced.vanished(Source::SystemA));
        assert!(!never_synced.has_state());

        // B never accepted a write for this entity.
        let last_known = vv(&[(Source::Local, 1), (Source::SystemA, 1)]);
        let a = snapshot(Payload::new().with("grade", "A"), last_known.clone(), Utc::now());
        let partial = input(&entity, &[], Some(&a), None, Some(&last_known));
        assert!(!partial.vanished(Source::SystemB));
        assert!(!partial.vanished(Source::Local));
        assert!(partial.has_state());
    }

    #[test]
    fn test_stale_disagreement_is_reconciled() {
        let entity = entity();
        let last_known = vv(&[(Source::Local, 1), (Source::SystemA, 1), (Source::SystemB, 1)]);
        let synced = EntityState::Present(Payload::new().with("grade", "A"));
        let a = snapshot(Payload::new().with("grade", "A"), last_known.clone(), Utc::now());
        let b = snapshot(
            Payload::new().with("grade", "old"),
            vv(&[(Source::Local, 1), (Source::SystemA, 1)]),
            Utc::now(),
        );
        let mut input = input(&entity, &[], Some(&a), Some(&b), Some(&last_known));
        input.last_synced_state = Some(&synced);

        let outcome = ConflictResolver::default().resolve(&input).unwrap();
        assert_eq!(outcome.strategy_used, ResolutionStrategy::Reconcile);
        assert_eq!(outcome.strategy_used.to_string(), "reconcile");
        assert_eq!(outcome.winning_source, Some(Source::SystemA));
        assert_eq!(outcome.losing_sources, BTreeSet::from([Source::SystemB]));
        assert_eq!(outcome.resulting_vector, last_known);
    }

    fn counter() -> impl Strategy<Value = u64> {
        0u64..5
    }

    proptest! {
        #[test]
        fn prop_remotes_behind_local_never_use_a_strategy(
            local in proptest::array::uniform3(1u64..6),
            a_lag in proptest::array::uniform3(counter()),
            b_lag in proptest::array::uniform3(counter()),
        ) {
            let entity = entity();
            let local_vector = VersionVector::from_pairs(Source::ALL.into_iter().zip(local));
            let behind = |lag: [u64; 3]| {
                VersionVector::from_pairs(
                    Source::ALL
                        .into_iter()
                        .zip(local.iter().zip(lag).map(|(c, l)| c.saturating_sub(l))),
                )
            };
            let ops = [op(
                1,
                OperationKind::Update,
                Some(Payload::new().with("v", "local")),
                local_vector.clone(),
                Utc::now(),
            )];
            let a = snapshot(Payload::new().with("v", "a"), behind(a_lag), Utc::now());
            let b = snapshot(Payload::new().with("v", "b"), behind(b_lag), Utc::now());

            let outcome = ConflictResolver::default()
                .resolve(&input(&entity, &ops, Some(&a), Some(&b), None))
                .unwrap();

            prop_assert_eq!(outcome.strategy_used, ResolutionStrategy::LocalWins);
            prop_assert_eq!(outcome.winning_source, Some(Source::Local));
            prop_assert_eq!(outcome.resulting_vector, local_vector);
        }

        #[test]
        fn prop_resolving_twice_is_stable(
            local in proptest::array::uniform3(counter()),
            remote in proptest::array::uniform3(counter()),
        ) {
            let entity = entity();
            let now = Utc::now();
            let ops = [op(
                1,
                OperationKind::Update,
                Some(Payload::new().with("v", "local")),
                VersionVector::from_pairs(Source::ALL.into_iter().zip(local)),
                now,
            )];
            let a = snapshot(
                Payload::new().with("v", "a"),
                VersionVector::from_pairs(Source::ALL.into_iter().zip(remote)),
                now,
            );

            let resolver = resolver(ConflictStrategy::PreferMostRecent);
            let first = resolver.resolve(&input(&entity, &ops, Some(&a), None, None)).unwrap();
            let second = resolver.resolve(&input(&entity, &ops, Some(&a), None, None)).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}

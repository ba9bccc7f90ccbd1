//! Priority queues feeding the sync workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use syncbridge_common::{EntityRef, Error, Result};

/// Scheduling priority of a queued entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Operator-requested resync.
    Critical,
    /// Local mutations.
    High,
    /// Remote change polling.
    Background,
}

impl Priority {
    /// Highest first.
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::High, Priority::Background];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Background => "background",
        }
    }

    fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Background => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "background" => Ok(Priority::Background),
            other => Err(Error::InvalidInput(format!("Unknown priority: {}", other))),
        }
    }
}

/// One queued entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entity: EntityRef,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// Scheduling round parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Dequeues per scheduling round.
    pub round_size: usize,
    /// Background dequeues guaranteed per round when background work exists.
    pub background_quota: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            round_size: 8,
            background_quota: 1,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.round_size == 0 {
            return Err(Error::Config("queue.round_size must be at least 1".to_string()));
        }
        if self.background_quota > self.round_size {
            return Err(Error::Config(format!(
                "queue.background_quota ({}) exceeds round_size ({})",
                self.background_quota, self.round_size
            )));
        }
        Ok(())
    }
}

/// Queue depth per priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub critical: usize,
    pub high: usize,
    pub background: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.background
    }
}

/// Three FIFO queues drained in strict priority order, except that each
/// round of `round_size` dequeues reserves `background_quota` slots for
/// background entries so they are never starved.
///
/// An entity is queued at most once; re-enqueueing keeps the higher
/// priority.
#[derive(Debug)]
pub struct SyncQueue {
    config: QueueConfig,
    queues: [VecDeque<QueueEntry>; 3],
    queued: HashMap<EntityRef, Priority>,
    served_in_round: usize,
    background_in_round: usize,
}

impl SyncQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: Default::default(),
            queued: HashMap::new(),
            served_in_round: 0,
            background_in_round: 0,
        }
    }

    /// Queue an entity. Returns `false` if it was already queued at the
    /// same or a higher priority.
    pub fn push(&mut self, entity: EntityRef, priority: Priority) -> bool {
        if let Some(&current) = self.queued.get(&entity) {
            if current <= priority {
                return false;
            }
            self.queues[current.index()].retain(|e| e.entity != entity);
        }

        self.queued.insert(entity.clone(), priority);
        self.queues[priority.index()].push_back(QueueEntry {
            entity,
            priority,
            enqueued_at: Utc::now(),
        });
        true
    }

    /// Take the next entry to process.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.served_in_round >= self.config.round_size {
            self.served_in_round = 0;
            self.background_in_round = 0;
        }

        let remaining = self.config.round_size - self.served_in_round;
        let owed = self
            .config
            .background_quota
            .saturating_sub(self.background_in_round);
        let background_index = Priority::Background.index();

        let entry = if owed > 0 && remaining <= owed && !self.queues[background_index].is_empty() {
            self.queues[background_index].pop_front()
        } else {
            self.queues.iter_mut().find_map(|q| q.pop_front())
        }?;

        self.served_in_round += 1;
        if entry.priority == Priority::Background {
            self.background_in_round += 1;
        }
        self.queued.remove(&entry.entity);
        Some(entry)
    }

    /// Drop an entity from the queue. Returns whether it was queued.
    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        match self.queued.remove(entity) {
            Some(priority) => {
                self.queues[priority.index()].retain(|e| &e.entity != entity);
                true
            }
            None => false,
        }
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            critical: self.queues[Priority::Critical.index()].len(),
            high: self.queues[Priority::High.index()].len(),
            background: self.queues[Priority::Background.index()].len(),
        }
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> EntityRef {
        EntityRef::new("topic", id).unwrap()
    }

    fn drain_ids(queue: &mut SyncQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop())
            .map(|e| e.entity.entity_id().to_string())
            .collect()
    }

    #[test]
    fn test_strict_priority_order() {
        let mut queue = SyncQueue::default();
        queue.push(entity("bg"), Priority::Background);
        queue.push(entity("high"), Priority::High);
        queue.push(entity("crit"), Priority::Critical);

        assert_eq!(drain_ids(&mut queue), vec!["crit", "high", "bg"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_keeps_higher_priority() {
        let mut queue = SyncQueue::default();
        assert!(queue.push(entity("1"), Priority::Background));
        assert!(queue.push(entity("1"), Priority::Critical));
        assert!(!queue.push(entity("1"), Priority::High));

        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.depth(),
            QueueDepth {
                critical: 1,
                high: 0,
                background: 0
            }
        );
    }

    #[test]
    fn test_background_quota_prevents_starvation() {
        let mut queue = SyncQueue::new(QueueConfig {
            round_size: 4,
            background_quota: 1,
        });
        for i in 0..10 {
            queue.push(entity(&format!("c{}", i)), Priority::Critical);
        }
        queue.push(entity("bg"), Priority::Background);

        let order = drain_ids(&mut queue);
        let position = order.iter().position(|id| id == "bg").unwrap();
        assert_eq!(position, 3);
        assert_eq!(order.len(), 11);
    }

    #[test]
    fn test_quota_unused_when_no_background_work() {
        let mut queue = SyncQueue::new(QueueConfig {
            round_size: 2,
            background_quota: 1,
        });
        queue.push(entity("h1"), Priority::High);
        queue.push(entity("h2"), Priority::High);
        queue.push(entity("h3"), Priority::High);

        assert_eq!(drain_ids(&mut queue), vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn test_remove() {
        let mut queue = SyncQueue::default();
        queue.push(entity("1"), Priority::High);
        assert!(queue.remove(&entity("1")));
        assert!(!queue.remove(&entity("1")));
        assert!(queue.pop().is_none());
        assert_eq!(queue.depth().total(), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(QueueConfig {
            round_size: 0,
            background_quota: 0
        }
        .validate()
        .is_err());
        assert!(QueueConfig {
            round_size: 2,
            background_quota: 3
        }
        .validate()
        .is_err());
    }
}

//! Fixed-arity version vectors.
//!
//! Causality is tracked as one counter per [`Source`] rather than as a
//! graph of references between sources, so "who owns truth" cycles
//! between the local client and the two remotes cannot arise.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::Source;

/// Causal relationship between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CausalOrder {
    /// The first vector causally precedes the second.
    Before,
    /// The second vector causally precedes the first.
    After,
    /// Identical vectors.
    Equal,
    /// Neither precedes the other; a true conflict.
    Concurrent,
}

impl CausalOrder {
    /// The relation seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            other => other,
        }
    }
}

/// Per-source counters. Absent sources read as zero.
///
/// Zero counters are never stored, so structural equality matches causal
/// equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<Source, u64>", into = "BTreeMap<Source, u64>")]
pub struct VersionVector {
    counters: BTreeMap<Source, u64>,
}

impl VersionVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a vector from `(source, counter)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Source, u64)>) -> Self {
        let mut vector = Self::new();
        for (source, counter) in pairs {
            vector.set(source, counter);
        }
        vector
    }

    /// Counter for a source.
    pub fn get(&self, source: Source) -> u64 {
        self.counters.get(&source).copied().unwrap_or(0)
    }

    /// Overwrite the counter for a source.
    pub fn set(&mut self, source: Source, counter: u64) {
        if counter == 0 {
            self.counters.remove(&source);
        } else {
            self.counters.insert(source, counter);
        }
    }

    /// Advance a source's counter by one and return the new value.
    pub fn increment(&mut self, source: Source) -> u64 {
        let counter = self.counters.entry(source).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with `other`, in place.
    pub fn merge(&mut self, other: &VersionVector) {
        for (&source, &counter) in &other.counters {
            let entry = self.counters.entry(source).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Pointwise maximum with `other`, as a new vector.
    pub fn merged_with(&self, other: &VersionVector) -> VersionVector {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compare two vectors under the causal partial order.
    pub fn compare(&self, other: &VersionVector) -> CausalOrder {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for source in Source::ALL {
            let mine = self.get(source);
            let theirs = other.get(source);
            if mine > theirs {
                self_ahead = true;
            } else if theirs > mine {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => CausalOrder::Equal,
            (false, true) => CausalOrder::Before,
            (true, false) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True if `self` strictly causally follows `other`.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == CausalOrder::After
    }

    /// Check if no source has a counter yet.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterate over non-zero counters.
    pub fn iter(&self) -> impl Iterator<Item = (Source, u64)> + '_ {
        self.counters.iter().map(|(&s, &c)| (s, c))
    }
}

impl From<BTreeMap<Source, u64>> for VersionVector {
    fn from(map: BTreeMap<Source, u64>) -> Self {
        Self::from_pairs(map)
    }
}

impl From<VersionVector> for BTreeMap<Source, u64> {
    fn from(vector: VersionVector) -> Self {
        vector.counters
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (source, counter)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", source, counter)?;
        }
        write!(f, "}}")
    }
}

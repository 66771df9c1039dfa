//! Per-replica causal summaries.

use crate::clock::{Id, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping `ReplicaId → highest known clock`.
///
/// Clocks of one replica are contiguous, so an entry of `n` means operations
/// `1..=n` of that replica are all known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    /// Create an empty state vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest known clock for a replica (0 if none).
    #[must_use]
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Set the highest known clock for a replica.
    pub fn set(&mut self, replica: ReplicaId, clock: u64) {
        if clock == 0 {
            self.clocks.remove(&replica);
        } else {
            self.clocks.insert(replica, clock);
        }
    }

    /// Raise the entry for a replica to at least `clock`.
    pub fn observe(&mut self, replica: ReplicaId, clock: u64) {
        let entry = self.clocks.entry(replica).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether the operation with this id is covered.
    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        id.clock != 0 && self.get(&id.replica) >= id.clock
    }

    /// Merge another vector into this one (pointwise max).
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, clock) in &other.clocks {
            self.observe(*replica, *clock);
        }
    }

    /// Whether every entry of `other` is covered by this vector.
    #[must_use]
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(replica, clock)| self.get(replica) >= *clock)
    }

    /// Iterate over `(replica, clock)` entries in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }

    /// Number of replicas with a known clock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Whether nothing is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (replica, clock) in iter {
            sv.observe(replica, clock);
        }
        sv
    }
}

//! Last-writer-wins map registers.

use crate::clock::Id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current winning write for one key.
///
/// `value == None` is a tombstone left by a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    /// Written value
    pub value: Option<serde_json::Value>,
    /// Id of the write
    pub id: Id,
    /// Lamport time of the write
    pub lamport: u64,
}

impl Register {
    /// Whether this write beats `other`: greater Lamport time, then greater
    /// replica id.
    #[must_use]
    pub fn wins_over(&self, other: &Register) -> bool {
        (self.lamport, self.id.replica) > (other.lamport, other.id.replica)
    }
}

/// Map of registers keyed by string.
#[derive(Debug, Clone, Default)]
pub struct MapType {
    entries: BTreeMap<String, Register>,
}

impl MapType {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a write. Returns `Some(previous winning value)` if the write won,
    /// `None` if an existing register beats it.
    pub fn apply(&mut self, key: &str, write: Register) -> Option<Option<serde_json::Value>> {
        match self.entries.get_mut(key) {
            Some(current) if !write.wins_over(current) => None,
            Some(current) => {
                let previous = std::mem::replace(current, write);
                Some(previous.value)
            }
            None => {
                self.entries.insert(key.to_owned(), write);
                Some(None)
            }
        }
    }

    /// Live value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key).and_then(|r| r.value.as_ref())
    }

    /// Winning register for a key, tombstones included.
    #[must_use]
    pub fn register(&self, key: &str) -> Option<&Register> {
        self.entries.get(key)
    }

    /// Live entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries
            .iter()
            .filter_map(|(k, r)| r.value.as_ref().map(|v| (k.as_str(), v)))
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Whether there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

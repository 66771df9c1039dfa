//! Replica identity and local clocks.
//!
//! Every replica owns a random [`ReplicaId`] and a [`LocalClock`] made of two
//! counters:
//! - a per-replica sequence number which, paired with the replica id, names
//!   every operation exactly once ([`Id`])
//! - a Lamport counter which orders map writes and gives remote integration a
//!   causal total order
//!
//! # References
//!
//! Lamport, "Time, Clocks, and the Ordering of Events in a Distributed
//! System" (1978)

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a replica (one process participating in a document).
///
/// Ordering compares the 128-bit value, which makes it usable as the final
/// tie-breaker for concurrent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Generate a fresh random replica id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a replica id from a fixed integer (tests, tooling).
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Build a replica id from its 16 wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The 16 wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique, immutable operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
    /// Replica that created the operation
    pub replica: ReplicaId,
    /// Per-replica sequence number, starting at 1
    pub clock: u64,
}

impl Id {
    /// Create an id.
    #[must_use]
    pub const fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// Stamp handed out for each new local operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Operation id
    pub id: Id,
    /// Lamport time of the operation
    pub lamport: u64,
}

/// Local clock state machine for one replica.
#[derive(Debug, Clone)]
pub struct LocalClock {
    replica: ReplicaId,
    /// Last sequence number handed out (0 = none yet)
    clock: u64,
    /// Lamport time of the last local or observed operation
    lamport: u64,
}

impl LocalClock {
    /// Create a clock for the given replica.
    #[must_use]
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            lamport: 0,
        }
    }

    /// The replica this clock belongs to.
    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Issue the stamp for a new local operation.
    ///
    /// Both counters strictly increase, so the returned id is never reused and
    /// the Lamport time is greater than anything seen so far.
    pub fn tick(&mut self) -> Stamp {
        self.clock += 1;
        self.lamport += 1;
        Stamp {
            id: Id::new(self.replica, self.clock),
            lamport: self.lamport,
        }
    }

    /// Observe an integrated operation's Lamport time.
    pub fn observe(&mut self, lamport: u64) {
        if lamport > self.lamport {
            self.lamport = lamport;
        }
    }

    /// Fast-forward the sequence counter past an own operation learned from
    /// elsewhere (e.g. a snapshot written by a previous run of this replica).
    pub fn advance_to(&mut self, clock: u64) {
        if clock > self.clock {
            self.clock = clock;
        }
    }

    /// Last sequence number handed out.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.clock
    }

    /// Current Lamport time.
    #[must_use]
    pub fn lamport(&self) -> u64 {
        self.lamport
    }
}

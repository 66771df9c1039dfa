//! # coedit core
//!
//! Conflict-free replicated documents for collaborative editing.
//!
//! This crate provides:
//! - Replica identity and per-replica clocks
//! - CRDT shared types: YATA sequences for text/arrays, LWW registers for maps
//! - State vectors and a compact binary update codec for delta sync
//! - An ephemeral awareness (presence) protocol
//! - Scoped undo/redo that composes with concurrent remote edits
//! - Named version snapshots
//!
//! All merges are commutative, associative and idempotent: replicas that
//! have applied the same set of updates, in any order and any number of
//! times, hold identical state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod awareness;
pub mod clock;
pub mod codec;
pub mod document;
pub mod event;
pub mod map;
pub mod sequence;
pub mod state_vector;
pub mod undo;
pub mod update;
pub mod version;

pub use awareness::{Awareness, AwarenessEntry, AwarenessEvent, AwarenessUpdate, UserProfile};
pub use clock::{Id, LocalClock, ReplicaId};
pub use codec::CodecError;
pub use document::{
    ApplyOutcome, Commit, DocError, DocEvent, DocId, Document, Origin, SequenceChange,
    Transaction, TypeKind,
};
pub use event::{EventBus, Subscription};
pub use state_vector::StateVector;
pub use undo::{UndoEvent, UndoManager};
pub use update::{Record, Update};
pub use version::{Version, VersionDiff, VersionError, VersionHistory};

//! Replicated document: named shared types, transactions and update apply.
//!
//! A [`Document`] owns a set of shared types addressed by root name:
//! - Text and Array types are YATA sequences ([`crate::sequence`])
//! - Map types are LWW registers ([`crate::map`])
//!
//! Every mutation runs inside a [`Transaction`]. Committing a transaction
//! produces a [`Commit`] carrying the minimal [`Update`] to ship to peers and
//! fires exactly one [`DocEvent`] on the document's event bus.

use crate::clock::{Id, LocalClock, ReplicaId};
use crate::codec::CodecError;
use crate::event::{EventBus, Subscription};
use crate::map::{MapType, Register};
use crate::sequence::{Item, Sequence};
use crate::state_vector::StateVector;
use crate::update::{Content, Operation, Record, Update};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Identifier of a replicated document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    /// Create a document id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Kind of a shared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    /// Character sequence
    Text,
    /// Sequence of JSON values
    Array,
    /// String-keyed LWW map of JSON values
    Map,
}

impl std::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeKind::Text => write!(f, "text"),
            TypeKind::Array => write!(f, "array"),
            TypeKind::Map => write!(f, "map"),
        }
    }
}

/// Who caused a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// A local user edit
    Local,
    /// An update received from a peer
    Remote,
    /// An undo step
    Undo,
    /// A redo step
    Redo,
}

/// Result of applying an update.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// New records were integrated
    Applied(Commit),
    /// Every record was already known
    Redundant,
    /// Some dependencies are unknown; nothing was applied
    Deferred {
        /// Ids that must arrive first
        missing: Vec<Id>,
    },
}

/// One logical change to a sequence, in application order.
///
/// Each index is valid after applying the previous changes of the same list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceChange {
    /// `len` items became visible at `index`
    Inserted {
        /// Position of the first new item
        index: usize,
        /// Number of items
        len: usize,
    },
    /// `len` items starting at `index` were deleted
    Deleted {
        /// Position of the first removed item
        index: usize,
        /// Number of items
        len: usize,
    },
}

/// Changes to one shared type within a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEvent {
    /// Sequence changes (text and array types)
    pub sequence: Vec<SequenceChange>,
    /// Keys whose winning value changed (map types)
    pub keys: BTreeSet<String>,
}

/// Change notification fired once per committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocEvent {
    /// Transaction origin
    pub origin: Origin,
    /// Per shared type, by root name
    pub changes: BTreeMap<String, TypeEvent>,
}

/// A map write performed by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapWrite {
    /// Key written
    pub key: String,
    /// Id of the write
    pub id: Id,
    /// Winning value before the write
    pub previous: Option<serde_json::Value>,
}

/// Item ids and map writes touched in one shared type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeChanges {
    /// Items integrated by the transaction
    pub inserted: Vec<Id>,
    /// Previously visible items tombstoned by the transaction
    pub deleted: Vec<Id>,
    /// Map writes that won
    pub map_writes: Vec<MapWrite>,
}

impl TypeChanges {
    /// Whether nothing was touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.map_writes.is_empty()
    }
}

/// Everything a transaction touched, by shared type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxnChanges {
    /// Per root name
    pub types: BTreeMap<String, TypeChanges>,
}

impl TxnChanges {
    /// Whether nothing was touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.values().all(TypeChanges::is_empty)
    }

    fn entry(&mut self, name: &str) -> &mut TypeChanges {
        self.types.entry(name.to_owned()).or_default()
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone)]
pub struct Commit {
    /// Transaction origin
    pub origin: Origin,
    /// Records created (local) or integrated (remote)
    pub update: Update,
    /// The event fired for this commit
    pub event: DocEvent,
    /// Ids and writes touched, used by the undo manager
    pub changes: TxnChanges,
}

#[derive(Debug, Default)]
struct Branch {
    kind: Option<TypeKind>,
    sequence: Sequence,
    map: MapType,
}

/// A replicated document.
pub struct Document {
    id: DocId,
    clock: LocalClock,
    state_vector: StateVector,
    branches: BTreeMap<String, Branch>,
    /// Records per replica, indexed by `clock - 1`
    log: HashMap<ReplicaId, Vec<Record>>,
    events: EventBus<DocEvent>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("replica", &self.clock.replica())
            .field("state_vector", &self.state_vector)
            .field("types", &self.branches.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Document {
    /// Create an empty document for a replica.
    #[must_use]
    pub fn new(id: DocId, replica: ReplicaId) -> Self {
        Self {
            id,
            clock: LocalClock::new(replica),
            state_vector: StateVector::new(),
            branches: BTreeMap::new(),
            log: HashMap::new(),
            events: EventBus::new(),
        }
    }

    /// Document id.
    #[must_use]
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Local replica id.
    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    /// Highest integrated clock per replica.
    #[must_use]
    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Declare a shared type up front.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::TypeMismatch`] if `name` already has another kind.
    pub fn declare(&mut self, name: &str, kind: TypeKind) -> Result<(), DocError> {
        self.branch_mut(name, kind).map(|_| ())
    }

    /// Kind of a shared type, if it exists.
    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<TypeKind> {
        self.branches.get(name).and_then(|b| b.kind)
    }

    /// Root names of every shared type.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.branches.keys().map(String::as_str)
    }

    /// Subscribe to committed transactions.
    #[must_use = "dropping the subscription detaches the handler immediately"]
    pub fn observe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DocEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    fn branch(&self, name: &str, kind: TypeKind) -> Result<Option<&Branch>, DocError> {
        match self.branches.get(name) {
            Some(branch) => match branch.kind {
                Some(actual) if actual != kind => Err(DocError::TypeMismatch {
                    name: name.to_owned(),
                    expected: kind,
                    actual,
                }),
                _ => Ok(Some(branch)),
            },
            None => Ok(None),
        }
    }

    fn branch_mut(&mut self, name: &str, kind: TypeKind) -> Result<&mut Branch, DocError> {
        let branch = self.branches.entry(name.to_owned()).or_default();
        match branch.kind {
            Some(actual) if actual != kind => Err(DocError::TypeMismatch {
                name: name.to_owned(),
                expected: kind,
                actual,
            }),
            Some(_) => Ok(branch),
            None => {
                branch.kind = Some(kind);
                Ok(branch)
            }
        }
    }

    /// Content of a text type (empty if it does not exist).
    ///
    /// # Errors
    ///
    /// Returns [`DocError::TypeMismatch`] if `name` is not a text.
    pub fn text(&self, name: &str) -> Result<String, DocError> {
        Ok(self
            .branch(name, TypeKind::Text)?
            .map(|b| {
                b.sequence
                    .visible()
                    .filter_map(|item| match &item.content {
                        Content::Char(c) => Some(*c),
                        Content::Json(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Elements of an array type (empty if it does not exist).
    ///
    /// # Errors
    ///
    /// Returns [`DocError::TypeMismatch`] if `name` is not an array.
    pub fn array(&self, name: &str) -> Result<Vec<serde_json::Value>, DocError> {
        Ok(self
            .branch(name, TypeKind::Array)?
            .map(|b| {
                b.sequence
                    .visible()
                    .map(|item| match &item.content {
                        Content::Json(value) => value.clone(),
                        Content::Char(c) => serde_json::Value::String(c.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Live value of a map key.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::TypeMismatch`] if `name` is not a map.
    pub fn map_get(&self, name: &str, key: &str) -> Result<Option<serde_json::Value>, DocError> {
        Ok(self
            .branch(name, TypeKind::Map)?
            .and_then(|b| b.map.get(key).cloned()))
    }

    /// Live entries of a map type in key order.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::TypeMismatch`] if `name` is not a map.
    pub fn map_entries(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, DocError> {
        Ok(self
            .branch(name, TypeKind::Map)?
            .map(|b| {
                b.map
                    .entries()
                    .map(|(k, v)| (k.to_owned(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Visible length of a shared type (characters, elements or live keys).
    #[must_use]
    pub fn len(&self, name: &str) -> usize {
        match self.branches.get(name) {
            Some(b) if b.kind == Some(TypeKind::Map) => b.map.len(),
            Some(b) => b.sequence.len(),
            None => 0,
        }
    }

    /// Whether the document holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state_vector.is_empty()
    }

    /// Look up a sequence item by id, whatever type holds it.
    #[must_use]
    pub fn item(&self, name: &str, id: &Id) -> Option<&Item> {
        self.branches.get(name).and_then(|b| b.sequence.get(id))
    }

    /// Winning map register for a key, tombstones included.
    #[must_use]
    pub fn map_register(&self, name: &str, key: &str) -> Option<&Register> {
        self.branches.get(name).and_then(|b| b.map.register(key))
    }

    /// Records the holder of `remote` is missing.
    ///
    /// Insert records carry the item's current tombstone flag.
    #[must_use]
    pub fn diff(&self, remote: &StateVector) -> Update {
        let mut replicas: Vec<_> = self.log.keys().copied().collect();
        replicas.sort();

        let mut records = Vec::new();
        for replica in replicas {
            let known = usize::try_from(remote.get(&replica)).unwrap_or(usize::MAX);
            let Some(log) = self.log.get(&replica) else {
                continue;
            };
            for record in log.iter().skip(known) {
                let mut record = record.clone();
                if let Operation::Insert { deleted, .. } = &mut record.op {
                    *deleted = self
                        .item(&record.parent, &record.id)
                        .is_some_and(|item| item.deleted);
                }
                records.push(record);
            }
        }
        Update::new(records)
    }

    /// Full state as a single update.
    #[must_use]
    pub fn snapshot(&self) -> Update {
        self.diff(&StateVector::new())
    }

    /// Run local edits in one transaction and commit them.
    ///
    /// Edits performed before `f` fails stay applied; they are committed and
    /// reach peers with the next sync, and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by `f`.
    pub fn transact<F>(&mut self, origin: Origin, f: F) -> Result<Commit, DocError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), DocError>,
    {
        let (commit, result) = self.transact_partial(origin, f);
        result.map(|()| commit)
    }

    /// Like [`Self::transact`], but hands back the commit even when `f`
    /// fails, so the edits that did apply can still be replicated.
    pub fn transact_partial<F>(&mut self, origin: Origin, f: F) -> (Commit, Result<(), DocError>)
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), DocError>,
    {
        let mut txn = Transaction::new(self, origin);
        let result = f(&mut txn);
        (txn.commit(), result)
    }

    /// Apply a remote update.
    ///
    /// All-or-nothing: if any new record depends on something neither known
    /// locally nor carried by the same update, nothing is applied and the
    /// missing ids are returned. Records already known are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::DuplicateId`] if a record reuses a known id for a
    /// different operation.
    pub fn apply_update(&mut self, update: &Update, origin: Origin) -> Result<ApplyOutcome, DocError> {
        let mut fresh: BTreeMap<(ReplicaId, u64), &Record> = BTreeMap::new();
        for record in update.records() {
            if self.state_vector.contains(&record.id) {
                continue;
            }
            if record.id.clock == 0 {
                return Err(DocError::DuplicateId(record.id));
            }
            fresh
                .entry((record.id.replica, record.id.clock))
                .or_insert(record);
        }
        if fresh.is_empty() {
            tracing::trace!(doc_id = %self.id, records = update.len(), "Update already known");
            return Ok(ApplyOutcome::Redundant);
        }

        let missing = self.missing_dependencies(&fresh);
        if !missing.is_empty() {
            tracing::debug!(
                doc_id = %self.id,
                records = fresh.len(),
                missing = missing.len(),
                "Deferred update with unknown dependencies"
            );
            return Ok(ApplyOutcome::Deferred { missing });
        }

        let mut ordered: Vec<&Record> = fresh.into_values().collect();
        ordered.sort_by_key(|r| (r.lamport, r.id.replica, r.id.clock));

        let mut txn = Transaction::new(self, origin);
        for record in ordered {
            txn.integrate(record.clone())?;
        }
        let commit = txn.commit();
        tracing::debug!(
            doc_id = %self.id,
            records = commit.update.len(),
            origin = ?origin,
            "Applied update"
        );
        Ok(ApplyOutcome::Applied(commit))
    }

    fn missing_dependencies(&self, fresh: &BTreeMap<(ReplicaId, u64), &Record>) -> Vec<Id> {
        let mut missing = BTreeSet::new();

        // Per-replica clocks must continue the local state vector without gaps
        let mut reach: HashMap<ReplicaId, u64> = HashMap::new();
        for &(replica, clock) in fresh.keys() {
            let next = reach
                .entry(replica)
                .or_insert_with(|| self.state_vector.get(&replica));
            if clock == *next + 1 {
                *next = clock;
            } else {
                missing.insert(Id::new(replica, *next + 1));
            }
        }
        let integrable =
            |id: &Id| reach.get(&id.replica).is_some_and(|&r| id.clock <= r) || self.state_vector.contains(id);

        for record in fresh.values() {
            if !integrable(&record.id) {
                continue;
            }
            for dep in record.dependencies() {
                if !integrable(&dep) {
                    missing.insert(dep);
                }
            }
        }
        missing.into_iter().collect()
    }

    fn push_record(&mut self, record: Record) -> Result<(), DocError> {
        let log = self.log.entry(record.id.replica).or_default();
        if log.len() as u64 + 1 != record.id.clock {
            return Err(DocError::DuplicateId(record.id));
        }
        self.state_vector.observe(record.id.replica, record.id.clock);
        self.clock.observe(record.lamport);
        if record.id.replica == self.clock.replica() {
            self.clock.advance_to(record.id.clock);
        }
        log.push(record);
        Ok(())
    }

    fn emit(&self, event: &DocEvent) {
        self.events.emit(event);
    }
}

/// An open transaction on a [`Document`].
///
/// Obtained through [`Document::transact`]; committed automatically when the
/// closure returns.
pub struct Transaction<'doc> {
    doc: &'doc mut Document,
    origin: Origin,
    records: Vec<Record>,
    changes: TxnChanges,
    inserted: HashSet<Id>,
}

impl<'doc> Transaction<'doc> {
    fn new(doc: &'doc mut Document, origin: Origin) -> Self {
        Self {
            doc,
            origin,
            records: Vec::new(),
            changes: TxnChanges::default(),
            inserted: HashSet::new(),
        }
    }

    /// Read access to the document being edited.
    #[must_use]
    pub fn doc(&self) -> &Document {
        &*self.doc
    }

    /// Transaction origin.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    fn new_record(&mut self, parent: &str, op: Operation) -> Result<Record, DocError> {
        let stamp = self.doc.clock.tick();
        let record = Record {
            id: stamp.id,
            lamport: stamp.lamport,
            parent: parent.to_owned(),
            op,
        };
        self.integrate(record.clone())?;
        Ok(record)
    }

    /// Integrate one record (local or remote) into the document.
    fn integrate(&mut self, record: Record) -> Result<(), DocError> {
        let parent = record.parent.clone();
        match &record.op {
            Operation::Insert {
                origin_left,
                origin_right,
                content,
                deleted,
            } => {
                let kind = match content {
                    Content::Char(_) => TypeKind::Text,
                    Content::Json(_) => TypeKind::Array,
                };
                let branch = self.doc.branches.entry(parent.clone()).or_default();
                branch.kind.get_or_insert(kind);
                if branch.sequence.contains(&record.id) {
                    return Err(DocError::DuplicateId(record.id));
                }
                let mut item = Item::new(record.id, *origin_left, *origin_right, content.clone());
                item.deleted = *deleted;
                branch.sequence.integrate(item);
                self.inserted.insert(record.id);
                self.changes.entry(&parent).inserted.push(record.id);
            }
            Operation::Delete { target } => {
                let branch = self.doc.branches.entry(parent.clone()).or_default();
                if branch.sequence.delete(target) && !self.inserted.contains(target) {
                    self.changes.entry(&parent).deleted.push(*target);
                }
            }
            Operation::MapSet { key, value } => {
                let branch = self.doc.branches.entry(parent.clone()).or_default();
                branch.kind.get_or_insert(TypeKind::Map);
                let write = Register {
                    value: value.clone(),
                    id: record.id,
                    lamport: record.lamport,
                };
                if let Some(previous) = branch.map.apply(key, write) {
                    self.changes.entry(&parent).map_writes.push(MapWrite {
                        key: key.clone(),
                        id: record.id,
                        previous,
                    });
                }
            }
        }
        self.doc.push_record(record.clone())?;
        self.records.push(record);
        Ok(())
    }

    /// Insert text at a character index.
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not a text or `index` is past the end.
    pub fn insert_text(&mut self, name: &str, index: usize, text: &str) -> Result<(), DocError> {
        let contents = text.chars().map(Content::Char).collect();
        self.insert_contents(name, TypeKind::Text, index, contents)
    }

    /// Delete `len` characters starting at `index`.
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not a text or the range does not fit.
    pub fn delete_text(&mut self, name: &str, index: usize, len: usize) -> Result<(), DocError> {
        self.delete_range(name, TypeKind::Text, index, len)
    }

    /// Insert values into an array at `index`.
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not an array or `index` is past the end.
    pub fn insert_values(
        &mut self,
        name: &str,
        index: usize,
        values: Vec<serde_json::Value>,
    ) -> Result<(), DocError> {
        let contents = values.into_iter().map(Content::Json).collect();
        self.insert_contents(name, TypeKind::Array, index, contents)
    }

    /// Delete `len` array elements starting at `index`.
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not an array or the range does not fit.
    pub fn delete_values(&mut self, name: &str, index: usize, len: usize) -> Result<(), DocError> {
        self.delete_range(name, TypeKind::Array, index, len)
    }

    /// Replace the array element at `index` (delete, then insert).
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not an array or `index` is out of bounds.
    pub fn update_value(
        &mut self,
        name: &str,
        index: usize,
        value: serde_json::Value,
    ) -> Result<(), DocError> {
        self.delete_range(name, TypeKind::Array, index, 1)?;
        self.insert_contents(name, TypeKind::Array, index, vec![Content::Json(value)])
    }

    /// Set a map key.
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not a map.
    pub fn map_set(
        &mut self,
        name: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), DocError> {
        self.write_key(name, key, Some(value))
    }

    /// Delete a map key.
    ///
    /// # Errors
    ///
    /// Returns error if `name` is not a map.
    pub fn map_delete(&mut self, name: &str, key: &str) -> Result<(), DocError> {
        self.write_key(name, key, None)
    }

    fn write_key(
        &mut self,
        name: &str,
        key: &str,
        value: Option<serde_json::Value>,
    ) -> Result<(), DocError> {
        self.doc.branch_mut(name, TypeKind::Map)?;
        self.new_record(
            name,
            Operation::MapSet {
                key: key.to_owned(),
                value,
            },
        )?;
        Ok(())
    }

    fn insert_contents(
        &mut self,
        name: &str,
        kind: TypeKind,
        index: usize,
        contents: Vec<Content>,
    ) -> Result<(), DocError> {
        let branch = self.doc.branch_mut(name, kind)?;
        let len = branch.sequence.len();
        let (mut left, right) = branch
            .sequence
            .origins_at(index)
            .ok_or(DocError::IndexOutOfBounds { index, len })?;
        for content in contents {
            let record = self.new_record(
                name,
                Operation::Insert {
                    origin_left: left,
                    origin_right: right,
                    content,
                    deleted: false,
                },
            )?;
            left = Some(record.id);
        }
        Ok(())
    }

    fn delete_range(
        &mut self,
        name: &str,
        kind: TypeKind,
        index: usize,
        len: usize,
    ) -> Result<(), DocError> {
        let branch = self.doc.branch_mut(name, kind)?;
        let targets = branch
            .sequence
            .visible_range(index, len)
            .ok_or(DocError::IndexOutOfBounds {
                index: index.saturating_add(len),
                len: branch.sequence.len(),
            })?;
        for target in targets {
            self.new_record(name, Operation::Delete { target })?;
        }
        Ok(())
    }

    /// Re-insert a copy of a tombstoned item directly after it.
    ///
    /// Returns `false` if the item is unknown or still visible.
    pub(crate) fn restore_item(&mut self, name: &str, tombstone: &Id) -> Result<bool, DocError> {
        let Some(branch) = self.doc.branches.get(name) else {
            return Ok(false);
        };
        let Some(item) = branch.sequence.get(tombstone) else {
            return Ok(false);
        };
        if !item.deleted {
            return Ok(false);
        }
        let content = item.content.clone();
        let origin_right = branch.sequence.right_of(tombstone);
        self.new_record(
            name,
            Operation::Insert {
                origin_left: Some(*tombstone),
                origin_right,
                content,
                deleted: false,
            },
        )?;
        Ok(true)
    }

    /// Tombstone one item by id. Returns `false` if unknown or already deleted.
    pub(crate) fn delete_item(&mut self, name: &str, id: &Id) -> Result<bool, DocError> {
        let visible = self
            .doc
            .item(name, id)
            .is_some_and(|item| !item.deleted);
        if visible {
            self.new_record(name, Operation::Delete { target: *id })?;
        }
        Ok(visible)
    }

    /// Undo a map write if it is still the key's winner.
    pub(crate) fn revert_map_write(&mut self, name: &str, write: &MapWrite) -> Result<bool, DocError> {
        let still_winning = self
            .doc
            .map_register(name, &write.key)
            .is_some_and(|r| r.id == write.id);
        if still_winning {
            self.new_record(
                name,
                Operation::MapSet {
                    key: write.key.clone(),
                    value: write.previous.clone(),
                },
            )?;
        }
        Ok(still_winning)
    }

    fn sequence_event(&self, name: &str, changes: &TypeChanges) -> Vec<SequenceChange> {
        let Some(branch) = self.doc.branches.get(name) else {
            return Vec::new();
        };
        let inserted: HashSet<&Id> = changes.inserted.iter().collect();
        let deleted: HashSet<&Id> = changes.deleted.iter().collect();

        let mut out: Vec<SequenceChange> = Vec::new();
        let mut pos = 0;
        for item in branch.sequence.iter() {
            if inserted.contains(&item.id) {
                if item.deleted {
                    continue;
                }
                match out.last_mut() {
                    Some(SequenceChange::Inserted { index, len }) if *index + *len == pos => {
                        *len += 1;
                    }
                    _ => out.push(SequenceChange::Inserted { index: pos, len: 1 }),
                }
                pos += 1;
            } else if deleted.contains(&item.id) {
                match out.last_mut() {
                    Some(SequenceChange::Deleted { index, len }) if *index == pos => *len += 1,
                    _ => out.push(SequenceChange::Deleted { index: pos, len: 1 }),
                }
            } else if !item.deleted {
                pos += 1;
            }
        }
        out
    }

    fn commit(self) -> Commit {
        let mut event = DocEvent {
            origin: self.origin,
            changes: BTreeMap::new(),
        };
        for (name, changes) in &self.changes.types {
            let type_event = TypeEvent {
                sequence: self.sequence_event(name, changes),
                keys: changes.map_writes.iter().map(|w| w.key.clone()).collect(),
            };
            if !type_event.sequence.is_empty() || !type_event.keys.is_empty() {
                event.changes.insert(name.clone(), type_event);
            }
        }

        let Transaction {
            doc,
            origin,
            records,
            changes,
            ..
        } = self;
        if !records.is_empty() {
            doc.emit(&event);
        }
        Commit {
            origin,
            update: Update::new(records),
            event,
            changes,
        }
    }
}

impl Document {
    /// Insert text at a character index in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::insert_text`].
    pub fn insert_text(&mut self, name: &str, index: usize, text: &str) -> Result<Commit, DocError> {
        self.transact(Origin::Local, |txn| txn.insert_text(name, index, text))
    }

    /// Delete a character range in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::delete_text`].
    pub fn delete_text(&mut self, name: &str, index: usize, len: usize) -> Result<Commit, DocError> {
        self.transact(Origin::Local, |txn| txn.delete_text(name, index, len))
    }

    /// Insert array values in their own transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::insert_values`].
    pub fn insert_values(
        &mut self,
        name: &str,
        index: usize,
        values: Vec<serde_json::Value>,
    ) -> Result<Commit, DocError> {
        self.transact(Origin::Local, |txn| txn.insert_values(name, index, values))
    }

    /// Delete an array range in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::delete_values`].
    pub fn delete_values(&mut self, name: &str, index: usize, len: usize) -> Result<Commit, DocError> {
        self.transact(Origin::Local, |txn| txn.delete_values(name, index, len))
    }

    /// Replace an array element in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::update_value`].
    pub fn update_value(
        &mut self,
        name: &str,
        index: usize,
        value: serde_json::Value,
    ) -> Result<Commit, DocError> {
        self.transact(Origin::Local, |txn| txn.update_value(name, index, value))
    }

    /// Set a map key in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::map_set`].
    pub fn map_set(
        &mut self,
        name: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<Commit, DocError> {
        self.transact(Origin::Local, |txn| txn.map_set(name, key, value))
    }

    /// Delete a map key in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`Transaction::map_delete`].
    pub fn map_delete(&mut self, name: &str, key: &str) -> Result<Commit, DocError> {
        self.transact(Origin::Local, |txn| txn.map_delete(name, key))
    }
}

/// Document errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocError {
    /// A shared type was used with the wrong kind
    #[error("type {name:?} is a {actual}, not a {expected}")]
    TypeMismatch {
        /// Root name
        name: String,
        /// Kind requested
        expected: TypeKind,
        /// Kind it already has
        actual: TypeKind,
    },
    /// Position outside the visible length
    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// Offending position
        index: usize,
        /// Visible length
        len: usize,
    },
    /// An operation id was issued twice
    #[error("duplicate operation id {0}")]
    DuplicateId(Id),
    /// Malformed update payload
    #[error("malformed update: {0}")]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn doc(replica: u128) -> Document {
        Document::new(DocId::new("doc"), ReplicaId::from_u128(replica))
    }

    #[test]
    fn text_insert_and_delete() {
        let mut d = doc(1);
        d.insert_text("content", 0, "Hello world").unwrap();
        d.delete_text("content", 5, 6).unwrap();
        d.insert_text("content", 5, "!").unwrap();

        assert_eq!(d.text("content").unwrap(), "Hello!");
        assert_eq!(d.len("content"), 6);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mut d = doc(1);
        d.insert_text("content", 0, "abc").unwrap();
        assert_eq!(
            d.insert_text("content", 4, "x").unwrap_err(),
            DocError::IndexOutOfBounds { index: 4, len: 3 }
        );
        assert!(d.delete_text("content", 2, 2).is_err());
        assert_eq!(d.text("content").unwrap(), "abc");
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut d = doc(1);
        d.map_set("metadata", "title", json!("x")).unwrap();
        assert!(matches!(
            d.insert_text("metadata", 0, "a"),
            Err(DocError::TypeMismatch { expected: TypeKind::Text, actual: TypeKind::Map, .. })
        ));
        assert!(d.text("metadata").is_err());
    }

    #[test]
    fn array_update_replaces_slot() {
        let mut d = doc(1);
        d.insert_values("items", 0, vec![json!(1), json!(2), json!(3)])
            .unwrap();
        d.update_value("items", 1, json!("two")).unwrap();
        d.delete_values("items", 0, 1).unwrap();

        assert_eq!(d.array("items").unwrap(), vec![json!("two"), json!(3)]);
    }

    #[test]
    fn map_set_and_delete() {
        let mut d = doc(1);
        d.map_set("metadata", "title", json!("Draft")).unwrap();
        d.map_set("metadata", "tags", json!(["a"])).unwrap();
        d.map_delete("metadata", "tags").unwrap();

        assert_eq!(d.map_get("metadata", "title").unwrap(), Some(json!("Draft")));
        assert_eq!(d.map_get("metadata", "tags").unwrap(), None);
        assert_eq!(d.map_entries("metadata").unwrap().len(), 1);
    }

    #[test]
    fn one_event_per_commit_with_positions() {
        let mut d = doc(1);
        d.insert_text("content", 0, "abcdef").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = d.observe(move |e| sink.lock().unwrap().push(e.clone()));

        d.transact(Origin::Local, |txn| {
            txn.delete_text("content", 1, 2)?;
            txn.insert_text("content", 0, "XY")?;
            txn.map_set("metadata", "k", json!(1))
        })
        .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let content = &events[0].changes["content"];
        assert_eq!(
            content.sequence,
            vec![
                SequenceChange::Inserted { index: 0, len: 2 },
                SequenceChange::Deleted { index: 3, len: 2 },
            ]
        );
        assert!(events[0].changes["metadata"].keys.contains("k"));
        assert_eq!(d.text("content").unwrap(), "XYadef");
    }

    #[test]
    fn empty_transaction_fires_nothing() {
        let mut d = doc(1);
        let fired = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&fired);
        let _sub = d.observe(move |_| *sink.lock().unwrap() += 1);

        let commit = d.transact(Origin::Local, |_| Ok(())).unwrap();
        assert!(commit.update.is_empty());
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn failed_transaction_keeps_and_returns_earlier_edits() {
        let mut d = doc(1);
        let (commit, result) = d.transact_partial(Origin::Local, |txn| {
            txn.insert_text("content", 0, "x")?;
            txn.insert_text("content", 99, "y")
        });
        assert!(result.is_err());
        assert_eq!(commit.update.len(), 1);
        assert_eq!(d.text("content").unwrap(), "x");
        assert_eq!(d.state_vector().get(&d.replica()), 1);
    }

    #[test]
    fn diff_returns_only_unknown_records() {
        let mut a = doc(1);
        a.insert_text("content", 0, "ab").unwrap();
        let sv = a.state_vector().clone();
        a.insert_text("content", 2, "c").unwrap();

        let diff = a.diff(&sv);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.records()[0].id.clock, 3);
        assert_eq!(a.snapshot().len(), 3);
    }

    #[test]
    fn snapshot_carries_tombstones() {
        let mut a = doc(1);
        a.insert_text("content", 0, "abc").unwrap();
        a.delete_text("content", 1, 1).unwrap();

        let mut b = doc(2);
        let outcome = b.apply_update(&a.snapshot(), Origin::Remote).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(b.text("content").unwrap(), "ac");
    }

    #[test]
    fn gap_in_clocks_defers_whole_update() {
        let mut a = doc(1);
        let first = a.insert_text("content", 0, "a").unwrap();
        let second = a.insert_text("content", 1, "b").unwrap();

        let mut b = doc(2);
        match b.apply_update(&second.update, Origin::Remote).unwrap() {
            ApplyOutcome::Deferred { missing } => {
                assert_eq!(missing, vec![Id::new(ReplicaId::from_u128(1), 1)]);
            }
            other => panic!("expected deferral, got {other:?}"),
        }
        assert!(b.state_vector().is_empty());

        b.apply_update(&first.update, Origin::Remote).unwrap();
        b.apply_update(&second.update, Origin::Remote).unwrap();
        assert_eq!(b.text("content").unwrap(), "ab");
        assert!(matches!(
            b.apply_update(&second.update, Origin::Remote).unwrap(),
            ApplyOutcome::Redundant
        ));
    }

    #[test]
    fn own_snapshot_advances_local_clock() {
        let mut a = doc(1);
        a.insert_text("content", 0, "ab").unwrap();
        let snapshot = a.snapshot();

        let mut restarted = doc(1);
        restarted.apply_update(&snapshot, Origin::Remote).unwrap();
        let commit = restarted.insert_text("content", 2, "c").unwrap();
        assert_eq!(commit.update.records()[0].id.clock, 3);
    }
}

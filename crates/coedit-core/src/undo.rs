//! Scoped undo/redo over replicated edits.
//!
//! The manager records which item ids and map writes each local transaction
//! produced, never document snapshots. Undoing an entry issues new operations
//! (restore, tombstone, re-assert) in one transaction, so concurrent remote
//! edits outside the entry are left alone and the undo itself replicates like
//! any other edit.

use crate::clock::Id;
use crate::document::{Commit, DocError, Document, MapWrite, Origin, TxnChanges, TypeChanges};
use crate::event::{EventBus, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};

/// Default window within which consecutive edits merge into one entry.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// Which stack an [`UndoEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackKind {
    /// The undo stack
    Undo,
    /// The redo stack
    Redo,
}

/// Stack change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoEvent {
    /// An entry was pushed or extended
    Added {
        /// Stack that grew
        stack: StackKind,
        /// Whether an existing entry absorbed the edit
        merged: bool,
    },
    /// An entry was popped and applied
    Popped {
        /// Stack that shrank
        stack: StackKind,
    },
    /// Both stacks were emptied
    Cleared,
}

/// One coalesced batch of edits.
#[derive(Debug, Clone)]
pub struct StackItem {
    changes: TxnChanges,
    created: Instant,
}

impl StackItem {
    /// When the first edit of the batch was captured.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Ids and writes the batch touched, by shared type.
    #[must_use]
    pub fn changes(&self) -> &TxnChanges {
        &self.changes
    }

    fn absorb(&mut self, other: TxnChanges) {
        for (name, incoming) in other.types {
            let target = self.changes.types.entry(name).or_default();
            target.inserted.extend(incoming.inserted);
            target.deleted.extend(incoming.deleted);
            target.map_writes.extend(incoming.map_writes);
            normalize(target);
        }
    }
}

/// Drop deletions of items the batch inserted itself, and keep one write per
/// key: the latest id with the earliest previous value.
fn normalize(changes: &mut TypeChanges) {
    let inserted: HashSet<Id> = changes.inserted.iter().copied().collect();
    changes.deleted.retain(|id| !inserted.contains(id));

    let mut by_key: BTreeMap<String, MapWrite> = BTreeMap::new();
    for write in changes.map_writes.drain(..) {
        let latest = write.id;
        by_key
            .entry(write.key.clone())
            .and_modify(|kept| kept.id = latest)
            .or_insert(write);
    }
    changes.map_writes = by_key.into_values().collect();
}

/// Undo/redo stacks for a set of shared types.
pub struct UndoManager {
    scope: BTreeSet<String>,
    tracked: HashSet<Origin>,
    capture_timeout: Duration,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    last_capture: Option<Instant>,
    boundary: bool,
    events: EventBus<UndoEvent>,
}

impl std::fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoManager")
            .field("scope", &self.scope)
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .finish_non_exhaustive()
    }
}

impl UndoManager {
    /// Create a manager tracking local edits to the named shared types.
    pub fn new<I, S>(scope: I, capture_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope: scope.into_iter().map(Into::into).collect(),
            tracked: HashSet::from([Origin::Local]),
            capture_timeout,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            last_capture: None,
            boundary: false,
            events: EventBus::new(),
        }
    }

    /// Replace the set of origins whose commits are captured.
    #[must_use]
    pub fn with_tracked_origins(mut self, origins: impl IntoIterator<Item = Origin>) -> Self {
        self.tracked = origins.into_iter().collect();
        self
    }

    /// Subscribe to stack changes.
    #[must_use = "dropping the subscription detaches the handler immediately"]
    pub fn observe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&UndoEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    fn in_scope(&self, changes: &TxnChanges) -> TxnChanges {
        TxnChanges {
            types: changes
                .types
                .iter()
                .filter(|(name, c)| self.scope.contains(*name) && !c.is_empty())
                .map(|(name, c)| {
                    let mut c = c.clone();
                    normalize(&mut c);
                    (name.clone(), c)
                })
                .collect(),
        }
    }

    /// Offer a commit for capture.
    ///
    /// Returns `true` if the commit was recorded. Commits from untracked
    /// origins or touching no type in scope are ignored.
    pub fn capture(&mut self, commit: &Commit, now: Instant) -> bool {
        if !self.tracked.contains(&commit.origin) {
            return false;
        }
        let changes = self.in_scope(&commit.changes);
        if changes.is_empty() {
            return false;
        }

        let within_window = self
            .last_capture
            .is_some_and(|last| now.saturating_duration_since(last) < self.capture_timeout);
        let merged = match self.undo_stack.last_mut() {
            Some(top) if within_window && !self.boundary => {
                top.absorb(changes);
                true
            }
            _ => {
                self.undo_stack.push(StackItem {
                    changes,
                    created: now,
                });
                false
            }
        };
        self.last_capture = Some(now);
        self.boundary = false;
        self.redo_stack.clear();

        tracing::trace!(merged, depth = self.undo_stack.len(), "Captured undo entry");
        self.events.emit(&UndoEvent::Added {
            stack: StackKind::Undo,
            merged,
        });
        true
    }

    /// Force the next captured edit into a new entry.
    pub fn stop_capturing(&mut self) {
        self.boundary = true;
    }

    /// Whether there is something to undo.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Whether there is something to redo.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Entries on the undo stack.
    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    /// Entries on the redo stack.
    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    /// Empty both stacks.
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.last_capture = None;
        self.events.emit(&UndoEvent::Cleared);
    }

    /// Revert the most recent entry.
    ///
    /// Entries whose targets are all stale are discarded until one changes
    /// something. Returns `None` when nothing could be undone.
    ///
    /// # Errors
    ///
    /// Returns error if the reverting transaction fails.
    pub fn undo(&mut self, doc: &mut Document) -> Result<Option<Commit>, DocError> {
        self.pop_and_apply(doc, StackKind::Undo)
    }

    /// Re-apply the most recently undone entry.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub fn redo(&mut self, doc: &mut Document) -> Result<Option<Commit>, DocError> {
        self.pop_and_apply(doc, StackKind::Redo)
    }

    fn pop_and_apply(
        &mut self,
        doc: &mut Document,
        from: StackKind,
    ) -> Result<Option<Commit>, DocError> {
        let origin = match from {
            StackKind::Undo => Origin::Undo,
            StackKind::Redo => Origin::Redo,
        };
        loop {
            let popped = match from {
                StackKind::Undo => self.undo_stack.pop(),
                StackKind::Redo => self.redo_stack.pop(),
            };
            let Some(item) = popped else {
                return Ok(None);
            };

            let commit = doc.transact(origin, |txn| {
                for (name, changes) in &item.changes.types {
                    for id in &changes.deleted {
                        txn.restore_item(name, id)?;
                    }
                    for id in &changes.inserted {
                        txn.delete_item(name, id)?;
                    }
                    for write in changes.map_writes.iter().rev() {
                        txn.revert_map_write(name, write)?;
                    }
                }
                Ok(())
            })?;
            self.events.emit(&UndoEvent::Popped { stack: from });

            let reverse = self.in_scope(&commit.changes);
            if reverse.is_empty() {
                tracing::trace!(stack = ?from, "Skipped stale entry");
                continue;
            }

            let target = match from {
                StackKind::Undo => StackKind::Redo,
                StackKind::Redo => StackKind::Undo,
            };
            let entry = StackItem {
                changes: reverse,
                created: item.created,
            };
            match target {
                StackKind::Undo => self.undo_stack.push(entry),
                StackKind::Redo => self.redo_stack.push(entry),
            }
            self.boundary = true;
            self.events.emit(&UndoEvent::Added {
                stack: target,
                merged: false,
            });
            tracing::debug!(doc_id = %doc.id(), stack = ?from, records = commit.update.len(), "Applied undo step");
            return Ok(Some(commit));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReplicaId;
    use crate::document::DocId;
    use serde_json::json;

    fn setup() -> (Document, UndoManager, Instant) {
        let doc = Document::new(DocId::new("doc"), ReplicaId::from_u128(1));
        let undo = UndoManager::new(["content", "metadata"], DEFAULT_CAPTURE_TIMEOUT);
        (doc, undo, Instant::now())
    }

    #[test]
    fn coalesces_within_window() {
        let (mut doc, mut undo, t0) = setup();
        let c1 = doc.insert_text("content", 0, "ab").unwrap();
        let c2 = doc.insert_text("content", 2, "cd").unwrap();
        let c3 = doc.insert_text("content", 4, "ef").unwrap();

        assert!(undo.capture(&c1, t0));
        assert!(undo.capture(&c2, t0 + Duration::from_millis(100)));
        assert!(undo.capture(&c3, t0 + Duration::from_secs(2)));
        assert_eq!(undo.undo_len(), 2);

        undo.undo(&mut doc).unwrap();
        assert_eq!(doc.text("content").unwrap(), "abcd");
        undo.undo(&mut doc).unwrap();
        assert_eq!(doc.text("content").unwrap(), "");
        assert!(undo.undo(&mut doc).unwrap().is_none());
    }

    #[test]
    fn stop_capturing_forces_boundary() {
        let (mut doc, mut undo, t0) = setup();
        let c1 = doc.insert_text("content", 0, "a").unwrap();
        undo.capture(&c1, t0);
        undo.stop_capturing();
        let c2 = doc.insert_text("content", 1, "b").unwrap();
        undo.capture(&c2, t0);
        assert_eq!(undo.undo_len(), 2);
    }

    #[test]
    fn undo_redo_round_trip() {
        let (mut doc, mut undo, t0) = setup();
        doc.insert_text("content", 0, "Hello world").unwrap();
        doc.map_set("metadata", "title", json!("Draft")).unwrap();

        let edit = doc
            .transact(Origin::Local, |txn| {
                txn.delete_text("content", 5, 6)?;
                txn.insert_text("content", 5, "!")?;
                txn.map_set("metadata", "title", json!("Final"))
            })
            .unwrap();
        undo.capture(&edit, t0);

        undo.undo(&mut doc).unwrap().unwrap();
        assert_eq!(doc.text("content").unwrap(), "Hello world");
        assert_eq!(doc.map_get("metadata", "title").unwrap(), Some(json!("Draft")));
        assert!(undo.can_redo());

        undo.redo(&mut doc).unwrap().unwrap();
        assert_eq!(doc.text("content").unwrap(), "Hello!");
        assert_eq!(doc.map_get("metadata", "title").unwrap(), Some(json!("Final")));

        undo.undo(&mut doc).unwrap().unwrap();
        assert_eq!(doc.text("content").unwrap(), "Hello world");
    }

    #[test]
    fn new_edit_clears_redo() {
        let (mut doc, mut undo, t0) = setup();
        let c1 = doc.insert_text("content", 0, "a").unwrap();
        undo.capture(&c1, t0);
        undo.undo(&mut doc).unwrap();
        assert!(undo.can_redo());

        let c2 = doc.insert_text("content", 0, "b").unwrap();
        undo.capture(&c2, t0 + Duration::from_secs(1));
        assert!(!undo.can_redo());
    }

    #[test]
    fn out_of_scope_and_remote_commits_are_ignored() {
        let (mut doc, mut undo, t0) = setup();
        let other = doc.insert_text("notes", 0, "x").unwrap();
        assert!(!undo.capture(&other, t0));

        let mut remote = doc.insert_text("content", 0, "y").unwrap();
        remote.origin = Origin::Remote;
        assert!(!undo.capture(&remote, t0));
        assert!(!undo.can_undo());
    }

    #[test]
    fn remote_edits_survive_undo() {
        let (mut local, mut undo, t0) = setup();
        let mut peer = Document::new(DocId::new("doc"), ReplicaId::from_u128(2));

        let base = local.insert_text("content", 0, "ac").unwrap();
        peer.apply_update(&base.update, Origin::Remote).unwrap();

        let mine = local.insert_text("content", 1, "b").unwrap();
        undo.capture(&mine, t0);
        let theirs = peer.insert_text("content", 1, "Z").unwrap();
        local.apply_update(&theirs.update, Origin::Remote).unwrap();
        assert_eq!(local.text("content").unwrap(), "abZc");

        undo.undo(&mut local).unwrap();
        assert_eq!(local.text("content").unwrap(), "aZc");
    }

    #[test]
    fn map_undo_is_noop_when_overwritten() {
        let (mut doc, mut undo, t0) = setup();
        let mine = doc.map_set("metadata", "k", json!(1)).unwrap();
        undo.capture(&mine, t0);
        undo.stop_capturing();
        // Later write from an untracked origin
        doc.transact(Origin::Remote, |txn| txn.map_set("metadata", "k", json!(2)))
            .unwrap();

        assert!(undo.undo(&mut doc).unwrap().is_none());
        assert_eq!(doc.map_get("metadata", "k").unwrap(), Some(json!(2)));
        assert!(!undo.can_undo());
    }

    #[test]
    fn repeated_writes_restore_original_value() {
        let (mut doc, mut undo, t0) = setup();
        doc.map_set("metadata", "k", json!("orig")).unwrap();
        let w1 = doc.map_set("metadata", "k", json!("a")).unwrap();
        let w2 = doc.map_set("metadata", "k", json!("b")).unwrap();
        undo.capture(&w1, t0);
        undo.capture(&w2, t0 + Duration::from_millis(10));

        undo.undo(&mut doc).unwrap();
        assert_eq!(doc.map_get("metadata", "k").unwrap(), Some(json!("orig")));
    }

    #[test]
    fn clear_emits_event() {
        let (mut doc, mut undo, t0) = setup();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&events);
        let _sub = undo.observe(move |e| sink.lock().unwrap().push(*e));

        let c = doc.insert_text("content", 0, "a").unwrap();
        undo.capture(&c, t0);
        undo.clear();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                UndoEvent::Added { stack: StackKind::Undo, merged: false },
                UndoEvent::Cleared,
            ]
        );
        assert!(!undo.can_undo());
    }
}

//! Named document versions.
//!
//! A version is a full snapshot taken at a point in time. Restoring a version
//! does not rewind history: it issues ordinary local edits that turn the
//! current state into the snapshot's state, so the restoration replicates and
//! can itself be undone.

use crate::clock::ReplicaId;
use crate::codec::CodecError;
use crate::document::{ApplyOutcome, Commit, DocError, DocId, Document, Origin, Transaction, TypeKind};
use crate::update::Update;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One named snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Sequential version number, starting at 1
    pub number: u32,
    /// Short name
    pub name: String,
    /// Optional longer description
    pub description: Option<String>,
    /// When the version was taken
    pub created_at: DateTime<Utc>,
    /// Encoded snapshot update
    pub snapshot: Vec<u8>,
}

/// Differences between two versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    /// Text lines only present in the newer version
    pub lines_added: Vec<String>,
    /// Text lines only present in the older version
    pub lines_removed: Vec<String>,
    /// Map keys only present in the newer version
    pub keys_added: Vec<String>,
    /// Map keys only present in the older version
    pub keys_removed: Vec<String>,
    /// Map keys present in both with different values
    pub keys_changed: Vec<String>,
}

/// Ordered list of versions of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    versions: Vec<Version>,
}

impl VersionHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from stored versions.
    #[must_use]
    pub fn from_versions(mut versions: Vec<Version>) -> Self {
        versions.sort_by_key(|v| v.number);
        Self { versions }
    }

    /// Take a snapshot of `doc` as the next version.
    pub fn create(
        &mut self,
        doc: &Document,
        name: impl Into<String>,
        description: Option<String>,
    ) -> &Version {
        let number = self.versions.last().map_or(1, |v| v.number + 1);
        let version = Version {
            number,
            name: name.into(),
            description,
            created_at: Utc::now(),
            snapshot: doc.snapshot().encode(),
        };
        tracing::info!(doc_id = %doc.id(), version = number, name = %version.name, "Created version");
        self.versions.push(version);
        &self.versions[self.versions.len() - 1]
    }

    /// Look up a version by number.
    #[must_use]
    pub fn get(&self, number: u32) -> Option<&Version> {
        self.versions.iter().find(|v| v.number == number)
    }

    /// Every version, oldest first.
    #[must_use]
    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Most recent version.
    #[must_use]
    pub fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    fn materialize(&self, number: u32) -> Result<Document, VersionError> {
        let version = self.get(number).ok_or(VersionError::NotFound(number))?;
        let update = Update::decode(&version.snapshot)?;
        let mut doc = Document::new(DocId::new(format!("version-{number}")), ReplicaId::from_u128(0));
        match doc.apply_update(&update, Origin::Remote)? {
            ApplyOutcome::Deferred { missing } => Err(VersionError::Incomplete {
                number,
                missing: missing.len(),
            }),
            _ => Ok(doc),
        }
    }

    /// Compare the text type `text` and map type `map` of two versions.
    ///
    /// # Errors
    ///
    /// Returns error if either version is missing or its snapshot is corrupt.
    pub fn compare(
        &self,
        older: u32,
        newer: u32,
        text: &str,
        map: &str,
    ) -> Result<VersionDiff, VersionError> {
        let a = self.materialize(older)?;
        let b = self.materialize(newer)?;

        let text_a = a.text(text)?;
        let text_b = b.text(text)?;
        let lines_a: Vec<&str> = text_a.split('\n').collect();
        let lines_b: Vec<&str> = text_b.split('\n').collect();

        let map_a = a.map_entries(map)?;
        let map_b = b.map_entries(map)?;

        Ok(VersionDiff {
            lines_added: lines_b
                .iter()
                .filter(|line| !lines_a.contains(*line))
                .map(|line| (*line).to_owned())
                .collect(),
            lines_removed: lines_a
                .iter()
                .filter(|line| !lines_b.contains(*line))
                .map(|line| (*line).to_owned())
                .collect(),
            keys_added: map_b
                .keys()
                .filter(|k| !map_a.contains_key(*k))
                .cloned()
                .collect(),
            keys_removed: map_a
                .keys()
                .filter(|k| !map_b.contains_key(*k))
                .cloned()
                .collect(),
            keys_changed: map_a
                .iter()
                .filter(|(k, v)| map_b.get(*k).is_some_and(|other| other != *v))
                .map(|(k, _)| k.clone())
                .collect(),
        })
    }

    /// Bring `doc` back to the state of a version with local edits, then
    /// record a "Restored from version N" entry.
    ///
    /// # Errors
    ///
    /// Returns error if the version is missing, its snapshot is corrupt, or an
    /// edit fails.
    pub fn restore(&mut self, doc: &mut Document, number: u32) -> Result<Commit, VersionError> {
        let target = self.materialize(number)?;
        let name = self
            .get(number)
            .map(|v| v.name.clone())
            .unwrap_or_default();

        let names: BTreeSet<String> = target
            .type_names()
            .chain(doc.type_names())
            .map(str::to_owned)
            .collect();

        let commit = doc.transact(Origin::Local, |txn| {
            for type_name in &names {
                let kind = target
                    .kind_of(type_name)
                    .or_else(|| txn.doc().kind_of(type_name));
                match kind {
                    Some(TypeKind::Text) => restore_text(txn, &target, type_name)?,
                    Some(TypeKind::Array) => restore_array(txn, &target, type_name)?,
                    Some(TypeKind::Map) => restore_map(txn, &target, type_name)?,
                    None => {}
                }
            }
            Ok(())
        })?;

        self.create(
            doc,
            format!("Restored from version {number}"),
            Some(format!("Document restored to version \"{name}\" ({number})")),
        );
        Ok(commit)
    }
}

/// Length of the common prefix and suffix of two sequences.
fn common_ends<T: PartialEq>(a: &[T], b: &[T]) -> (usize, usize) {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    (prefix, suffix)
}

fn restore_text(txn: &mut Transaction<'_>, target: &Document, name: &str) -> Result<(), DocError> {
    let current: Vec<char> = txn.doc().text(name)?.chars().collect();
    let wanted: Vec<char> = target.text(name).unwrap_or_default().chars().collect();
    let (prefix, suffix) = common_ends(&current, &wanted);

    let removed = current.len() - prefix - suffix;
    if removed > 0 {
        txn.delete_text(name, prefix, removed)?;
    }
    let inserted: String = wanted[prefix..wanted.len() - suffix].iter().collect();
    if !inserted.is_empty() {
        txn.insert_text(name, prefix, &inserted)?;
    }
    Ok(())
}

fn restore_array(txn: &mut Transaction<'_>, target: &Document, name: &str) -> Result<(), DocError> {
    let current = txn.doc().array(name)?;
    let wanted = target.array(name).unwrap_or_default();
    let (prefix, suffix) = common_ends(&current, &wanted);

    let removed = current.len() - prefix - suffix;
    if removed > 0 {
        txn.delete_values(name, prefix, removed)?;
    }
    let inserted = wanted[prefix..wanted.len() - suffix].to_vec();
    if !inserted.is_empty() {
        txn.insert_values(name, prefix, inserted)?;
    }
    Ok(())
}

fn restore_map(txn: &mut Transaction<'_>, target: &Document, name: &str) -> Result<(), DocError> {
    let current = txn.doc().map_entries(name)?;
    let wanted = target.map_entries(name).unwrap_or_default();

    for key in current.keys().filter(|k| !wanted.contains_key(*k)) {
        txn.map_delete(name, key)?;
    }
    for (key, value) in wanted {
        if current.get(&key) != Some(&value) {
            txn.map_set(name, &key, value)?;
        }
    }
    Ok(())
}

/// Version errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VersionError {
    /// No version with this number
    #[error("version {0} not found")]
    NotFound(u32),
    /// The stored snapshot does not decode
    #[error("corrupt snapshot: {0}")]
    Codec(#[from] CodecError),
    /// The stored snapshot is missing records
    #[error("snapshot of version {number} is missing {missing} dependencies")]
    Incomplete {
        /// Version number
        number: u32,
        /// Number of missing ids
        missing: usize,
    },
    /// Editing the document failed
    #[error("document error: {0}")]
    Document(#[from] DocError),
}

//! Per-replica arena of open documents.

use crate::config::SessionConfig;
use crate::persistence::SnapshotStore;
use crate::session::{SessionError, SyncSession};
use crate::transport::Transport;
use coedit_core::{
    ApplyOutcome, DocError, DocId, Document, Origin, ReplicaId, Update, UserProfile,
    VersionHistory,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Owns the sessions of one replica, keyed by document id.
pub struct Workspace<T: Transport> {
    replica: ReplicaId,
    transport: Arc<T>,
    store: Option<Arc<dyn SnapshotStore>>,
    config: SessionConfig,
    user: Option<UserProfile>,
    sessions: HashMap<DocId, SyncSession<T>>,
}

impl<T: Transport> Workspace<T> {
    /// Create an empty workspace.
    #[must_use]
    pub fn new(
        replica: ReplicaId,
        transport: Arc<T>,
        store: Option<Arc<dyn SnapshotStore>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            replica,
            transport,
            store,
            config,
            user: None,
            sessions: HashMap::new(),
        }
    }

    /// Announce this profile in every document opened afterwards.
    #[must_use]
    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    /// Local replica id.
    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Open a document: restore its snapshot and versions, then join its
    /// room. Opening an already open document returns its session.
    ///
    /// # Errors
    ///
    /// Returns error if the stored snapshot is unreadable or the room
    /// rejects us.
    pub async fn open(&mut self, doc_id: &DocId) -> Result<&SyncSession<T>, SessionError> {
        if !self.sessions.contains_key(doc_id) {
            let session = self.load(doc_id)?;
            if let Some(user) = &self.user {
                session
                    .update_awareness(|awareness| Some(awareness.set_user(user)))
                    .await;
            }
            session.join().await?;
            self.sessions.insert(doc_id.clone(), session);
        }
        Ok(&self.sessions[doc_id])
    }

    fn load(&self, doc_id: &DocId) -> Result<SyncSession<T>, SessionError> {
        let mut doc = Document::new(doc_id.clone(), self.replica);
        let mut versions = VersionHistory::new();

        if let Some(store) = &self.store {
            if let Some(bytes) = store.load_snapshot(doc_id)? {
                let snapshot = Update::decode(&bytes).map_err(DocError::from)?;
                if let ApplyOutcome::Deferred { missing } =
                    doc.apply_update(&snapshot, Origin::Remote)?
                {
                    tracing::warn!(
                        doc_id = %doc_id,
                        missing = missing.len(),
                        "Stored snapshot is incomplete, starting empty"
                    );
                }
                tracing::info!(doc_id = %doc_id, records = snapshot.len(), "Restored snapshot");
            }
            versions = VersionHistory::from_versions(store.load_versions(doc_id)?);
        }

        Ok(SyncSession::new(
            doc,
            Arc::clone(&self.transport),
            self.store.clone(),
            self.config.clone(),
        )
        .with_versions(versions))
    }

    /// Session of an open document.
    #[must_use]
    pub fn get(&self, doc_id: &DocId) -> Option<&SyncSession<T>> {
        self.sessions.get(doc_id)
    }

    /// Ids of the open documents.
    pub fn documents(&self) -> impl Iterator<Item = &DocId> {
        self.sessions.keys()
    }

    /// Leave a document's room and drop it. Returns `false` if it was not
    /// open.
    ///
    /// # Errors
    ///
    /// Returns error if leaving fails; the document is dropped regardless.
    pub async fn close(&mut self, doc_id: &DocId) -> Result<bool, SessionError> {
        let Some(session) = self.sessions.remove(doc_id) else {
            return Ok(false);
        };
        session.leave().await?;
        Ok(true)
    }

    /// Close every open document.
    ///
    /// # Errors
    ///
    /// Returns the first error; the remaining documents are still closed.
    pub async fn close_all(&mut self) -> Result<(), SessionError> {
        let mut first_error = None;
        for (doc_id, session) in self.sessions.drain() {
            if let Err(err) = session.leave().await {
                tracing::warn!(doc_id = %doc_id, error = %err, "Failed to leave cleanly");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

//! Sync sessions: one document replicated through one transport room.
//!
//! A session owns the shared document handle, the local awareness state and
//! the undo manager of one replica. It speaks the two-step sync handshake
//! with the other members of the room, broadcasts local commits, and keeps
//! working while the link is down:
//!
//! - local edits always apply; their updates wait in an outbox
//! - remote updates with unknown dependencies wait in a pending queue
//! - a dropped link is re-joined with exponential backoff, followed by the
//!   same reconciliation as the first join

use crate::config::SessionConfig;
use crate::persistence::{PersistenceError, SnapshotStore};
use crate::transport::{Transport, TransportError, TransportEvent};
use coedit_core::{
    ApplyOutcome, Awareness, AwarenessUpdate, Commit, DocError, DocId, Document, Origin,
    ReplicaId, Transaction, UndoManager, Update, Version, VersionError, VersionHistory,
};
use coedit_proto::{room_for, Envelope, MessageError, Payload};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// A document shared between a session and its users.
pub type SharedDocument = Arc<tokio::sync::Mutex<Document>>;

/// Awareness state shared between a session and its users.
pub type SharedAwareness = Arc<tokio::sync::Mutex<Awareness>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [
            self.reconnect.take(),
            self.heartbeat.take(),
            self.reader.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

#[derive(Default)]
struct SyncState {
    /// `join()` was called and `leave()` was not
    active: bool,
    /// The room is joined on a live link
    joined: bool,
    pending: Vec<Update>,
    pending_records: usize,
    outbox: Vec<Update>,
    unsaved: usize,
    tasks: Tasks,
}

struct Inner<T> {
    doc_id: DocId,
    room: String,
    replica: ReplicaId,
    doc: SharedDocument,
    awareness: SharedAwareness,
    undo: Mutex<UndoManager>,
    versions: Mutex<VersionHistory>,
    transport: Arc<T>,
    store: Option<Arc<dyn SnapshotStore>>,
    config: SessionConfig,
    state: Mutex<SyncState>,
}

/// Synchronizes one document with the other members of its room.
pub struct SyncSession<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> SyncSession<T> {
    /// Create a session for `doc`. Nothing is sent until [`Self::join`].
    #[must_use]
    pub fn new(
        doc: Document,
        transport: Arc<T>,
        store: Option<Arc<dyn SnapshotStore>>,
        config: SessionConfig,
    ) -> Self {
        let doc_id = doc.id().clone();
        let replica = doc.replica();
        let awareness = Awareness::new(replica, config.awareness_timeout);
        let undo = UndoManager::new(config.undo_scope.iter().cloned(), config.capture_timeout);

        Self {
            inner: Arc::new(Inner {
                room: room_for(&doc_id),
                doc_id,
                replica,
                doc: Arc::new(tokio::sync::Mutex::new(doc)),
                awareness: Arc::new(tokio::sync::Mutex::new(awareness)),
                undo: Mutex::new(undo),
                versions: Mutex::new(VersionHistory::new()),
                transport,
                store,
                config,
                state: Mutex::new(SyncState::default()),
            }),
        }
    }

    /// Replace the version history (e.g. with versions loaded from storage).
    #[must_use]
    pub fn with_versions(self, versions: VersionHistory) -> Self {
        *lock(&self.inner.versions) = versions;
        self
    }

    /// Document id.
    #[must_use]
    pub fn doc_id(&self) -> &DocId {
        &self.inner.doc_id
    }

    /// Room name.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.inner.room
    }

    /// Local replica id, also used as sender id.
    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.inner.replica
    }

    /// Shared document handle.
    #[must_use]
    pub fn document(&self) -> SharedDocument {
        Arc::clone(&self.inner.doc)
    }

    /// Shared awareness handle.
    #[must_use]
    pub fn awareness(&self) -> SharedAwareness {
        Arc::clone(&self.inner.awareness)
    }

    /// Whether the room is joined on a live link.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        lock(&self.inner.state).joined
    }

    /// Records held back until their dependencies arrive.
    #[must_use]
    pub fn pending_records(&self) -> usize {
        lock(&self.inner.state).pending_records
    }

    /// Local updates waiting for the link.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        lock(&self.inner.state).outbox.len()
    }

    /// Join the document room and reconcile with its members.
    ///
    /// Rejected joins are retried with exponential backoff up to
    /// `join_attempts` times. A link that is down is not an error: the
    /// session re-joins as soon as the transport reports it up again.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::JoinRejected`] once the attempts are used up.
    pub async fn join(&self) -> Result<(), SessionError> {
        {
            let mut state = lock(&self.inner.state);
            if state.active {
                return Ok(());
            }
            state.active = true;
            // Subscribe before joining so no answer to our step 1 is missed
            let events = self.inner.transport.events();
            state.tasks.reader = Some(Inner::spawn_reader(&self.inner, events));
        }

        match self.inner.join_with_retry().await {
            Ok(()) => self.inner.handshake().await,
            Err(SessionError::Transport(TransportError::Unavailable(reason))) => {
                tracing::info!(
                    doc_id = %self.inner.doc_id,
                    reason = %reason,
                    "Link down, joining once it is back"
                );
            }
            Err(e) => {
                let mut state = lock(&self.inner.state);
                state.active = false;
                state.tasks.abort_all();
                return Err(e);
            }
        }

        let heartbeat = Inner::spawn_heartbeat(&self.inner);
        lock(&self.inner.state).tasks.heartbeat = Some(heartbeat);
        Ok(())
    }

    /// Leave the room.
    ///
    /// Cancels reconnect attempts, publishes the local awareness tombstone,
    /// announces the departure and stores a final snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the request or the snapshot
    /// cannot be saved.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let mut tasks = {
            let mut state = lock(&self.inner.state);
            state.active = false;
            std::mem::take(&mut state.tasks)
        };
        tasks.abort_all();

        let tombstone = {
            let mut awareness = self.inner.awareness.lock().await;
            awareness
                .local_state()
                .is_some()
                .then(|| awareness.set_local_state(None))
        };
        if self.is_joined() {
            if let Some(update) = tombstone {
                self.inner.send(Payload::AwarenessUpdate(update));
            }
            self.inner.send(Payload::LeaveNotice);
        }

        let left = self.inner.transport.leave(&self.inner.room).await;
        lock(&self.inner.state).joined = false;
        tracing::info!(doc_id = %self.inner.doc_id, room = %self.inner.room, "Left room");

        self.inner.save_snapshot().await?;
        match left {
            Ok(()) | Err(TransportError::Unavailable(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run a local transaction and broadcast its update.
    ///
    /// Edits made before `f` fails are kept, broadcast and captured for undo
    /// like any other commit.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by `f`.
    pub async fn transact<F>(&self, f: F) -> Result<Commit, SessionError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), DocError>,
    {
        let mut doc = self.inner.doc.lock().await;
        let (commit, result) = doc.transact_partial(Origin::Local, f);
        self.inner.on_local_change(&commit);
        if let Err(err) = result {
            tracing::debug!(
                doc_id = %self.inner.doc_id,
                records = commit.update.len(),
                error = %err,
                "Transaction failed after partial edits"
            );
            return Err(err.into());
        }
        Ok(commit)
    }

    /// Broadcast a commit made directly on the shared document.
    ///
    /// Remote-origin commits are ignored so updates are never echoed.
    pub fn on_local_change(&self, commit: &Commit) {
        self.inner.on_local_change(commit);
    }

    /// Decode and apply one message received from the room.
    ///
    /// # Errors
    ///
    /// Returns error if the message is malformed.
    pub async fn on_remote_message(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.inner.on_remote_message(bytes).await
    }

    /// Revert the most recent local edit. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns error if the reverting transaction fails.
    pub async fn undo(&self) -> Result<bool, SessionError> {
        let mut doc = self.inner.doc.lock().await;
        let Some(commit) = lock(&self.inner.undo).undo(&mut doc)? else {
            return Ok(false);
        };
        self.inner.on_local_change(&commit);
        Ok(true)
    }

    /// Re-apply the most recently undone edit. Returns `false` if there was
    /// none.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn redo(&self) -> Result<bool, SessionError> {
        let mut doc = self.inner.doc.lock().await;
        let Some(commit) = lock(&self.inner.undo).redo(&mut doc)? else {
            return Ok(false);
        };
        self.inner.on_local_change(&commit);
        Ok(true)
    }

    /// Access the undo manager (boundaries, subscriptions, stack sizes).
    pub fn with_undo<R>(&self, f: impl FnOnce(&mut UndoManager) -> R) -> R {
        f(&mut lock(&self.inner.undo))
    }

    /// Change the local awareness state and broadcast the result.
    ///
    /// `f` returns the update to send, as the [`Awareness`] setters do.
    pub async fn update_awareness<F>(&self, f: F)
    where
        F: FnOnce(&mut Awareness) -> Option<AwarenessUpdate>,
    {
        let update = f(&mut *self.inner.awareness.lock().await);
        if let Some(update) = update {
            if self.is_joined() {
                self.inner.send(Payload::AwarenessUpdate(update));
            }
        }
    }

    /// Take a named snapshot of the document.
    ///
    /// # Errors
    ///
    /// Returns error if the version cannot be stored.
    pub async fn create_version(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Version, SessionError> {
        let doc = self.inner.doc.lock().await;
        let version = lock(&self.inner.versions)
            .create(&doc, name, description)
            .clone();
        drop(doc);
        if let Some(store) = &self.inner.store {
            store.save_version(&self.inner.doc_id, &version)?;
        }
        Ok(version)
    }

    /// Restore a version with ordinary local edits and broadcast them.
    ///
    /// # Errors
    ///
    /// Returns error if the version is unknown or cannot be applied.
    pub async fn restore_version(&self, number: u32) -> Result<Commit, SessionError> {
        let mut doc = self.inner.doc.lock().await;
        let (commit, marker) = {
            let mut versions = lock(&self.inner.versions);
            let commit = versions.restore(&mut doc, number)?;
            (commit, versions.latest().cloned())
        };
        self.inner.on_local_change(&commit);
        drop(doc);
        if let (Some(store), Some(marker)) = (&self.inner.store, marker) {
            store.save_version(&self.inner.doc_id, &marker)?;
        }
        Ok(commit)
    }

    /// Every stored version, oldest first.
    #[must_use]
    pub fn versions(&self) -> Vec<Version> {
        lock(&self.inner.versions).versions().to_vec()
    }

    /// One heartbeat: renew the local awareness state, expire silent peers,
    /// retry queued updates and snapshot once enough records accumulated.
    ///
    /// Runs on the `heartbeat` interval after [`Self::join`].
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be saved.
    pub async fn tick(&self) -> Result<(), SessionError> {
        self.inner.tick().await
    }

    /// Store a snapshot of the document now.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be saved.
    pub async fn save_snapshot(&self) -> Result<(), SessionError> {
        self.inner.save_snapshot().await
    }
}

impl<T: Transport> Drop for SyncSession<T> {
    fn drop(&mut self) {
        lock(&self.inner.state).tasks.abort_all();
    }
}

impl<T: Transport> Inner<T> {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.config
            .reconnect_base
            .saturating_mul(factor)
            .min(self.config.reconnect_max)
    }

    async fn join_with_retry(&self) -> Result<(), SessionError> {
        let mut attempt = 0;
        loop {
            match self.transport.join(&self.room).await {
                Ok(()) => return Ok(()),
                Err(TransportError::JoinRejected(room))
                    if attempt + 1 < self.config.join_attempts =>
                {
                    let delay = self.backoff(attempt);
                    tracing::warn!(room = %room, attempt, delay = ?delay, "Join rejected, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Announce ourselves, ask for what we miss and flush the outbox.
    async fn handshake(&self) {
        lock(&self.state).joined = true;

        let state_vector = self.doc.lock().await.state_vector().clone();
        let presence = {
            let awareness = self.awareness.lock().await;
            awareness
                .local_state()
                .is_some()
                .then(|| awareness.encode_local())
        };

        self.send(Payload::JoinNotice);
        self.send_envelope(&Envelope::sync_step1(
            self.room.as_str(),
            self.replica,
            &state_vector,
        ));
        if let Some(update) = presence {
            self.send(Payload::AwarenessUpdate(update));
        }
        self.flush_outbox();

        tracing::info!(doc_id = %self.doc_id, room = %self.room, "Joined room");
    }

    fn send(&self, payload: Payload) -> bool {
        self.send_envelope(&Envelope::new(self.room.as_str(), self.replica, payload))
    }

    fn send_envelope(&self, envelope: &Envelope) -> bool {
        let bytes = match envelope.to_cbor() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "Failed to encode envelope");
                return false;
            }
        };
        match self.transport.send(&self.room, bytes) {
            Ok(()) => {
                tracing::trace!(room = %self.room, kind = envelope.payload.kind(), "Sent message");
                true
            }
            Err(err) => {
                tracing::debug!(
                    room = %self.room,
                    kind = envelope.payload.kind(),
                    error = %err,
                    "Send failed"
                );
                false
            }
        }
    }

    fn on_local_change(&self, commit: &Commit) {
        if commit.origin == Origin::Remote || commit.update.is_empty() {
            return;
        }
        lock(&self.undo).capture(commit, Instant::now());

        let joined = {
            let mut state = lock(&self.state);
            state.unsaved += commit.update.len();
            state.joined
        };
        if joined
            && self.send_envelope(&Envelope::sync_update(
                self.room.as_str(),
                self.replica,
                &commit.update,
            ))
        {
            return;
        }
        tracing::debug!(
            doc_id = %self.doc_id,
            records = commit.update.len(),
            "Queued local update"
        );
        lock(&self.state).outbox.push(commit.update.clone());
    }

    fn flush_outbox(&self) {
        let queued = std::mem::take(&mut lock(&self.state).outbox);
        if queued.is_empty() {
            return;
        }
        let merged = Update::merge(queued);
        if self.send_envelope(&Envelope::sync_update(
            self.room.as_str(),
            self.replica,
            &merged,
        )) {
            tracing::debug!(doc_id = %self.doc_id, records = merged.len(), "Flushed outbox");
        } else {
            lock(&self.state).outbox.push(merged);
        }
    }

    async fn on_remote_message(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let envelope = Envelope::from_cbor(bytes)?;
        if envelope.room != self.room || envelope.sender == self.replica {
            return Ok(());
        }
        tracing::debug!(
            doc_id = %self.doc_id,
            sender = %envelope.sender,
            kind = envelope.payload.kind(),
            "Received message"
        );

        match &envelope.payload {
            Payload::SyncStep1 { .. } => {
                let remote = envelope.payload.state_vector()?;
                let diff = self.doc.lock().await.diff(&remote);
                if !diff.is_empty() {
                    self.send_envelope(&Envelope::sync_step2(
                        self.room.as_str(),
                        self.replica,
                        &diff,
                    ));
                }
            }
            Payload::SyncStep2 { .. } | Payload::SyncUpdate { .. } => {
                let update = envelope.payload.update()?;
                self.apply_remote(update).await?;
            }
            Payload::AwarenessUpdate(update) => {
                self.awareness
                    .lock()
                    .await
                    .apply_update(update, Instant::now());
            }
            Payload::JoinNotice => {
                let state_vector = self.doc.lock().await.state_vector().clone();
                self.send_envelope(&Envelope::sync_step1(
                    self.room.as_str(),
                    self.replica,
                    &state_vector,
                ));
                let presence = {
                    let awareness = self.awareness.lock().await;
                    awareness
                        .local_state()
                        .is_some()
                        .then(|| awareness.encode_local())
                };
                if let Some(update) = presence {
                    self.send(Payload::AwarenessUpdate(update));
                }
            }
            Payload::LeaveNotice => {
                self.awareness
                    .lock()
                    .await
                    .remove_peers(&[envelope.sender]);
            }
        }
        Ok(())
    }

    async fn apply_remote(&self, update: Update) -> Result<(), SessionError> {
        let mut doc = self.doc.lock().await;
        match doc.apply_update(&update, Origin::Remote)? {
            ApplyOutcome::Applied(commit) => {
                let applied = commit.update.len() + self.drain_pending(&mut doc)?;
                lock(&self.state).unsaved += applied;
            }
            ApplyOutcome::Redundant => {}
            ApplyOutcome::Deferred { missing } => {
                let overflow = {
                    let mut state = lock(&self.state);
                    state.pending_records += update.len();
                    state.pending.push(update);
                    if state.pending_records > self.config.max_pending {
                        state.pending.clear();
                        state.pending_records = 0;
                        true
                    } else {
                        false
                    }
                };
                if overflow {
                    tracing::warn!(
                        doc_id = %self.doc_id,
                        max_pending = self.config.max_pending,
                        "Pending queue overflow, requesting full resync"
                    );
                    let state_vector = doc.state_vector().clone();
                    self.send_envelope(&Envelope::sync_step1(
                        self.room.as_str(),
                        self.replica,
                        &state_vector,
                    ));
                } else {
                    tracing::debug!(
                        doc_id = %self.doc_id,
                        missing = missing.len(),
                        "Holding update until dependencies arrive"
                    );
                }
            }
        }
        Ok(())
    }

    /// Retry held updates until a full pass makes no progress.
    fn drain_pending(&self, doc: &mut Document) -> Result<usize, DocError> {
        let mut applied = 0;
        loop {
            let held = {
                let mut state = lock(&self.state);
                state.pending_records = 0;
                std::mem::take(&mut state.pending)
            };
            if held.is_empty() {
                return Ok(applied);
            }

            let mut progressed = false;
            let mut still_held = Vec::new();
            for update in held {
                match doc.apply_update(&update, Origin::Remote)? {
                    ApplyOutcome::Applied(commit) => {
                        applied += commit.update.len();
                        progressed = true;
                    }
                    ApplyOutcome::Redundant => {}
                    ApplyOutcome::Deferred { .. } => still_held.push(update),
                }
            }

            let mut state = lock(&self.state);
            state.pending_records += still_held.iter().map(Update::len).sum::<usize>();
            state.pending.extend(still_held);
            if !progressed {
                return Ok(applied);
            }
        }
    }

    async fn request_resync(&self) {
        let state_vector = self.doc.lock().await.state_vector().clone();
        self.send_envelope(&Envelope::sync_step1(
            self.room.as_str(),
            self.replica,
            &state_vector,
        ));
    }

    /// Handle a message that could not be processed. Returns `false` once
    /// the session has stopped and the reader must exit.
    async fn on_remote_error(&self, err: SessionError) -> bool {
        match err {
            SessionError::Message(MessageError::Codec(err)) => {
                tracing::warn!(
                    doc_id = %self.doc_id,
                    error = %err,
                    "Dropped malformed update, requesting full resync"
                );
                self.request_resync().await;
                true
            }
            SessionError::Doc(DocError::DuplicateId(id)) => {
                tracing::error!(
                    doc_id = %self.doc_id,
                    id = %id,
                    "Operation id reused by a peer, stopping session"
                );
                self.halt().await;
                false
            }
            err => {
                tracing::warn!(doc_id = %self.doc_id, error = %err, "Dropped remote message");
                true
            }
        }
    }

    /// Stop syncing without the goodbye of `leave()`. Local edits keep
    /// applying and wait in the outbox.
    async fn halt(&self) {
        {
            let mut state = lock(&self.state);
            state.active = false;
            state.joined = false;
            for task in [state.tasks.reconnect.take(), state.tasks.heartbeat.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        }
        if let Err(err) = self.transport.leave(&self.room).await {
            tracing::debug!(room = %self.room, error = %err, "Leave after halt failed");
        }
    }

    async fn tick(&self) -> Result<(), SessionError> {
        let (renewal, expired) = {
            let mut awareness = self.awareness.lock().await;
            (awareness.renew(), awareness.remove_expired(Instant::now()))
        };
        if !expired.is_empty() {
            tracing::debug!(doc_id = %self.doc_id, expired = expired.len(), "Expired peers");
        }

        let (joined, due) = {
            let state = lock(&self.state);
            let threshold = self.config.snapshot_threshold;
            (state.joined, threshold > 0 && state.unsaved >= threshold)
        };
        if joined {
            if let Some(update) = renewal {
                self.send(Payload::AwarenessUpdate(update));
            }
            self.flush_outbox();
        }
        if due {
            self.save_snapshot().await?;
        }
        Ok(())
    }

    async fn save_snapshot(&self) -> Result<(), SessionError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        // Hold the document so no record slips between encode and reset
        let doc = self.doc.lock().await;
        let bytes = doc.snapshot().encode();
        store.save_snapshot(&self.doc_id, &bytes)?;
        lock(&self.state).unsaved = 0;
        tracing::debug!(doc_id = %self.doc_id, bytes = bytes.len(), "Stored snapshot");
        Ok(())
    }

    fn on_disconnect(&self) {
        lock(&self.state).joined = false;
        tracing::warn!(doc_id = %self.doc_id, room = %self.room, "Link down, queueing updates");
    }

    fn schedule_reconnect(this: &Arc<Self>) {
        let mut state = lock(&this.state);
        if !state.active
            || state
                .tasks
                .reconnect
                .as_ref()
                .is_some_and(|task| !task.is_finished())
        {
            return;
        }

        let inner = Arc::clone(this);
        state.tasks.reconnect = Some(tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                match inner.transport.join(&inner.room).await {
                    Ok(()) => {
                        inner.handshake().await;
                        return;
                    }
                    Err(err) => {
                        let delay = inner.backoff(attempt);
                        tracing::warn!(
                            doc_id = %inner.doc_id,
                            attempt,
                            error = %err,
                            "Re-join failed"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }));
    }

    fn spawn_reader(
        this: &Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Message { room, bytes }) => {
                        if room != inner.room {
                            continue;
                        }
                        if let Err(err) = inner.on_remote_message(&bytes).await {
                            if !inner.on_remote_error(err).await {
                                return;
                            }
                        }
                    }
                    Ok(TransportEvent::ConnectionStatus(false)) => inner.on_disconnect(),
                    Ok(TransportEvent::ConnectionStatus(true)) => Inner::schedule_reconnect(&inner),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(doc_id = %inner.doc_id, skipped, "Receiver lagged, resyncing");
                        inner.request_resync().await;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    fn spawn_heartbeat(this: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.heartbeat);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = inner.tick().await {
                    tracing::warn!(doc_id = %inner.doc_id, error = %err, "Heartbeat failed");
                }
            }
        })
    }
}

/// Errors for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Applying or creating an edit failed
    #[error("document error: {0}")]
    Doc(#[from] DocError),
    /// A received message is malformed
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    /// The transport refused a request
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Storing a snapshot or version failed
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    /// Creating or restoring a version failed
    #[error("version error: {0}")]
    Version(#[from] VersionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::transport::{MemoryHub, MemoryTransport};
    use serde_json::json;

    fn session(hub: &MemoryHub, n: u128, config: SessionConfig) -> SyncSession<MemoryTransport> {
        let doc = Document::new(DocId::new("notes"), ReplicaId::from_u128(n));
        SyncSession::new(doc, Arc::new(hub.connect()), None, config)
    }

    fn remote_update(n: u128, f: impl FnOnce(&mut Document) -> Commit) -> (Document, Update) {
        let mut doc = Document::new(DocId::new("notes"), ReplicaId::from_u128(n));
        let commit = f(&mut doc);
        (doc, commit.update)
    }

    fn envelope(sender: u128, update: &Update) -> Vec<u8> {
        Envelope::sync_update("doc-notes", ReplicaId::from_u128(sender), update)
            .to_cbor()
            .unwrap()
    }

    #[tokio::test]
    async fn edits_before_join_wait_in_outbox() {
        let hub = MemoryHub::new();
        let a = session(&hub, 1, SessionConfig::default());
        a.transact(|txn| txn.insert_text("content", 0, "draft"))
            .await
            .unwrap();
        assert_eq!(a.outbox_len(), 1);
        assert!(!a.is_joined());

        a.join().await.unwrap();
        assert!(a.is_joined());
        assert_eq!(a.outbox_len(), 0);
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn deferred_updates_apply_once_dependencies_arrive() {
        let hub = MemoryHub::new();
        let a = session(&hub, 1, SessionConfig::default());

        let (mut peer, first) = remote_update(2, |d| d.insert_text("content", 0, "ab").unwrap());
        let second = peer.insert_text("content", 2, "c").unwrap().update;

        a.on_remote_message(&envelope(2, &second)).await.unwrap();
        assert_eq!(a.pending_records(), 1);
        assert_eq!(a.document().lock().await.text("content").unwrap(), "");

        a.on_remote_message(&envelope(2, &first)).await.unwrap();
        assert_eq!(a.pending_records(), 0);
        assert_eq!(a.document().lock().await.text("content").unwrap(), "abc");
    }

    #[tokio::test]
    async fn pending_overflow_drops_the_queue() {
        let hub = MemoryHub::new();
        let config = SessionConfig {
            max_pending: 2,
            ..SessionConfig::default()
        };
        let a = session(&hub, 1, config);

        let (mut peer, _first) = remote_update(2, |d| d.insert_text("content", 0, "x").unwrap());
        let later = peer.insert_text("content", 1, "yz").unwrap().update;
        let last = peer.insert_text("content", 3, "!").unwrap().update;

        a.on_remote_message(&envelope(2, &later)).await.unwrap();
        assert_eq!(a.pending_records(), 2);
        a.on_remote_message(&envelope(2, &last)).await.unwrap();
        assert_eq!(a.pending_records(), 0);
    }

    #[tokio::test]
    async fn own_and_foreign_messages_are_ignored() {
        let hub = MemoryHub::new();
        let a = session(&hub, 1, SessionConfig::default());
        let (_, update) = remote_update(1, |d| d.insert_text("content", 0, "me").unwrap());
        a.on_remote_message(&envelope(1, &update)).await.unwrap();

        let (_, update) = remote_update(3, |d| d.insert_text("content", 0, "other").unwrap());
        let foreign = Envelope::sync_update("doc-elsewhere", ReplicaId::from_u128(3), &update)
            .to_cbor()
            .unwrap();
        a.on_remote_message(&foreign).await.unwrap();

        assert_eq!(a.document().lock().await.text("content").unwrap(), "");
        assert!(a.on_remote_message(&[0xff]).await.is_err());
    }

    #[tokio::test]
    async fn undo_and_redo_through_the_session() {
        let hub = MemoryHub::new();
        let a = session(&hub, 1, SessionConfig::default());
        a.transact(|txn| txn.map_set("metadata", "title", json!("Draft")))
            .await
            .unwrap();

        assert!(a.undo().await.unwrap());
        assert_eq!(
            a.document().lock().await.map_get("metadata", "title").unwrap(),
            None
        );
        assert!(a.redo().await.unwrap());
        assert_eq!(
            a.document().lock().await.map_get("metadata", "title").unwrap(),
            Some(json!("Draft"))
        );
        assert!(!a.redo().await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_is_saved_once_threshold_is_reached() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            snapshot_threshold: 3,
            ..SessionConfig::default()
        };
        let doc = Document::new(DocId::new("notes"), ReplicaId::from_u128(1));
        let shared: Arc<dyn SnapshotStore> = store.clone();
        let a = SyncSession::new(doc, Arc::new(hub.connect()), Some(shared), config);

        a.transact(|txn| txn.insert_text("content", 0, "ab"))
            .await
            .unwrap();
        a.tick().await.unwrap();
        assert!(store.load_snapshot(a.doc_id()).unwrap().is_none());

        a.transact(|txn| txn.insert_text("content", 2, "c"))
            .await
            .unwrap();
        a.tick().await.unwrap();
        let bytes = store.load_snapshot(a.doc_id()).unwrap().unwrap();
        let snapshot = Update::decode(&bytes).unwrap();
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn versions_are_stored_and_restored() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::new());
        let doc = Document::new(DocId::new("notes"), ReplicaId::from_u128(1));
        let shared: Arc<dyn SnapshotStore> = store.clone();
        let a = SyncSession::new(doc, Arc::new(hub.connect()), Some(shared), SessionConfig::default());

        a.transact(|txn| txn.insert_text("content", 0, "v1"))
            .await
            .unwrap();
        let v1 = a.create_version("first", None).await.unwrap();
        a.transact(|txn| txn.insert_text("content", 2, " and more"))
            .await
            .unwrap();

        a.restore_version(v1.number).await.unwrap();
        assert_eq!(a.document().lock().await.text("content").unwrap(), "v1");

        let stored = store.load_versions(a.doc_id()).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].name, "Restored from version 1");
        assert_eq!(a.versions(), stored);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let hub = MemoryHub::new();
        let config = SessionConfig {
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(1000),
            ..SessionConfig::default()
        };
        let a = session(&hub, 1, config);
        assert_eq!(a.inner.backoff(0), Duration::from_millis(100));
        assert_eq!(a.inner.backoff(2), Duration::from_millis(400));
        assert_eq!(a.inner.backoff(10), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn reused_operation_id_stops_the_session() {
        let hub = MemoryHub::new();
        let a = session(&hub, 1, SessionConfig::default());
        a.join().await.unwrap();

        let reused = DocError::DuplicateId(coedit_core::Id::new(ReplicaId::from_u128(2), 1));
        assert!(!a.inner.on_remote_error(reused.into()).await);
        assert!(!a.is_joined());

        // Local edits still apply and wait for a later join
        a.transact(|txn| txn.insert_text("content", 0, "kept"))
            .await
            .unwrap();
        assert_eq!(a.outbox_len(), 1);
    }

    #[tokio::test]
    async fn failed_transaction_still_queues_its_edits() {
        let hub = MemoryHub::new();
        let a = session(&hub, 1, SessionConfig::default());
        let result = a
            .transact(|txn| {
                txn.insert_text("content", 0, "x")?;
                txn.insert_text("content", 99, "y")
            })
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Doc(DocError::IndexOutOfBounds { .. }))
        ));
        assert_eq!(a.outbox_len(), 1);
        assert_eq!(a.with_undo(|undo| undo.undo_len()), 1);
    }
}

//! Ephemeral presence state (cursors, selections, user profiles).
//!
//! Each client publishes one opaque JSON payload tagged with a version. Peers
//! keep the highest version they have seen per client and forget clients that
//! stay silent longer than the horizon. Nothing here touches document state.
//!
//! State machine per remote client:
//!
//! ```text
//!   Absent --valid state--> Active --higher version--> Active
//!   Active --null state / silence past horizon--> Absent
//! ```

use crate::clock::ReplicaId;
use crate::event::{EventBus, Subscription};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Default silence after which a remote client is considered gone.
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(30);

/// Cursor colours handed out to user profiles.
pub const PALETTE: [&str; 8] = [
    "#3b82f6", // blue
    "#ef4444", // red
    "#10b981", // green
    "#f59e0b", // yellow
    "#8b5cf6", // purple
    "#ec4899", // pink
    "#06b6d4", // cyan
    "#f97316", // orange
];

/// One client's entry in an [`AwarenessUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    /// Version of the state
    pub version: u64,
    /// The state, or `None` when the client left
    pub state: Option<Value>,
}

/// Awareness changes as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    /// Clients that appeared
    pub added: Vec<ReplicaId>,
    /// Clients whose state changed
    pub updated: Vec<ReplicaId>,
    /// Clients that left
    pub removed: Vec<ReplicaId>,
    /// Versioned states, one per mentioned client
    pub states: BTreeMap<ReplicaId, AwarenessEntry>,
}

impl AwarenessUpdate {
    /// Whether the update mentions no client.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Change notification fired on the awareness event bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEvent {
    /// Clients that appeared
    pub added: Vec<ReplicaId>,
    /// Clients whose payload changed
    pub updated: Vec<ReplicaId>,
    /// Clients that left or expired
    pub removed: Vec<ReplicaId>,
    /// Whether the change came from the local client
    pub local: bool,
}

impl AwarenessEvent {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// User profile embedded in the local presence payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Application-level user id
    pub id: String,
    /// Display name
    pub name: String,
    /// Cursor colour
    pub color: String,
}

impl UserProfile {
    /// Build a profile with a colour derived from the user id.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let slot = id
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(usize::from(b)));
        Self {
            color: PALETTE[slot % PALETTE.len()].to_owned(),
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    payload: Value,
    last_seen: Instant,
}

/// Presence state for one document.
pub struct Awareness {
    local: ReplicaId,
    local_state: Option<Value>,
    local_version: u64,
    peers: BTreeMap<ReplicaId, PeerState>,
    /// Last version seen per client, kept after removal
    meta: HashMap<ReplicaId, u64>,
    horizon: Duration,
    events: EventBus<AwarenessEvent>,
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("local", &self.local)
            .field("local_version", &self.local_version)
            .field("peers", &self.peers.len())
            .field("horizon", &self.horizon)
            .finish_non_exhaustive()
    }
}

impl Awareness {
    /// Create an awareness instance for the local client.
    #[must_use]
    pub fn new(local: ReplicaId, horizon: Duration) -> Self {
        Self {
            local,
            local_state: None,
            local_version: 0,
            peers: BTreeMap::new(),
            meta: HashMap::new(),
            horizon,
            events: EventBus::new(),
        }
    }

    /// Local client id.
    #[must_use]
    pub fn local_id(&self) -> ReplicaId {
        self.local
    }

    /// Silence horizon.
    #[must_use]
    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Current local payload.
    #[must_use]
    pub fn local_state(&self) -> Option<&Value> {
        self.local_state.as_ref()
    }

    /// Subscribe to presence changes.
    #[must_use = "dropping the subscription detaches the handler immediately"]
    pub fn observe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AwarenessEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Replace the local payload (`None` announces departure).
    ///
    /// Returns the update to broadcast.
    pub fn set_local_state(&mut self, state: Option<Value>) -> AwarenessUpdate {
        let was_present = self.local_state.is_some();
        let changed = self.local_state != state;
        self.local_state = state;
        self.local_version += 1;

        let mut event = AwarenessEvent {
            local: true,
            ..AwarenessEvent::default()
        };
        match (was_present, self.local_state.is_some()) {
            (false, true) => event.added.push(self.local),
            (true, false) => event.removed.push(self.local),
            (true, true) if changed => event.updated.push(self.local),
            _ => {}
        }
        if !event.is_empty() {
            self.events.emit(&event);
        }

        AwarenessUpdate {
            added: event.added,
            updated: event.updated,
            removed: event.removed,
            states: self.local_entry(),
        }
    }

    fn local_entry(&self) -> BTreeMap<ReplicaId, AwarenessEntry> {
        BTreeMap::from([(
            self.local,
            AwarenessEntry {
                version: self.local_version,
                state: self.local_state.clone(),
            },
        )])
    }

    /// Set one top-level field of the local payload.
    ///
    /// Returns `None` when there is no local state to patch.
    pub fn set_local_field(&mut self, field: &str, value: Value) -> Option<AwarenessUpdate> {
        let mut map = match self.local_state.clone()? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        map.insert(field.to_owned(), value);
        Some(self.set_local_state(Some(Value::Object(map))))
    }

    /// Set the local user profile, creating the payload if needed.
    pub fn set_user(&mut self, user: &UserProfile) -> AwarenessUpdate {
        let mut state = match self.local_state.clone() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        state.insert(
            "user".to_owned(),
            json!({ "id": user.id, "name": user.name, "color": user.color }),
        );
        self.set_local_state(Some(Value::Object(state)))
    }

    /// Move the local cursor.
    pub fn update_cursor(&mut self, index: usize) -> Option<AwarenessUpdate> {
        self.set_local_field("cursor", json!({ "index": index }))
    }

    /// Change the local selection.
    pub fn update_selection(&mut self, anchor: usize, head: usize) -> Option<AwarenessUpdate> {
        self.set_local_field("selection", json!({ "anchor": anchor, "head": head }))
    }

    /// The current local state as an update (e.g. to greet a new peer).
    #[must_use]
    pub fn encode_local(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            states: self.local_entry(),
            ..AwarenessUpdate::default()
        }
    }

    /// Heartbeat: bump the local version so remote horizons refresh.
    ///
    /// Returns `None` if there is no local state.
    pub fn renew(&mut self) -> Option<AwarenessUpdate> {
        self.local_state.as_ref()?;
        self.local_version += 1;
        Some(self.encode_local())
    }

    /// Merge a remote update.
    ///
    /// Entries whose version is not strictly greater than the last one seen
    /// for that client are dropped. Entries about the local client are
    /// ignored.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessEvent {
        let mut event = AwarenessEvent::default();
        for (client, entry) in &update.states {
            if *client == self.local {
                continue;
            }
            let known = self.meta.get(client).copied().unwrap_or(0);
            if entry.version <= known {
                tracing::trace!(
                    client = %client,
                    version = entry.version,
                    known,
                    "Dropped stale awareness state"
                );
                continue;
            }
            self.meta.insert(*client, entry.version);

            match &entry.state {
                None => {
                    if self.peers.remove(client).is_some() {
                        event.removed.push(*client);
                    }
                }
                Some(payload) => {
                    let peer = PeerState {
                        payload: payload.clone(),
                        last_seen: now,
                    };
                    match self.peers.insert(*client, peer) {
                        None => event.added.push(*client),
                        Some(old) if old.payload != *payload => event.updated.push(*client),
                        Some(_) => {}
                    }
                }
            }
        }
        if !event.is_empty() {
            tracing::debug!(
                added = event.added.len(),
                updated = event.updated.len(),
                removed = event.removed.len(),
                "Applied awareness update"
            );
            self.events.emit(&event);
        }
        event
    }

    /// Forget clients silent for longer than the horizon.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<ReplicaId> {
        let horizon = self.horizon;
        let expired: Vec<ReplicaId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) >= horizon)
            .map(|(client, _)| *client)
            .collect();
        self.remove_peers(&expired)
    }

    /// Forget specific clients (e.g. after a leave notice).
    pub fn remove_peers(&mut self, clients: &[ReplicaId]) -> Vec<ReplicaId> {
        let removed: Vec<ReplicaId> = clients
            .iter()
            .filter(|client| self.peers.remove(client).is_some())
            .copied()
            .collect();
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "Removed awareness peers");
            self.events.emit(&AwarenessEvent {
                removed: removed.clone(),
                ..AwarenessEvent::default()
            });
        }
        removed
    }

    /// Payload of a remote client.
    #[must_use]
    pub fn peer(&self, client: &ReplicaId) -> Option<&Value> {
        self.peers.get(client).map(|p| &p.payload)
    }

    /// Version last accepted from a client (0 if never seen).
    #[must_use]
    pub fn peer_version(&self, client: &ReplicaId) -> u64 {
        self.meta.get(client).copied().unwrap_or(0)
    }

    /// Active remote clients and their payloads.
    pub fn peers(&self) -> impl Iterator<Item = (ReplicaId, &Value)> {
        self.peers.iter().map(|(client, p)| (*client, &p.payload))
    }

    /// Every active state, the local one included.
    #[must_use]
    pub fn states(&self) -> BTreeMap<ReplicaId, Value> {
        let mut states: BTreeMap<ReplicaId, Value> = self
            .peers
            .iter()
            .map(|(client, p)| (*client, p.payload.clone()))
            .collect();
        if let Some(local) = &self.local_state {
            states.insert(self.local, local.clone());
        }
        states
    }
}

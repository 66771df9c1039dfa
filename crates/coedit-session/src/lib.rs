//! # coedit session
//!
//! Runs replicated documents over a network.
//!
//! ## Architecture
//!
//! Each open document gets a [`SyncSession`] that drives three concurrent
//! loops:
//! 1. **Reader**: applies room messages (sync steps, updates, awareness)
//! 2. **Heartbeat**: renews presence, expires silent peers, snapshots
//! 3. **Reconnect**: re-joins the room with backoff after a dropped link
//!
//! A [`Workspace`] owns the sessions of one replica, keyed by document id.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod persistence;
pub mod session;
pub mod transport;
pub mod workspace;

pub use config::{AgentConfig, SessionConfig};
pub use persistence::{MemoryStore, PersistenceError, SnapshotStore, SqliteStore};
pub use session::{SessionError, SharedAwareness, SharedDocument, SyncSession};
pub use transport::{
    MemoryHub, MemoryTransport, MqttTransport, Transport, TransportError, TransportEvent,
};
pub use workspace::Workspace;

//! Room naming and MQTT topic mapping.
//!
//! Room name: `doc-{document id}`
//! Topic structure: `coedit/v1/{tenant}/{room}`
//!
//! This allows:
//! - Tenant isolation
//! - One topic per document room

use coedit_core::DocId;
use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

const ROOM_PREFIX: &str = "doc-";

/// Room name for a document.
#[must_use]
pub fn room_for(doc_id: &DocId) -> String {
    format!("{ROOM_PREFIX}{doc_id}")
}

/// Document id of a room name, if it follows the `doc-{id}` pattern.
#[must_use]
pub fn doc_id_of(room: &str) -> Option<DocId> {
    room.strip_prefix(ROOM_PREFIX)
        .filter(|id| !id.is_empty())
        .map(DocId::from)
}

/// Room to topic mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix (default: "coedit")
    pub prefix: String,
}

impl Default for RoomScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl RoomScheme {
    /// Create a scheme for the given tenant.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: "coedit".to_string(),
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    /// Topic carrying a room's messages.
    #[must_use]
    pub fn topic(&self, room: &str) -> String {
        format!("{}/{room}", self.base())
    }

    /// Wildcard subscription for every room in the tenant.
    #[must_use]
    pub fn tenant_wildcard(&self) -> String {
        format!("{}/+", self.base())
    }

    /// Room name of a topic, if it belongs to this tenant.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<String> {
        let room = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        if room.is_empty() || room.contains('/') {
            return None;
        }
        Some(room.to_string())
    }
}

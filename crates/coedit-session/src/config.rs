//! Agent configuration.

use anyhow::{Context, Result};
use coedit_core::awareness::DEFAULT_HORIZON;
use coedit_core::undo::DEFAULT_CAPTURE_TIMEOUT;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Replica identifier (random when unset)
    pub replica_id: Option<Uuid>,

    /// Display name announced through awareness
    pub user_name: Option<String>,

    /// Transport configuration
    pub transport: TransportConfig,

    /// Session tuning
    pub session: SessionConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Document ids to open on start
    pub documents: Vec<String>,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,
}

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Silence after which a remote awareness state expires
    pub awareness_timeout: Duration,

    /// Interval of the awareness renewal and snapshot check
    pub heartbeat: Duration,

    /// Undo capture window
    pub capture_timeout: Duration,

    /// Deferred records held before falling back to a full resync
    pub max_pending: usize,

    /// Applied records between two snapshots
    pub snapshot_threshold: usize,

    /// First reconnect delay; doubled on each failed attempt
    pub reconnect_base: Duration,

    /// Upper bound for the reconnect delay
    pub reconnect_max: Duration,

    /// Join attempts before a rejection is surfaced
    pub join_attempts: u32,

    /// Shared types tracked by the undo manager
    pub undo_scope: Vec<String>,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            replica_id: None,
            user_name: None,
            transport: TransportConfig {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
            },
            session: SessionConfig::default(),
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./coedit.db"),
            },
            documents: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            awareness_timeout: DEFAULT_HORIZON,
            heartbeat: Duration::from_secs(15),
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            max_pending: 1000,
            snapshot_threshold: 100,
            reconnect_base: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(30),
            join_attempts: 5,
            undo_scope: vec!["content".to_string(), "metadata".to_string()],
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COEDIT_REPLICA_ID`: Replica UUID
    /// - `COEDIT_USER_NAME`: Display name for presence
    /// - `COEDIT_MQTT_BROKER`: MQTT broker URL
    /// - `COEDIT_TENANT`: Tenant identifier
    /// - `COEDIT_STORE`: "sqlite" or "memory"
    /// - `COEDIT_DB_PATH`: SQLite database path
    /// - `COEDIT_DOCUMENTS`: JSON list of document ids
    /// - `COEDIT_AWARENESS_TIMEOUT_SECS`, `COEDIT_HEARTBEAT_SECS`,
    ///   `COEDIT_CAPTURE_TIMEOUT_MS`, `COEDIT_MAX_PENDING`,
    ///   `COEDIT_SNAPSHOT_THRESHOLD`: session tuning
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("COEDIT_REPLICA_ID") {
            config.replica_id = Some(Uuid::parse_str(&id).context("Invalid COEDIT_REPLICA_ID")?);
        }

        if let Ok(name) = std::env::var("COEDIT_USER_NAME") {
            config.user_name = Some(name);
        }

        if let Ok(mqtt) = std::env::var("COEDIT_MQTT_BROKER") {
            config.transport.mqtt_broker = mqtt;
        }

        if let Ok(tenant) = std::env::var("COEDIT_TENANT") {
            config.transport.tenant = tenant;
        }

        if let Ok(store) = std::env::var("COEDIT_STORE") {
            anyhow::ensure!(
                store == "sqlite" || store == "memory",
                "Invalid COEDIT_STORE {store:?}: expected \"sqlite\" or \"memory\""
            );
            config.persistence.store_type = store;
        }

        if let Ok(db_path) = std::env::var("COEDIT_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Ok(secs) = std::env::var("COEDIT_AWARENESS_TIMEOUT_SECS") {
            config.session.awareness_timeout = Duration::from_secs(
                secs.parse()
                    .context("Invalid COEDIT_AWARENESS_TIMEOUT_SECS")?,
            );
        }

        if let Ok(secs) = std::env::var("COEDIT_HEARTBEAT_SECS") {
            config.session.heartbeat =
                Duration::from_secs(secs.parse().context("Invalid COEDIT_HEARTBEAT_SECS")?);
        }

        if let Ok(ms) = std::env::var("COEDIT_CAPTURE_TIMEOUT_MS") {
            config.session.capture_timeout =
                Duration::from_millis(ms.parse().context("Invalid COEDIT_CAPTURE_TIMEOUT_MS")?);
        }

        if let Ok(max) = std::env::var("COEDIT_MAX_PENDING") {
            config.session.max_pending = max.parse().context("Invalid COEDIT_MAX_PENDING")?;
        }

        if let Ok(threshold) = std::env::var("COEDIT_SNAPSHOT_THRESHOLD") {
            config.session.snapshot_threshold = threshold
                .parse()
                .context("Invalid COEDIT_SNAPSHOT_THRESHOLD")?;
        }

        // Parse documents from JSON env var
        if let Ok(docs_json) = std::env::var("COEDIT_DOCUMENTS") {
            config.documents =
                serde_json::from_str(&docs_json).context("Invalid COEDIT_DOCUMENTS JSON")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.session.awareness_timeout, Duration::from_secs(30));
        assert_eq!(config.session.heartbeat, Duration::from_secs(15));
        assert_eq!(config.session.capture_timeout, Duration::from_millis(500));
        assert_eq!(config.persistence.store_type, "sqlite");
        assert!(config.documents.is_empty());
    }
}

//! # coedit agent
//!
//! Keeps a set of documents synchronized over MQTT and persists their
//! snapshots locally.

use anyhow::{Context, Result};
use coedit_core::{DocId, ReplicaId, UserProfile};
use coedit_proto::RoomScheme;
use coedit_session::{
    AgentConfig, MemoryStore, MqttTransport, SnapshotStore, SqliteStore, Workspace,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting coedit agent");

    // Load configuration
    let config = AgentConfig::from_env()?;

    let replica = ReplicaId::from_uuid(config.replica_id.unwrap_or_else(Uuid::new_v4));
    tracing::info!(%replica, "Replica initialized");

    let store: Arc<dyn SnapshotStore> = if config.persistence.store_type == "sqlite" {
        Arc::new(
            SqliteStore::open(&config.persistence.db_path)
                .context("Failed to open SQLite database")?,
        )
    } else {
        Arc::new(MemoryStore::new())
    };

    let transport = MqttTransport::connect(
        &config.transport.mqtt_broker,
        &format!("coedit-{replica}"),
        RoomScheme::new(&config.transport.tenant),
    )
    .context("Failed to create MQTT transport")?;

    let mut workspace = Workspace::new(
        replica,
        Arc::new(transport),
        Some(store),
        config.session.clone(),
    );
    if let Some(name) = &config.user_name {
        workspace = workspace.with_user(UserProfile::new(replica.to_string(), name.clone()));
    }

    for id in &config.documents {
        workspace
            .open(&DocId::new(id.as_str()))
            .await
            .with_context(|| format!("Failed to open document {id}"))?;
    }

    tracing::info!(
        documents = config.documents.len(),
        "Agent running, press Ctrl+C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    workspace.close_all().await?;
    tracing::info!("Agent stopped");
    Ok(())
}

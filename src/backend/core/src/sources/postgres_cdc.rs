//! Postgres logical-replication change source.
//!
//! Changes are read with `pg_logical_slot_get_changes`, which consumes them
//! from the slot. The slot is created on start when it does not exist yet.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{Connection, PgConnection};
use std::sync::Arc;
use std::time::Duration;

use super::event::{into_payload, Payload};
use super::lifecycle::{SourceCore, SourceKind};
use super::polling::{PollHandle, PollOutcome, PollWorker};
use super::EventSource;
use crate::error::{ErrorCode, Result, TributaryError};

/// Postgres CDC source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresCdcConfig {
    #[serde(default)]
    pub dsn: String,

    #[serde(default)]
    pub slot_name: String,

    #[serde(default)]
    pub publication: String,

    /// Logical decoding output plugin used when creating the slot
    #[serde(default = "default_output_plugin")]
    pub output_plugin: String,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl PostgresCdcConfig {
    pub fn new(dsn: impl Into<String>, slot_name: impl Into<String>, publication: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            slot_name: slot_name.into(),
            publication: publication.into(),
            output_plugin: default_output_plugin(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_output_plugin() -> String {
    "wal2json".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

/// An open replication session.
#[async_trait]
pub trait ReplicationClient: Send + 'static {
    /// Create the slot if absent. Returns whether it was created.
    async fn ensure_slot(&mut self, slot_name: &str, output_plugin: &str) -> Result<bool>;

    /// Drain and return every pending change record.
    async fn get_changes(&mut self, slot_name: &str, output_plugin: &str) -> Result<Vec<String>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens replication sessions. The production implementation is
/// [`PgReplicationConnector`].
#[async_trait]
pub trait ReplicationConnector: Send + Sync {
    async fn connect(&self, dsn: &str) -> Result<Box<dyn ReplicationClient>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// sqlx adapter
// ═══════════════════════════════════════════════════════════════════════════════

/// Connects with a plain `sqlx::PgConnection`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgReplicationConnector;

#[async_trait]
impl ReplicationConnector for PgReplicationConnector {
    async fn connect(&self, dsn: &str) -> Result<Box<dyn ReplicationClient>> {
        let conn = PgConnection::connect(dsn).await?;
        Ok(Box::new(PgReplicationClient { conn: Some(conn) }))
    }
}

struct PgReplicationClient {
    conn: Option<PgConnection>,
}

impl PgReplicationClient {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn.as_mut().ok_or_else(|| {
            TributaryError::new(ErrorCode::DatabaseConnectionFailed, "Replication connection is closed")
        })
    }
}

#[async_trait]
impl ReplicationClient for PgReplicationClient {
    async fn ensure_slot(&mut self, slot_name: &str, output_plugin: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)")
                .bind(slot_name)
                .fetch_one(&mut *conn)
                .await?;
        if exists {
            return Ok(false);
        }

        sqlx::query("SELECT pg_create_logical_replication_slot($1, $2)")
            .bind(slot_name)
            .bind(output_plugin)
            .execute(&mut *conn)
            .await?;
        Ok(true)
    }

    async fn get_changes(&mut self, slot_name: &str, output_plugin: &str) -> Result<Vec<String>> {
        let sql = if output_plugin == "wal2json" {
            "SELECT data FROM pg_logical_slot_get_changes($1, NULL, NULL, 'pretty-print', '1')"
        } else {
            "SELECT data FROM pg_logical_slot_get_changes($1, NULL, NULL)"
        };

        let conn = self.conn()?;
        let rows: Vec<String> = sqlx::query_scalar(sql)
            .bind(slot_name)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════════════

/// Event source streaming changes from a logical replication slot.
pub struct PostgresCdcSource {
    core: SourceCore,
    config: PostgresCdcConfig,
    connector: Arc<dyn ReplicationConnector>,
    poller: parking_lot::Mutex<Option<PollHandle>>,
}

impl PostgresCdcSource {
    pub fn new(id: impl Into<String>, config: PostgresCdcConfig, connector: Arc<dyn ReplicationConnector>) -> Self {
        Self {
            core: SourceCore::new(id, SourceKind::PostgresCdc),
            config,
            connector,
            poller: parking_lot::Mutex::new(None),
        }
    }

    /// Source backed by [`PgReplicationConnector`].
    pub fn postgres(id: impl Into<String>, config: PostgresCdcConfig) -> Self {
        Self::new(id, config, Arc::new(PgReplicationConnector))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core = self.core.renamed(name);
        self
    }

    pub fn config(&self) -> &PostgresCdcConfig {
        &self.config
    }
}

struct CdcWorker {
    core: SourceCore,
    config: PostgresCdcConfig,
    client: Box<dyn ReplicationClient>,
}

#[async_trait]
impl PollWorker for CdcWorker {
    async fn poll_once(&mut self) -> Result<PollOutcome> {
        let changes = self
            .client
            .get_changes(&self.config.slot_name, &self.config.output_plugin)
            .await?;

        // The changes are already consumed from the slot, so every one is
        // emitted even if an earlier emission failed.
        let mut first_error = None;
        for change in changes {
            let value = serde_json::from_str::<Value>(&change).unwrap_or(Value::String(change));
            let mut metadata = Payload::new();
            metadata.insert("slot".into(), json!(self.config.slot_name));
            metadata.insert("publication".into(), json!(self.config.publication));

            if let Err(e) = self.core.emit(into_payload(value), metadata).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(PollOutcome::Idle),
        }
    }

    async fn on_shutdown(&mut self) {
        if let Err(e) = self.client.close().await {
            tracing::warn!(source_id = %self.core.id(), error = %e, "Failed to close replication connection");
        }
    }
}

#[async_trait]
impl EventSource for PostgresCdcSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn validate_config(&self) -> Result<()> {
        if self.config.dsn.trim().is_empty() {
            return Err(TributaryError::missing_configuration("Postgres CDC", "dsn"));
        }
        if self.config.slot_name.trim().is_empty() {
            return Err(TributaryError::missing_configuration("Postgres CDC", "slot_name"));
        }
        if self.config.publication.trim().is_empty() {
            return Err(TributaryError::missing_configuration("Postgres CDC", "publication"));
        }
        Ok(())
    }

    async fn start_acquisition(&self) -> Result<()> {
        let mut client = self.connector.connect(&self.config.dsn).await?;
        let created = match client
            .ensure_slot(&self.config.slot_name, &self.config.output_plugin)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                let _ = client.close().await;
                return Err(e);
            }
        };

        tracing::info!(
            source_id = %self.core.id(),
            slot = %self.config.slot_name,
            plugin = %self.config.output_plugin,
            created = created,
            "Replication slot ready"
        );

        let worker = CdcWorker {
            core: self.core.clone(),
            config: self.config.clone(),
            client,
        };
        let handle = PollHandle::spawn(self.core.id(), self.config.poll_interval, worker);
        *self.poller.lock() = Some(handle);
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        Ok(())
    }
}

//! Durable record of terminal outbound outcomes.

use async_trait::async_trait;
use serde::Deserialize;

use super::job::OutboundJob;
use crate::error::{ErrorCode, Result, TributaryError};

/// Sink notified when a job reaches a terminal outcome.
///
/// Failures are logged by the queue and never change a job's outcome.
#[async_trait]
pub trait OutboundJournal: Send + Sync {
    async fn on_delivered(&self, _job: &OutboundJob) -> Result<()> {
        Ok(())
    }

    async fn on_dead_lettered(&self, _job: &OutboundJob) -> Result<()> {
        Ok(())
    }
}

/// Redis journal configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisJournalConfig {
    pub url: String,

    /// Key prefix; lists are `{prefix}:delivered` and `{prefix}:dead_letter`
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl RedisJournalConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefix: default_prefix(),
        }
    }

    pub fn delivered_key(&self) -> String {
        format!("{}:delivered", self.prefix)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}:dead_letter", self.prefix)
    }
}

fn default_prefix() -> String {
    "tributary:outbound".to_string()
}

/// Appends each terminal job as JSON to a Redis list.
pub struct RedisOutboundJournal {
    client: redis::Client,
    config: RedisJournalConfig,
}

impl RedisOutboundJournal {
    /// Validates the URL; no connection is made until the first write.
    pub fn new(config: RedisJournalConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            TributaryError::invalid_configuration(format!("Invalid Redis URL for outbound journal: {}", e))
        })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RedisJournalConfig {
        &self.config
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| {
            TributaryError::with_internal(
                ErrorCode::RedisConnectionFailed,
                "Failed to get Redis connection for outbound journal",
                e.to_string(),
            )
        })
    }

    #[tracing::instrument(name = "outbound_journal_append", skip(self, job), fields(job_id = %job.id))]
    async fn append(&self, key: &str, job: &OutboundJob) -> Result<()> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.get_conn().await?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                TributaryError::with_internal(
                    ErrorCode::JournalFailed,
                    "Failed to append outbound job to journal",
                    e.to_string(),
                )
            })?;

        tracing::debug!(key = %key, job_id = %job.id, "Outbound job journaled");
        Ok(())
    }
}

#[async_trait]
impl OutboundJournal for RedisOutboundJournal {
    async fn on_delivered(&self, job: &OutboundJob) -> Result<()> {
        self.append(&self.config.delivered_key(), job).await
    }

    async fn on_dead_lettered(&self, job: &OutboundJob) -> Result<()> {
        self.append(&self.config.dead_letter_key(), job).await
    }
}

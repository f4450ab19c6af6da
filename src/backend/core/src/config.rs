//! Configuration management.

use serde::Deserialize;

use crate::outbound::{OutboundQueueConfig, RedisJournalConfig};
use crate::sources::{
    file_watch::FileWatchConfig, kafka::KafkaConfig, postgres_cdc::PostgresCdcConfig,
    queue::QueueSourceConfig, schedule::ScheduleConfig, sqs::SqsConfig, webhook::WebhookConfig,
};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Event sources to build and register at startup
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Outbound delivery queue
    #[serde(default)]
    pub outbound: OutboundConfig,
}

/// One configured event source.
///
/// ```toml
/// [[sources]]
/// id = "orders"
/// type = "kafka"
/// topic = "orders"
/// bootstrap_servers = "localhost:9092"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Unique, stable identifier
    pub id: String,

    /// Display name; defaults to the id
    #[serde(default)]
    pub name: Option<String>,

    /// Whether the server registers this source at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(flatten)]
    pub settings: SourceSettings,
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match &self.settings {
            SourceSettings::Kafka(_) => "kafka",
            SourceSettings::Sqs(_) => "sqs",
            SourceSettings::PostgresCdc(_) => "postgres_cdc",
            SourceSettings::Webhook(_) => "webhook",
            SourceSettings::Schedule(_) => "schedule",
            SourceSettings::Queue(_) => "queue",
            SourceSettings::FileWatch(_) => "file_watch",
        }
    }
}

/// Kind-specific source settings, selected by the `type` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSettings {
    Kafka(KafkaConfig),
    Sqs(SqsConfig),
    PostgresCdc(PostgresCdcConfig),
    Webhook(WebhookConfig),
    Schedule(ScheduleConfig),
    Queue(QueueSourceConfig),
    FileWatch(FileWatchConfig),
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundConfig {
    #[serde(default)]
    pub queue: OutboundQueueConfig,

    /// Durable journal for delivered and dead-lettered jobs
    #[serde(default)]
    pub journal: Option<RedisJournalConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from the environment (`TRIBUTARY__SECTION__KEY`).
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TRIBUTARY").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TRIBUTARY").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Enabled source configurations, in declaration order.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

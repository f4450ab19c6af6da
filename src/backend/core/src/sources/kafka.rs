//! Kafka topic consumer source.
//!
//! One record is emitted per loop iteration. Offsets are committed by the
//! client automatically, so delivery is at-least-once.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::event::{into_payload, Payload};
use super::lifecycle::{SourceCore, SourceKind};
use super::polling::{PollHandle, PollOutcome, PollWorker};
use super::EventSource;
use crate::error::{Result, TributaryError};

/// Kafka source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default)]
    pub topic: String,

    /// Comma-separated `host:port` list
    #[serde(default)]
    pub bootstrap_servers: String,

    #[serde(default)]
    pub group_id: Option<String>,

    /// Back-off after a consumer error
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Extra client properties passed through to the consumer
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl KafkaConfig {
    pub fn new(topic: impl Into<String>, bootstrap_servers: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            bootstrap_servers: bootstrap_servers.into(),
            group_id: None,
            poll_interval: default_poll_interval(),
            properties: HashMap::new(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

/// One consumed record, independent of the client library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// An open consumer subscribed to one topic.
#[async_trait]
pub trait KafkaConsumer: Send + 'static {
    /// Wait for the next record.
    async fn recv(&mut self) -> Result<KafkaRecord>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens consumers. The production implementation is `RdKafkaConnector`.
#[async_trait]
pub trait KafkaConnector: Send + Sync {
    async fn connect(&self, config: &KafkaConfig) -> Result<Box<dyn KafkaConsumer>>;
}

/// Decode a record into `(payload, metadata)`.
///
/// The value is parsed as JSON; failing that it is kept as a UTF-8 string,
/// and failing that it is base64-encoded with `metadata.encoding = "base64"`.
pub fn decode_record(record: &KafkaRecord) -> (Payload, Payload) {
    let mut metadata = Payload::new();
    metadata.insert("topic".into(), json!(record.topic));
    metadata.insert("partition".into(), json!(record.partition));
    metadata.insert("offset".into(), json!(record.offset));
    metadata.insert("timestamp".into(), json!(record.timestamp));
    if let Some(key) = &record.key {
        metadata.insert("key".into(), json!(String::from_utf8_lossy(key)));
    }

    let value = match &record.payload {
        None => Value::Null,
        Some(bytes) => match serde_json::from_slice::<Value>(bytes) {
            Ok(parsed) => parsed,
            Err(_) => match std::str::from_utf8(bytes) {
                Ok(text) => Value::String(text.to_string()),
                Err(_) => {
                    metadata.insert("encoding".into(), json!("base64"));
                    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
                }
            },
        },
    };

    (into_payload(value), metadata)
}

/// Event source consuming a Kafka topic.
pub struct KafkaSource {
    core: SourceCore,
    config: KafkaConfig,
    connector: Arc<dyn KafkaConnector>,
    poller: parking_lot::Mutex<Option<PollHandle>>,
}

impl KafkaSource {
    pub fn new(id: impl Into<String>, config: KafkaConfig, connector: Arc<dyn KafkaConnector>) -> Self {
        Self {
            core: SourceCore::new(id, SourceKind::Kafka),
            config,
            connector,
            poller: parking_lot::Mutex::new(None),
        }
    }

    /// Source backed by librdkafka.
    #[cfg(feature = "kafka")]
    pub fn rdkafka(id: impl Into<String>, config: KafkaConfig) -> Self {
        Self::new(id, config, Arc::new(rdkafka_adapter::RdKafkaConnector))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core = self.core.renamed(name);
        self
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }
}

struct KafkaWorker {
    core: SourceCore,
    consumer: Box<dyn KafkaConsumer>,
}

#[async_trait]
impl PollWorker for KafkaWorker {
    async fn poll_once(&mut self) -> Result<PollOutcome> {
        let record = self.consumer.recv().await?;
        let (payload, metadata) = decode_record(&record);
        self.core.emit(payload, metadata).await?;
        Ok(PollOutcome::Continue)
    }

    async fn on_shutdown(&mut self) {
        if let Err(e) = self.consumer.close().await {
            tracing::warn!(source_id = %self.core.id(), error = %e, "Failed to close Kafka consumer");
        }
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn validate_config(&self) -> Result<()> {
        if self.config.topic.trim().is_empty() {
            return Err(TributaryError::missing_configuration("Kafka", "topic"));
        }
        if self.config.bootstrap_servers.trim().is_empty() {
            return Err(TributaryError::missing_configuration("Kafka", "bootstrap_servers"));
        }
        Ok(())
    }

    async fn start_acquisition(&self) -> Result<()> {
        let consumer = self.connector.connect(&self.config).await?;
        tracing::info!(
            source_id = %self.core.id(),
            topic = %self.config.topic,
            "Kafka consumer connected"
        );

        let worker = KafkaWorker {
            core: self.core.clone(),
            consumer,
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

// ═══════════════════════════════════════════════════════════════════════════════
// librdkafka adapter
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "kafka")]
pub use rdkafka_adapter::RdKafkaConnector;

#[cfg(feature = "kafka")]
mod rdkafka_adapter {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::Message;

    /// Connects `StreamConsumer`s with auto-commit enabled.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RdKafkaConnector;

    #[async_trait]
    impl KafkaConnector for RdKafkaConnector {
        async fn connect(&self, config: &KafkaConfig) -> Result<Box<dyn KafkaConsumer>> {
            let group_id = config
                .group_id
                .clone()
                .unwrap_or_else(|| "tributary".to_string());

            let mut client = ClientConfig::new();
            client
                .set("bootstrap.servers", config.bootstrap_servers.as_str())
                .set("group.id", group_id.as_str())
                .set("enable.auto.commit", "true");
            for (key, value) in &config.properties {
                client.set(key.as_str(), value.as_str());
            }

            let consumer: StreamConsumer = client
                .create()
                .map_err(|e| TributaryError::broker_connection("Kafka", e.to_string()))?;
            consumer
                .subscribe(&[config.topic.as_str()])
                .map_err(|e| TributaryError::broker_connection("Kafka", e.to_string()))?;

            Ok(Box::new(RdKafkaConsumer { consumer }))
        }
    }

    struct RdKafkaConsumer {
        consumer: StreamConsumer,
    }

    #[async_trait]
    impl KafkaConsumer for RdKafkaConsumer {
        async fn recv(&mut self) -> Result<KafkaRecord> {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(|e| TributaryError::broker("Kafka", e.to_string()))?;

            Ok(KafkaRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                timestamp: message.timestamp().to_millis(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            })
        }

        async fn close(&mut self) -> Result<()> {
            self.consumer.unsubscribe();
            Ok(())
        }
    }
}

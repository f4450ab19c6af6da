//! Build sources from [`SourceConfig`] entries.

use std::sync::Arc;

use super::file_watch::FileWatchSource;
use super::postgres_cdc::PostgresCdcSource;
use super::queue::QueueSource;
use super::schedule::ScheduledSource;
use super::webhook::WebhookSource;
use super::EventSource;
use crate::config::{SourceConfig, SourceSettings};
use crate::error::{Result, TributaryError};

/// Apply the optional display name from config.
macro_rules! named {
    ($source:expr, $name:expr) => {{
        let source = $source;
        match $name {
            Some(name) => source.with_name(name.clone()),
            None => source,
        }
    }};
}

/// Construct the source described by `config`.
///
/// Broker-backed kinds whose cargo feature is disabled fail with
/// `UnsupportedFeature`. No connection is opened here; that happens on
/// `start`.
pub async fn build_source(config: &SourceConfig) -> Result<Arc<dyn EventSource>> {
    let id = config.id.trim();
    if id.is_empty() {
        return Err(TributaryError::missing_configuration("Source", "id"));
    }
    let name = config.name.as_ref();

    let source: Arc<dyn EventSource> = match &config.settings {
        SourceSettings::Kafka(settings) => kafka_source(id, name, settings)?,
        SourceSettings::Sqs(settings) => sqs_source(id, name, settings).await?,
        SourceSettings::PostgresCdc(settings) => {
            Arc::new(named!(PostgresCdcSource::postgres(id, settings.clone()), name))
        }
        SourceSettings::Webhook(settings) => Arc::new(named!(WebhookSource::new(id, settings.clone()), name)),
        SourceSettings::Schedule(settings) => {
            Arc::new(named!(ScheduledSource::new(id, settings.clone())?, name))
        }
        SourceSettings::Queue(settings) => Arc::new(named!(QueueSource::new(id, settings.clone()), name)),
        SourceSettings::FileWatch(settings) => {
            Arc::new(named!(FileWatchSource::new(id, settings.clone()), name))
        }
    };

    tracing::debug!(source_id = %id, kind = %source.kind(), "Built event source from config");
    Ok(source)
}

#[cfg(feature = "kafka")]
fn kafka_source(
    id: &str,
    name: Option<&String>,
    settings: &super::kafka::KafkaConfig,
) -> Result<Arc<dyn EventSource>> {
    Ok(Arc::new(named!(super::kafka::KafkaSource::rdkafka(id, settings.clone()), name)))
}

#[cfg(not(feature = "kafka"))]
fn kafka_source(
    _id: &str,
    _name: Option<&String>,
    _settings: &super::kafka::KafkaConfig,
) -> Result<Arc<dyn EventSource>> {
    Err(TributaryError::unsupported_feature("kafka"))
}

#[cfg(feature = "sqs")]
async fn sqs_source(
    id: &str,
    name: Option<&String>,
    settings: &super::sqs::SqsConfig,
) -> Result<Arc<dyn EventSource>> {
    Ok(Arc::new(named!(super::sqs::SqsSource::aws(id, settings.clone()).await, name)))
}

#[cfg(not(feature = "sqs"))]
async fn sqs_source(
    _id: &str,
    _name: Option<&String>,
    _settings: &super::sqs::SqsConfig,
) -> Result<Arc<dyn EventSource>> {
    Err(TributaryError::unsupported_feature("sqs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sources::lifecycle::{SourceKind, SourceStatus};

    fn parse(raw: serde_json::Value) -> SourceConfig {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_builds_named_queue_source() {
        let config = parse(serde_json::json!({
            "id": "inbox",
            "name": "Support inbox",
            "type": "queue"
        }));
        let source = build_source(&config).await.unwrap();
        assert_eq!(source.id(), "inbox");
        assert_eq!(source.name(), "Support inbox");
        assert_eq!(source.kind(), SourceKind::Queue);
        assert_eq!(source.status(), SourceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_schedule_without_trigger_is_rejected() {
        let config = parse(serde_json::json!({"id": "tick", "type": "schedule"}));
        let err = build_source(&config).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }

    #[tokio::test]
    async fn test_blank_id_is_rejected() {
        let config = parse(serde_json::json!({"id": "  ", "type": "webhook"}));
        let err = build_source(&config).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn test_kafka_requires_feature() {
        let config = parse(serde_json::json!({
            "id": "orders",
            "type": "kafka",
            "topic": "orders",
            "bootstrap_servers": "localhost:9092"
        }));
        let err = build_source(&config).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::UnsupportedFeature);
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_postgres_source_is_built_without_connecting() {
        let config = parse(serde_json::json!({
            "id": "cdc",
            "type": "postgres_cdc",
            "dsn": "postgres://app@localhost/app",
            "slot_name": "tributary",
            "publication": "all_tables"
        }));
        let source = build_source(&config).await.unwrap();
        assert_eq!(source.kind(), SourceKind::PostgresCdc);
    }
}

//! Amazon SQS long-polling source.
//!
//! Each received message is emitted and then deleted. A message is deleted
//! only after its emission succeeded; otherwise it becomes visible again
//! after the queue's visibility timeout and is redelivered.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::event::{into_payload, Payload};
use super::lifecycle::{SourceCore, SourceKind};
use super::polling::{PollHandle, PollOutcome, PollWorker};
use super::EventSource;
use crate::error::{Result, TributaryError};

/// SQS allows at most 10 messages per receive.
const MAX_BATCH: i32 = 10;
/// SQS long polling waits at most 20 seconds.
const MAX_WAIT: Duration = Duration::from_secs(20);

/// SQS source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqsConfig {
    #[serde(default)]
    pub queue_url: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Back-off after a receive or delete error
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Long-poll wait per receive
    #[serde(default = "default_wait_time", with = "humantime_serde")]
    pub wait_time: Duration,

    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
}

impl SqsConfig {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            region: None,
            poll_interval: default_poll_interval(),
            wait_time: default_wait_time(),
            max_messages: default_max_messages(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_wait_time() -> Duration {
    Duration::from_secs(10)
}

fn default_max_messages() -> i32 {
    MAX_BATCH
}

/// One received message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqsMessage {
    pub message_id: Option<String>,
    pub receipt_handle: Option<String>,
    pub body: Option<String>,
}

/// The two SQS calls the source needs.
#[async_trait]
pub trait SqsClient: Send + Sync {
    async fn receive(&self, queue_url: &str, max_messages: i32, wait_time: Duration) -> Result<Vec<SqsMessage>>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;
}

fn decode_body(body: Option<&str>) -> Payload {
    let value = match body {
        None => Value::Null,
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
    };
    into_payload(value)
}

/// Event source polling one SQS queue.
pub struct SqsSource {
    core: SourceCore,
    config: SqsConfig,
    client: Arc<dyn SqsClient>,
    poller: parking_lot::Mutex<Option<PollHandle>>,
}

impl SqsSource {
    /// `max_messages` is clamped to 1..=10 and `wait_time` to at most 20s.
    pub fn new(id: impl Into<String>, mut config: SqsConfig, client: Arc<dyn SqsClient>) -> Self {
        config.max_messages = config.max_messages.clamp(1, MAX_BATCH);
        config.wait_time = config.wait_time.min(MAX_WAIT);
        Self {
            core: SourceCore::new(id, SourceKind::Sqs),
            config,
            client,
            poller: parking_lot::Mutex::new(None),
        }
    }

    /// Source backed by the AWS SDK, using the default credential chain.
    #[cfg(feature = "sqs")]
    pub async fn aws(id: impl Into<String>, config: SqsConfig) -> Self {
        let client = AwsSqsClient::from_env(config.region.clone()).await;
        Self::new(id, config, Arc::new(client))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core = self.core.renamed(name);
        self
    }

    pub fn config(&self) -> &SqsConfig {
        &self.config
    }
}

struct SqsWorker {
    core: SourceCore,
    config: SqsConfig,
    client: Arc<dyn SqsClient>,
}

#[async_trait]
impl PollWorker for SqsWorker {
    async fn poll_once(&mut self) -> Result<PollOutcome> {
        let messages = self
            .client
            .receive(&self.config.queue_url, self.config.max_messages, self.config.wait_time)
            .await?;

        for message in messages {
            let payload = decode_body(message.body.as_deref());
            let mut metadata = Payload::new();
            metadata.insert("message_id".into(), json!(message.message_id));
            metadata.insert("receipt_handle".into(), json!(message.receipt_handle));

            self.core.emit(payload, metadata).await?;

            if let Some(receipt) = &message.receipt_handle {
                self.client.delete(&self.config.queue_url, receipt).await?;
            }
        }

        // The receive itself long-polls, so there is nothing to sleep off.
        Ok(PollOutcome::Continue)
    }
}

#[async_trait]
impl EventSource for SqsSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn validate_config(&self) -> Result<()> {
        if self.config.queue_url.trim().is_empty() {
            return Err(TributaryError::missing_configuration("SQS", "queue_url"));
        }
        Ok(())
    }

    async fn start_acquisition(&self) -> Result<()> {
        let worker = SqsWorker {
            core: self.core.clone(),
            config: self.config.clone(),
            client: Arc::clone(&self.client),
        };
        let handle = PollHandle::spawn(self.core.id(), self.config.poll_interval, worker);
        *self.poller.lock() = Some(handle);
        tracing::info!(source_id = %self.core.id(), queue_url = %self.config.queue_url, "SQS polling started");
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
// AWS SDK adapter
// ═══════════════════════════════════════════════════════════════════════════════

/// [`SqsClient`] over `aws-sdk-sqs`.
#[cfg(feature = "sqs")]
#[derive(Debug, Clone)]
pub struct AwsSqsClient {
    client: aws_sdk_sqs::Client,
}

#[cfg(feature = "sqs")]
impl AwsSqsClient {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }

    /// Build a client from the environment, optionally pinning a region.
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_sqs::config::Region::new(region));
        }
        let shared = loader.load().await;
        Self::new(aws_sdk_sqs::Client::new(&shared))
    }
}

#[cfg(feature = "sqs")]
#[async_trait]
impl SqsClient for AwsSqsClient {
    async fn receive(&self, queue_url: &str, max_messages: i32, wait_time: Duration) -> Result<Vec<SqsMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time.as_secs() as i32)
            .send()
            .await
            .map_err(|e| {
                TributaryError::broker("SQS", aws_sdk_sqs::error::DisplayErrorContext(&e).to_string())
            })?;

        Ok(output
            .messages()
            .iter()
            .map(|m| SqsMessage {
                message_id: m.message_id().map(str::to_string),
                receipt_handle: m.receipt_handle().map(str::to_string),
                body: m.body().map(str::to_string),
            })
            .collect())
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| {
                TributaryError::broker("SQS", aws_sdk_sqs::error::DisplayErrorContext(&e).to_string())
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sources::event::{subscriber_fn, ChannelSubscriber};
    use crate::sources::lifecycle::SourceStatus;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockSqs {
        batches: Mutex<VecDeque<Vec<SqsMessage>>>,
        deleted: Mutex<Vec<String>>,
        received_with: Mutex<Option<(i32, Duration)>>,
    }

    #[async_trait]
    impl SqsClient for MockSqs {
        async fn receive(&self, _queue_url: &str, max_messages: i32, wait_time: Duration) -> Result<Vec<SqsMessage>> {
            *self.received_with.lock() = Some((max_messages, wait_time));
            let batch = self.batches.lock().pop_front();
            match batch {
                Some(batch) => Ok(batch),
                None => {
                    // Stand-in for the long-poll wait on an empty queue.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn delete(&self, _queue_url: &str, receipt_handle: &str) -> Result<()> {
            self.deleted.lock().push(receipt_handle.to_string());
            Ok(())
        }
    }

    fn message(id: &str, body: &str) -> SqsMessage {
        SqsMessage {
            message_id: Some(id.to_string()),
            receipt_handle: Some(format!("rh-{}", id)),
            body: Some(body.to_string()),
        }
    }

    #[test]
    fn test_limits_are_clamped() {
        let mut config = SqsConfig::new("https://sqs/q");
        config.max_messages = 50;
        config.wait_time = Duration::from_secs(60);
        let source = SqsSource::new("q", config, Arc::new(MockSqs::default()));
        assert_eq!(source.config().max_messages, 10);
        assert_eq!(source.config().wait_time, Duration::from_secs(20));

        let mut config = SqsConfig::new("https://sqs/q");
        config.max_messages = 0;
        let source = SqsSource::new("q", config, Arc::new(MockSqs::default()));
        assert_eq!(source.config().max_messages, 1);
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(Some(r#"{"a":1}"#))["a"], json!(1));
        assert_eq!(decode_body(Some("hi"))["message"], json!("hi"));
        assert_eq!(decode_body(None)["message"], Value::Null);
    }

    #[tokio::test]
    async fn test_missing_queue_url_is_rejected() {
        let source = SqsSource::new("q", SqsConfig::new(""), Arc::new(MockSqs::default()));
        let err = source.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
        assert_eq!(source.status(), SourceStatus::Error);
    }

    #[tokio::test]
    async fn test_emits_then_deletes() {
        let client = Arc::new(MockSqs::default());
        client
            .batches
            .lock()
            .push_back(vec![message("m1", r#"{"n":1}"#), message("m2", "raw")]);

        let source = SqsSource::new("q", SqsConfig::new("https://sqs/q"), client.clone());
        let (subscriber, mut events) = ChannelSubscriber::channel();
        source.on_event(subscriber);
        source.start().await.unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.payload["n"], json!(1));
        assert_eq!(first.metadata["message_id"], json!("m1"));
        assert_eq!(second.payload["message"], json!("raw"));
        assert_eq!(second.metadata["receipt_handle"], json!("rh-m2"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        source.stop().await.unwrap();

        assert_eq!(*client.deleted.lock(), vec!["rh-m1".to_string(), "rh-m2".to_string()]);
        assert_eq!(*client.received_with.lock(), Some((10, Duration::from_secs(10))));
    }

    #[tokio::test]
    async fn test_failed_emission_keeps_message() {
        let client = Arc::new(MockSqs::default());
        client.batches.lock().push_back(vec![message("m1", "{}")]);

        let mut config = SqsConfig::new("https://sqs/q");
        config.poll_interval = Duration::from_millis(5);
        let source = SqsSource::new("q", config, client.clone());
        source.on_event(subscriber_fn(|_| async { Err(anyhow::anyhow!("downstream down")) }));
        source.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.stop().await.unwrap();

        assert!(client.deleted.lock().is_empty());
    }
}

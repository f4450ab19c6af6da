//! Event envelope and subscriber interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A JSON object. Every payload and metadata block is one.
pub type Payload = serde_json::Map<String, Value>;

/// One occurrence from an external origin, normalized.
///
/// Events are immutable once built and are handed to subscribers as
/// `Arc<Event>`, so a fan-out never clones the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source_id: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Payload,
}

impl Event {
    pub fn new(source_id: impl Into<String>, payload: Payload, metadata: Payload) -> Self {
        Self {
            source_id: source_id.into(),
            payload,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Metadata value as a string, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Normalize an arbitrary JSON value into an event payload.
///
/// Objects pass through; anything else is wrapped as `{"message": value}`.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("message".to_string(), other);
            map
        }
    }
}

/// Build a payload from `(key, value)` pairs.
pub fn payload_from<I, K>(pairs: I) -> Payload
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscribers
// ═══════════════════════════════════════════════════════════════════════════════

/// A downstream consumer of events.
///
/// Subscribers are external collaborators, so they report failures as
/// `anyhow::Error`; the emitting source aggregates them.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()>;
}

/// Subscriber backed by an async closure.
pub struct FnSubscriber<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> EventSubscriber for FnSubscriber<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        (self.handler)(event).await
    }
}

/// Wrap an async closure as a subscriber.
///
/// ```rust,ignore
/// source.on_event(subscriber_fn(|event| async move {
///     tracing::info!(source_id = %event.source_id, "got event");
///     Ok(())
/// }));
/// ```
pub fn subscriber_fn<F, Fut>(handler: F) -> Arc<dyn EventSubscriber>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnSubscriber { handler })
}

/// Forwards every event into an unbounded channel.
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

impl ChannelSubscriber {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Event>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventSubscriber for ChannelSubscriber {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("event channel receiver dropped"))
    }
}

/// Logs every event at info level with redacted metadata.
#[derive(Debug, Default)]
pub struct LoggingSubscriber;

#[async_trait]
impl EventSubscriber for LoggingSubscriber {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        let metadata = redacted_metadata(&event.metadata);
        tracing::info!(
            source_id = %event.source_id,
            timestamp = %event.timestamp,
            payload_keys = event.payload.len(),
            metadata = %metadata,
            "Event received"
        );
        Ok(())
    }
}

/// Metadata with sensitive keys and nested header values redacted.
fn redacted_metadata(metadata: &Payload) -> Value {
    let redactor = crate::telemetry::SensitiveFieldRedactor::global();
    let redacted: Payload = metadata
        .iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => Value::String(redactor.redact(k, s)),
                Value::Object(_) if redactor.should_redact_field(k) => {
                    Value::String("[REDACTED]".to_string())
                }
                Value::Object(inner) => Value::Object(
                    inner
                        .iter()
                        .map(|(ik, iv)| match iv {
                            Value::String(s) => (ik.clone(), Value::String(redactor.redact(ik, s))),
                            other => (ik.clone(), other.clone()),
                        })
                        .collect(),
                ),
                other => other.clone(),
            };
            (k.clone(), value)
        })
        .collect();
    Value::Object(redacted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_payload_wraps_non_objects() {
        assert_eq!(into_payload(json!("hello")), payload_from([("message", json!("hello"))]));
        assert_eq!(into_payload(json!(42)), payload_from([("message", json!(42))]));
        assert_eq!(into_payload(json!([1, 2])), payload_from([("message", json!([1, 2]))]));
    }

    #[test]
    fn test_into_payload_keeps_objects() {
        let payload = into_payload(json!({"a": 1}));
        assert_eq!(payload.get("a"), Some(&json!(1)));
        assert!(!payload.contains_key("message"));
    }

    #[test]
    fn test_event_serializes_with_metadata() {
        let event = Event::new(
            "orders",
            payload_from([("id", json!(7))]),
            payload_from([("topic", json!("orders"))]),
        );
        assert_eq!(event.metadata_str("topic"), Some("orders"));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["source_id"], "orders");
        assert_eq!(value["payload"]["id"], 7);
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_channel_subscriber_forwards() {
        let (subscriber, mut rx) = ChannelSubscriber::channel();
        let event = Arc::new(Event::new("s", Payload::new(), Payload::new()));

        subscriber.handle(Arc::clone(&event)).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &event));

        drop(rx);
        assert!(subscriber.handle(event).await.is_err());
    }

    #[test]
    fn test_redacted_metadata_hides_secrets() {
        let metadata = payload_from([
            ("topic", json!("orders")),
            ("offset", json!(12)),
            (
                "headers",
                json!({"Authorization": "Bearer abc", "Content-Type": "application/json"}),
            ),
        ]);

        let redacted = redacted_metadata(&metadata);
        assert_eq!(redacted["topic"], "orders");
        assert_eq!(redacted["offset"], 12);
        assert_eq!(redacted["headers"]["Authorization"], "[REDACTED]");
        assert_eq!(redacted["headers"]["Content-Type"], "application/json");
    }

    #[tokio::test]
    async fn test_logging_subscriber_accepts_every_event() {
        let event = Arc::new(Event::new(
            "hooks",
            payload_from([("a", json!(1))]),
            payload_from([("headers", json!({"cookie": "session=1"}))]),
        ));
        assert!(LoggingSubscriber.handle(event).await.is_ok());
    }

    #[tokio::test]
    async fn test_fn_subscriber() {
        let subscriber = subscriber_fn(|event: Arc<Event>| async move {
            if event.payload.contains_key("fail") {
                anyhow::bail!("asked to fail");
            }
            Ok(())
        });

        let ok = Arc::new(Event::new("s", Payload::new(), Payload::new()));
        let bad = Arc::new(Event::new("s", payload_from([("fail", json!(true))]), Payload::new()));
        assert!(subscriber.handle(ok).await.is_ok());
        assert!(subscriber.handle(bad).await.is_err());
    }
}

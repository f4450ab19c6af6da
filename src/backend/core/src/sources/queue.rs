//! In-process FIFO source fed through [`QueueSource::enqueue`] or cloned
//! [`QueueSender`] handles.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::event::{into_payload, Payload};
use super::lifecycle::{SourceCore, SourceKind};
use super::polling::{PollHandle, PollOutcome, PollWorker};
use super::EventSource;
use crate::error::{ErrorCode, Result, TributaryError};

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSourceConfig {
    /// Longest wait for a message before re-checking for a stop
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for QueueSourceConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

/// Cloneable handle for feeding a [`QueueSource`] from other tasks.
#[derive(Debug, Clone)]
pub struct QueueSender {
    source_id: Arc<str>,
    tx: mpsc::UnboundedSender<Value>,
}

impl QueueSender {
    pub fn send(&self, message: Value) -> Result<()> {
        self.tx.send(message).map_err(|_| {
            TributaryError::new(ErrorCode::InternalError, "Queue source is no longer available")
                .with_context("source_id", self.source_id.as_ref())
        })
    }
}

/// Event source draining an in-process unbounded channel.
///
/// Messages sent while the source is stopped stay queued and are emitted
/// after the next start.
pub struct QueueSource {
    core: SourceCore,
    config: QueueSourceConfig,
    tx: mpsc::UnboundedSender<Value>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>,
    poller: parking_lot::Mutex<Option<PollHandle>>,
}

impl QueueSource {
    pub fn new(id: impl Into<String>, config: QueueSourceConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core: SourceCore::new(id, SourceKind::Queue),
            config,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            poller: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.core = self.core.renamed(name);
        self
    }

    /// Queue one message. Non-object values are emitted as
    /// `{"message": value}`.
    pub fn enqueue(&self, message: Value) -> Result<()> {
        self.sender().send(message)
    }

    pub fn sender(&self) -> QueueSender {
        QueueSender {
            source_id: Arc::from(self.core.id()),
            tx: self.tx.clone(),
        }
    }
}

struct QueueWorker {
    core: SourceCore,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>,
    poll_interval: Duration,
}

#[async_trait]
impl PollWorker for QueueWorker {
    async fn poll_once(&mut self) -> Result<PollOutcome> {
        let received = {
            let mut rx = self.rx.lock().await;
            tokio::time::timeout(self.poll_interval, rx.recv()).await
        };

        match received {
            Ok(Some(message)) => {
                self.core.emit(into_payload(message), Payload::new()).await?;
                Ok(PollOutcome::Continue)
            }
            // The source owns a sender, so the channel never closes while
            // this worker is alive.
            Ok(None) => Ok(PollOutcome::Idle),
            Err(_elapsed) => Ok(PollOutcome::Continue),
        }
    }
}

#[async_trait]
impl EventSource for QueueSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn start_acquisition(&self) -> Result<()> {
        let worker = QueueWorker {
            core: self.core.clone(),
            rx: Arc::clone(&self.rx),
            poll_interval: self.config.poll_interval,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::event::ChannelSubscriber;
    use serde_json::json;

    fn fast() -> QueueSourceConfig {
        QueueSourceConfig {
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_scalars_are_wrapped() {
        let source = QueueSource::new("inbox", fast());
        let (subscriber, mut events) = ChannelSubscriber::channel();
        source.on_event(subscriber);
        source.start().await.unwrap();

        source.enqueue(json!("hello")).unwrap();
        source.enqueue(json!({"order": 7})).unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(serde_json::Value::Object(first.payload.clone()), json!({"message": "hello"}));
        assert_eq!(second.payload["order"], json!(7));

        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_queued_while_stopped_arrive_after_start() {
        let source = QueueSource::new("inbox", fast());
        let sender = source.sender();
        sender.send(json!(1)).unwrap();
        sender.send(json!(2)).unwrap();

        let (subscriber, mut events) = ChannelSubscriber::channel();
        source.on_event(subscriber);
        source.start().await.unwrap();

        assert_eq!(events.recv().await.unwrap().payload["message"], json!(1));
        assert_eq!(events.recv().await.unwrap().payload["message"], json!(2));
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_prompt_and_restart_resumes() {
        let source = QueueSource::new("inbox", fast());
        let (subscriber, mut events) = ChannelSubscriber::channel();
        source.on_event(subscriber);

        source.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), source.stop())
            .await
            .unwrap()
            .unwrap();

        source.enqueue(json!("later")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events.try_recv().is_err());

        source.start().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["message"], json!("later"));
        source.stop().await.unwrap();
    }
}

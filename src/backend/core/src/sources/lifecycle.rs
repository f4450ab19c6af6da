//! Shared lifecycle state and fan-out for event sources.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};

use super::event::{Event, EventSubscriber, Payload};
use crate::error::{Result, TributaryError};
use crate::telemetry::SourceMetrics;

/// Lifecycle status of an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl SourceStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    /// Running or on its way there.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of origin a source reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Kafka,
    Sqs,
    PostgresCdc,
    Webhook,
    Schedule,
    Queue,
    FileWatch,
}

impl SourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::Sqs => "sqs",
            Self::PostgresCdc => "postgres_cdc",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Queue => "queue",
            Self::FileWatch => "file_watch",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health report for a source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub kind: SourceKind,
    /// `"ok"` when running, `"not_running"` otherwise
    pub status: &'static str,
    pub lifecycle: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl SourceHealth {
    pub fn is_ok(&self) -> bool {
        self.lifecycle == SourceStatus::Running
    }
}

#[derive(Debug)]
struct LifecycleState {
    status: SourceStatus,
    last_error: Option<String>,
}

struct CoreInner {
    id: String,
    name: String,
    kind: SourceKind,
    state: RwLock<LifecycleState>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    transition: Mutex<()>,
}

/// Identity, lifecycle state and subscriber list shared by every source.
///
/// Cheap to clone; acquisition tasks hold a clone so they can emit without
/// borrowing the source itself.
#[derive(Clone)]
pub struct SourceCore {
    inner: Arc<CoreInner>,
}

impl fmt::Debug for SourceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCore")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl SourceCore {
    /// A stopped core whose name equals its id.
    pub fn new(id: impl Into<String>, kind: SourceKind) -> Self {
        let id = id.into();
        Self::build(id.clone(), id, kind)
    }

    /// Same identity with a different display name.
    ///
    /// Meant for construction time: the returned core starts Stopped with
    /// no subscribers.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self::build(self.inner.id.clone(), name.into(), self.inner.kind)
    }

    fn build(id: String, name: String, kind: SourceKind) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                id,
                name,
                kind,
                state: RwLock::new(LifecycleState {
                    status: SourceStatus::Stopped,
                    last_error: None,
                }),
                subscribers: RwLock::new(Vec::new()),
                transition: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> SourceKind {
        self.inner.kind
    }

    pub fn status(&self) -> SourceStatus {
        self.inner.state.read().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.read().last_error.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Serializes start/stop for this source.
    pub(crate) async fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.inner.transition.lock().await
    }

    pub(crate) fn set_status(&self, status: SourceStatus) {
        {
            let mut state = self.inner.state.write();
            state.status = status;
            if matches!(status, SourceStatus::Running | SourceStatus::Stopped) {
                state.last_error = None;
            }
        }
        SourceMetrics::transition(self.id(), status.as_str());
    }

    pub(crate) fn set_error(&self, message: String) {
        {
            let mut state = self.inner.state.write();
            state.status = SourceStatus::Error;
            state.last_error = Some(message);
        }
        SourceMetrics::transition(self.id(), SourceStatus::Error.as_str());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscribers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.inner.subscribers.write().push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Build one event and deliver it to every subscriber concurrently.
    ///
    /// The subscriber list is snapshotted first, so subscribers added during
    /// a fan-out only see later events. All subscribers run to completion
    /// even when some fail; the first failure in registration order is
    /// reported along with the failure count.
    pub async fn emit(&self, payload: Payload, metadata: Payload) -> Result<()> {
        let event = Arc::new(Event::new(self.id(), payload, metadata));
        let subscribers = self.inner.subscribers.read().clone();

        if subscribers.is_empty() {
            tracing::warn!(
                source_id = %self.id(),
                kind = %self.kind(),
                "Event emitted with no subscribers; discarding"
            );
            SourceMetrics::event_discarded(self.id(), self.kind().as_str());
            return Ok(());
        }

        let started = Instant::now();
        let results = join_all(
            subscribers
                .iter()
                .map(|subscriber| subscriber.handle(Arc::clone(&event))),
        )
        .await;
        SourceMetrics::fanout_duration(self.id(), started.elapsed());
        SourceMetrics::event_emitted(self.id(), self.kind().as_str());

        let total = results.len();
        let failures: Vec<anyhow::Error> = results.into_iter().filter_map(|r| r.err()).collect();
        let Some(first) = failures.first() else {
            return Ok(());
        };

        SourceMetrics::subscriber_failures(self.id(), failures.len());
        tracing::warn!(
            source_id = %self.id(),
            failed = failures.len(),
            total = total,
            error = %first,
            "Subscriber failed while handling event"
        );

        Err(TributaryError::subscriber_failed(
            self.id(),
            failures.len(),
            total,
            format!("{:#}", first),
        ))
    }

    pub fn health(&self) -> SourceHealth {
        let state = self.inner.state.read();
        SourceHealth {
            source_id: self.inner.id.clone(),
            kind: self.inner.kind,
            status: if state.status == SourceStatus::Running {
                "ok"
            } else {
                "not_running"
            },
            lifecycle: state.status,
            last_error: state.last_error.clone(),
            checked_at: Utc::now(),
        }
    }
}

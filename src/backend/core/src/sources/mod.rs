//! Event sources: one lifecycle abstraction over every kind of origin.
//!
//! A source acquires records from somewhere (a broker, a replication slot,
//! an HTTP push, a timer, a channel, the filesystem), wraps each one in an
//! [`Event`] and fans it out to its subscribers.
//!
//! ```text
//!   Stopped ──start──► Starting ──ok──► Running ──stop──► Stopping ──ok──► Stopped
//!                          │                                  │
//!                          └──────────── err ──► Error ◄── err┘
//! ```
//!
//! Implementations provide the acquisition hooks; [`EventSource`] supplies the
//! state machine, per-source transition locking and emission.

pub mod event;
pub mod factory;
pub mod file_watch;
pub mod kafka;
pub mod lifecycle;
pub mod polling;
pub mod postgres_cdc;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod sqs;
pub mod webhook;

pub use lifecycle::{SourceCore, SourceHealth, SourceKind, SourceStatus};
pub use event::{
    into_payload, payload_from, subscriber_fn, ChannelSubscriber, Event, EventSubscriber,
    LoggingSubscriber, Payload,
};
pub use factory::build_source;
pub use file_watch::{FileWatchConfig, FileWatchSource};
pub use kafka::{KafkaConfig, KafkaConnector, KafkaConsumer, KafkaRecord, KafkaSource};
pub use polling::{PollHandle, PollOutcome, PollWorker};
pub use postgres_cdc::{
    PgReplicationConnector, PostgresCdcConfig, PostgresCdcSource, ReplicationClient,
    ReplicationConnector,
};
pub use queue::{QueueSender, QueueSource, QueueSourceConfig};
pub use registry::{BulkOutcome, RegistryStats, SourceRegistry};
pub use schedule::{ScheduleConfig, ScheduledSource};
pub use sqs::{SqsClient, SqsConfig, SqsMessage, SqsSource};
pub use webhook::{SignatureAlgorithm, WebhookConfig, WebhookResponse, WebhookSource, WebhookStatus};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{ErrorCode, Result, TributaryError};

/// A lifecycle-managed producer of events.
///
/// Implementors supply [`core`](EventSource::core) and the two acquisition
/// hooks. Everything else is provided and should not be overridden.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Shared identity, state and subscribers.
    fn core(&self) -> &SourceCore;

    /// Begin acquiring: open connections, spawn loops, arm timers.
    async fn start_acquisition(&self) -> Result<()>;

    /// Release everything `start_acquisition` set up.
    ///
    /// Must tolerate a partially started source, since it also runs when
    /// stopping a source that is in `Error`.
    async fn stop_acquisition(&self) -> Result<()>;

    /// Check configuration before acquisition starts.
    async fn validate_config(&self) -> Result<()> {
        Ok(())
    }

    fn id(&self) -> &str {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn kind(&self) -> SourceKind {
        self.core().kind()
    }

    fn status(&self) -> SourceStatus {
        self.core().status()
    }

    fn last_error(&self) -> Option<String> {
        self.core().last_error()
    }

    fn health(&self) -> SourceHealth {
        self.core().health()
    }

    /// Add a subscriber; it receives every event emitted after this call.
    fn on_event(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.core().subscribe(subscriber);
    }

    /// Emit one event to all subscribers.
    ///
    /// Also the entry point for hosts injecting records directly.
    async fn emit(&self, payload: Payload, metadata: Payload) -> Result<()> {
        self.core().emit(payload, metadata).await
    }

    /// Start the source. A no-op when already Running or Starting.
    async fn start(&self) -> Result<()> {
        let core = self.core();
        if core.status().is_active() {
            return Ok(());
        }

        let _guard = core.lock_transition().await;
        if core.status().is_active() {
            return Ok(());
        }

        core.set_status(SourceStatus::Starting);
        tracing::info!(source_id = %core.id(), kind = %core.kind(), "Starting event source");

        let outcome = match self.validate_config().await {
            Ok(()) => self.start_acquisition().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                core.set_status(SourceStatus::Running);
                tracing::info!(source_id = %core.id(), kind = %core.kind(), "Event source running");
                Ok(())
            }
            Err(e) => {
                core.set_error(e.summary());
                tracing::error!(
                    source_id = %core.id(),
                    kind = %core.kind(),
                    error = %e,
                    "Event source failed to start"
                );
                Err(lifecycle_error(ErrorCode::SourceStartFailed, core.id(), e))
            }
        }
    }

    /// Stop the source. A no-op when already Stopped or Stopping.
    async fn stop(&self) -> Result<()> {
        let core = self.core();
        if matches!(core.status(), SourceStatus::Stopped | SourceStatus::Stopping) {
            return Ok(());
        }

        let _guard = core.lock_transition().await;
        if matches!(core.status(), SourceStatus::Stopped | SourceStatus::Stopping) {
            return Ok(());
        }

        core.set_status(SourceStatus::Stopping);
        tracing::info!(source_id = %core.id(), kind = %core.kind(), "Stopping event source");

        match self.stop_acquisition().await {
            Ok(()) => {
                core.set_status(SourceStatus::Stopped);
                tracing::info!(source_id = %core.id(), kind = %core.kind(), "Event source stopped");
                Ok(())
            }
            Err(e) => {
                core.set_error(e.summary());
                tracing::error!(
                    source_id = %core.id(),
                    kind = %core.kind(),
                    error = %e,
                    "Event source failed to stop"
                );
                Err(lifecycle_error(ErrorCode::SourceStopFailed, core.id(), e))
            }
        }
    }
}

/// Configuration errors reach the caller as-is; everything else is wrapped
/// in a lifecycle error that keeps the original as its source.
fn lifecycle_error(code: ErrorCode, source_id: &str, error: TributaryError) -> TributaryError {
    if error.is_configuration() {
        return error;
    }

    let verb = if code == ErrorCode::SourceStopFailed {
        "stop"
    } else {
        "start"
    };
    TributaryError::with_internal(
        code,
        format!("Failed to {} event source {}", verb, source_id),
        error.to_string(),
    )
    .with_context("source_id", source_id)
    .with_context("cause_code", error.code())
    .with_source(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Source whose hooks count calls and can be told to fail.
    struct ScriptedSource {
        core: SourceCore,
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: Mutex<Option<TributaryError>>,
        invalid: bool,
        start_delay: Duration,
    }

    impl ScriptedSource {
        fn new(id: &str) -> Self {
            Self {
                core: SourceCore::new(id, SourceKind::Queue),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                fail_start: Mutex::new(None),
                invalid: false,
                start_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        fn core(&self) -> &SourceCore {
            &self.core
        }

        async fn validate_config(&self) -> Result<()> {
            if self.invalid {
                return Err(TributaryError::missing_configuration("Queue", "name"));
            }
            Ok(())
        }

        async fn start_acquisition(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            match self.fail_start.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn stop_acquisition(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let source = ScriptedSource::new("s");

        source.start().await.unwrap();
        source.start().await.unwrap();
        assert_eq!(source.status(), SourceStatus::Running);
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);

        source.stop().await.unwrap();
        source.stop().await.unwrap();
        assert_eq!(source.status(), SourceStatus::Stopped);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_run_acquisition_once() {
        let source = Arc::new(ScriptedSource {
            start_delay: Duration::from_millis(50),
            ..ScriptedSource::new("s")
        });

        let (a, b) = tokio::join!(source.start(), source.start());
        a.unwrap();
        b.unwrap();
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);
        assert_eq!(source.status(), SourceStatus::Running);
    }

    #[tokio::test]
    async fn test_invalid_config_enters_error_and_returns_configuration_error() {
        let source = ScriptedSource {
            invalid: true,
            ..ScriptedSource::new("s")
        };

        let err = source.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
        assert_eq!(source.status(), SourceStatus::Error);
        assert_eq!(source.last_error().as_deref(), Some("Queue name must be provided"));
        assert_eq!(source.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_start_is_wrapped_and_restartable() {
        let source = ScriptedSource::new("s");
        *source.fail_start.lock() = Some(TributaryError::broker("Kafka", "no brokers"));

        let err = source.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SourceStartFailed);
        assert_eq!(source.status(), SourceStatus::Error);
        assert_eq!(source.last_error().as_deref(), Some("Kafka operation failed: no brokers"));

        source.start().await.unwrap();
        assert_eq!(source.status(), SourceStatus::Running);
        assert!(source.last_error().is_none());
    }

    #[tokio::test]
    async fn test_stop_from_error_runs_stop_acquisition() {
        let source = ScriptedSource::new("s");
        *source.fail_start.lock() = Some(TributaryError::internal("half started"));
        let _ = source.start().await;
        assert_eq!(source.status(), SourceStatus::Error);

        source.stop().await.unwrap();
        assert_eq!(source.status(), SourceStatus::Stopped);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_on_fresh_source_is_noop() {
        let source = ScriptedSource::new("s");
        source.stop().await.unwrap();
        assert_eq!(source.stops.load(Ordering::SeqCst), 0);
        assert_eq!(source.status(), SourceStatus::Stopped);
    }
}

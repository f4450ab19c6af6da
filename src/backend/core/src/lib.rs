#![allow(clippy::result_large_err)]
//! # Tributary Core
//!
//! Event-source lifecycle framework with a retrying outbound delivery queue.
//!
//! ## Architecture
//!
//! - **Sources**: Kafka, SQS, Postgres CDC, webhooks, schedules, in-process
//!   queues and filesystem watches behind one start/stop state machine
//! - **Fan-out**: every event goes to all subscribers concurrently; failures
//!   are aggregated back to the emitter
//! - **Registry**: id-keyed source collection with bulk start/stop and stats
//! - **Outbound**: FIFO delivery with fixed backoff, bounded attempts and a
//!   dead-letter list, optionally journaled to Redis
//! - **Telemetry**: structured logging, redaction and Prometheus metrics

pub mod config;
pub mod error;
pub mod outbound;
pub mod sources;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, TributaryError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, SourceConfig, SourceSettings};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, TributaryError};
    pub use crate::outbound::{
        delivery_fn, DeliveryFn, OutboundDeliveryQueue, OutboundJob, OutboundJournal, OutboundQueueConfig,
        OutboundSnapshot, StepOutcome,
    };
    pub use crate::sources::{
        build_source, into_payload, subscriber_fn, ChannelSubscriber, Event, EventSource, EventSubscriber,
        LoggingSubscriber, Payload, QueueSource, QueueSourceConfig, ScheduleConfig, ScheduledSource,
        SourceKind, SourceRegistry, SourceStatus, WebhookConfig, WebhookResponse, WebhookSource,
    };
    pub use crate::telemetry::{init_telemetry, TelemetryConfig, TelemetryHandle};
}

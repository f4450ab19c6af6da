//! Prometheus metrics for event sources and the outbound delivery queue.
//!
//! Recording goes through the `metrics` facade, so the helpers below are
//! cheap no-ops until [`init_metrics`] installs a recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use tributary_core::telemetry::metrics::{OutboundMetrics, SourceMetrics};
//!
//! SourceMetrics::event_emitted("orders", "kafka");
//! OutboundMetrics::attempt("failed");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address the host is expected to scrape from (e.g. "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for fan-out and delivery durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}

/// Handle onto the installed Prometheus recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Whether a Prometheus recorder backs this registry.
    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the bucket list is invalid or a global recorder is
/// already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Sources
    describe_counter!(
        "tributary_events_emitted_total",
        "Events delivered to at least one subscriber"
    );
    describe_counter!(
        "tributary_events_discarded_total",
        "Events emitted while no subscriber was registered"
    );
    describe_counter!(
        "tributary_subscriber_failures_total",
        "Subscriber invocations that returned an error"
    );
    describe_histogram!(
        "tributary_fanout_duration_seconds",
        "Time spent fanning one event out to all subscribers"
    );
    describe_counter!(
        "tributary_acquisition_errors_total",
        "Transient errors raised inside source acquisition loops"
    );
    describe_counter!(
        "tributary_webhook_requests_total",
        "Webhook requests by outcome"
    );
    describe_counter!(
        "tributary_source_transitions_total",
        "Lifecycle transitions by resulting status"
    );

    // Outbound
    describe_counter!(
        "tributary_outbound_attempts_total",
        "Outbound delivery attempts by outcome"
    );
    describe_counter!(
        "tributary_outbound_dead_letters_total",
        "Outbound jobs moved to the dead-letter list"
    );
    describe_gauge!(
        "tributary_outbound_queue_depth",
        "Outbound jobs waiting for delivery"
    );
    describe_histogram!(
        "tributary_outbound_delivery_duration_seconds",
        "Duration of a single delivery call"
    );

    // Errors
    describe_counter!("tributary_errors_total", "Errors constructed, by code");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Metrics recorded by event sources.
pub struct SourceMetrics;

impl SourceMetrics {
    /// Record an event that reached its subscribers.
    pub fn event_emitted(source_id: &str, kind: &str) {
        counter!(
            "tributary_events_emitted_total",
            "source_id" => source_id.to_string(),
            "kind" => kind.to_string(),
        )
        .increment(1);
    }

    /// Record an event emitted with no subscriber attached.
    pub fn event_discarded(source_id: &str, kind: &str) {
        counter!(
            "tributary_events_discarded_total",
            "source_id" => source_id.to_string(),
            "kind" => kind.to_string(),
        )
        .increment(1);
    }

    /// Record failed subscriber invocations for one emission.
    pub fn subscriber_failures(source_id: &str, failed: usize) {
        counter!(
            "tributary_subscriber_failures_total",
            "source_id" => source_id.to_string(),
        )
        .increment(failed as u64);
    }

    /// Record how long one fan-out took.
    pub fn fanout_duration(source_id: &str, duration: Duration) {
        histogram!(
            "tributary_fanout_duration_seconds",
            "source_id" => source_id.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record a transient error inside an acquisition loop.
    pub fn acquisition_error(source_id: &str) {
        counter!(
            "tributary_acquisition_errors_total",
            "source_id" => source_id.to_string(),
        )
        .increment(1);
    }

    /// Record a webhook request outcome (`accepted` or `rejected`).
    pub fn webhook_request(source_id: &str, outcome: &str) {
        counter!(
            "tributary_webhook_requests_total",
            "source_id" => source_id.to_string(),
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }

    /// Record a lifecycle transition into `status`.
    pub fn transition(source_id: &str, status: &str) {
        counter!(
            "tributary_source_transitions_total",
            "source_id" => source_id.to_string(),
            "status" => status.to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outbound Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Metrics recorded by the outbound delivery queue.
pub struct OutboundMetrics;

impl OutboundMetrics {
    /// Record a delivery attempt outcome (`sent`, `failed`, `dead_lettered`).
    pub fn attempt(outcome: &str) {
        counter!(
            "tributary_outbound_attempts_total",
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }

    /// Record a job moving to the dead-letter list.
    pub fn dead_lettered(channel: &str) {
        counter!(
            "tributary_outbound_dead_letters_total",
            "channel" => channel.to_string(),
        )
        .increment(1);
    }

    /// Set the number of jobs waiting for delivery.
    pub fn set_queue_depth(depth: usize) {
        gauge!("tributary_outbound_queue_depth").set(depth as f64);
    }

    /// Start timing one delivery call.
    pub fn start_delivery(channel: &str) -> DeliveryTimer {
        DeliveryTimer {
            start: Instant::now(),
            channel: channel.to_string(),
        }
    }
}

/// Timer for a single delivery call.
pub struct DeliveryTimer {
    start: Instant,
    channel: String,
}

impl DeliveryTimer {
    /// Finish timing and record the duration.
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        histogram!(
            "tributary_outbound_delivery_duration_seconds",
            "channel" => self.channel,
        )
        .record(duration.as_secs_f64());
        duration
    }
}

//! Retrying delivery queue with a dead-letter list.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::job::{OutboundJob, OutboundSnapshot};
use super::journal::OutboundJournal;
use crate::telemetry::OutboundMetrics;

/// Delivery statuses with this prefix count as success.
pub const SENT_PREFIX: &str = "sent:";

/// Configuration for the outbound delivery queue.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundQueueConfig {
    /// Run the background worker; when off, call `process_next` yourself
    #[serde(default = "default_worker_enabled")]
    pub worker_enabled: bool,

    /// Attempts before a job is dead-lettered (at least 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed pause before a failed job is requeued
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Pause when the queue is empty
    #[serde(default = "default_idle_wait", with = "humantime_serde")]
    pub idle_wait: Duration,

    /// Longest `stop` waits for the worker
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for OutboundQueueConfig {
    fn default() -> Self {
        Self {
            worker_enabled: default_worker_enabled(),
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            idle_wait: default_idle_wait(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

fn default_worker_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_wait() -> Duration {
    Duration::from_millis(50)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(1)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery function
// ═══════════════════════════════════════════════════════════════════════════════

/// Sends one message and reports a status string; `sent:` means success.
#[async_trait]
pub trait DeliveryFn: Send + Sync {
    async fn deliver(&self, channel: &str, channel_id: &str, text: &str, thread_id: Option<&str>) -> String;
}

/// [`DeliveryFn`] backed by an async closure over owned arguments.
pub struct FnDelivery<F> {
    send: F,
}

#[async_trait]
impl<F, Fut> DeliveryFn for FnDelivery<F>
where
    F: Fn(String, String, String, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    async fn deliver(&self, channel: &str, channel_id: &str, text: &str, thread_id: Option<&str>) -> String {
        (self.send)(
            channel.to_string(),
            channel_id.to_string(),
            text.to_string(),
            thread_id.map(str::to_string),
        )
        .await
    }
}

/// Wrap an async closure `(channel, channel_id, text, thread_id) -> status`.
pub fn delivery_fn<F, Fut>(send: F) -> Arc<dyn DeliveryFn>
where
    F: Fn(String, String, String, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    Arc::new(FnDelivery { send })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// What one worker step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was queued.
    Idle,
    Delivered { job_id: String },
    /// Failed, waited the backoff and went back to the tail.
    Requeued { job_id: String, attempts: u32 },
    DeadLettered { job_id: String },
}

/// Running totals, shared with the worker.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    pub delivered: Arc<AtomicU64>,
    pub failed_attempts: Arc<AtomicU64>,
    pub dead_lettered: Arc<AtomicU64>,
}

impl DeliveryStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<OutboundJob>,
    dead_letters: Vec<OutboundJob>,
}

struct Shared {
    state: parking_lot::Mutex<QueueState>,
    deliver: Arc<dyn DeliveryFn>,
    journal: Option<Arc<dyn OutboundJournal>>,
    config: OutboundQueueConfig,
    stats: DeliveryStats,
}

/// Failed attempt waiting for its backoff before being requeued.
struct Retry(OutboundJob);

enum Attempt {
    Idle,
    Delivered(String),
    DeadLettered(String),
    Failed(Retry),
}

impl Shared {
    fn push_back(&self, job: OutboundJob) {
        let depth = {
            let mut state = self.state.lock();
            state.pending.push_back(job);
            state.pending.len()
        };
        OutboundMetrics::set_queue_depth(depth);
    }

    fn pop_front(&self) -> Option<OutboundJob> {
        let (job, depth) = {
            let mut state = self.state.lock();
            let job = state.pending.pop_front();
            (job, state.pending.len())
        };
        OutboundMetrics::set_queue_depth(depth);
        job
    }

    /// Pop and deliver the head job. The lock is not held while delivering.
    async fn attempt(&self) -> Attempt {
        let Some(mut job) = self.pop_front() else {
            return Attempt::Idle;
        };

        let timer = OutboundMetrics::start_delivery(&job.channel);
        let status = self
            .deliver
            .deliver(&job.channel, &job.channel_id, &job.text, job.thread_id.as_deref())
            .await;
        let elapsed = timer.finish();

        if status.starts_with(SENT_PREFIX) {
            OutboundMetrics::attempt("sent");
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job_id = %job.id, channel = %job.channel, elapsed = ?elapsed, "Outbound job delivered");
            if let Some(journal) = &self.journal {
                if let Err(e) = journal.on_delivered(&job).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to journal delivered job");
                }
            }
            return Attempt::Delivered(job.id);
        }

        job.attempts += 1;
        job.last_error = Some(status);
        self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);

        if job.is_exhausted() {
            OutboundMetrics::attempt("dead_lettered");
            OutboundMetrics::dead_lettered(&job.channel);
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                job_id = %job.id,
                channel = %job.channel,
                attempts = job.attempts,
                last_error = ?job.last_error,
                "Outbound job dead-lettered"
            );

            if let Some(journal) = &self.journal {
                if let Err(e) = journal.on_dead_lettered(&job).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to journal dead-lettered job");
                }
            }
            let id = job.id.clone();
            self.state.lock().dead_letters.push(job);
            return Attempt::DeadLettered(id);
        }

        OutboundMetrics::attempt("failed");
        tracing::debug!(
            job_id = %job.id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            last_error = ?job.last_error,
            "Outbound delivery failed, will retry"
        );
        Attempt::Failed(Retry(job))
    }
}

/// FIFO of outbound jobs with bounded retries and a dead-letter list.
///
/// Failed jobs go back to the tail after a fixed backoff, so one failing
/// job never blocks the others for more than one pass.
pub struct OutboundDeliveryQueue {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl OutboundDeliveryQueue {
    /// Create the queue, spawning its worker when `worker_enabled`.
    ///
    /// Must be called inside a Tokio runtime when the worker is enabled.
    pub fn new(
        deliver: Arc<dyn DeliveryFn>,
        mut config: OutboundQueueConfig,
        journal: Option<Arc<dyn OutboundJournal>>,
    ) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        let shared = Arc::new(Shared {
            state: parking_lot::Mutex::new(QueueState::default()),
            deliver,
            journal,
            config,
            stats: DeliveryStats::default(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = if shared.config.worker_enabled {
            Some(tokio::spawn(run_worker(Arc::clone(&shared), shutdown_rx)))
        } else {
            None
        };

        Self {
            shared,
            shutdown,
            worker: parking_lot::Mutex::new(worker),
        }
    }

    pub fn config(&self) -> &OutboundQueueConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.shared.stats
    }

    /// Queue a message for delivery.
    pub fn enqueue(
        &self,
        channel: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
        thread_id: Option<String>,
    ) -> OutboundJob {
        let job = OutboundJob::new(channel, channel_id, text, thread_id, self.shared.config.max_attempts);
        tracing::debug!(job_id = %job.id, channel = %job.channel, "Outbound job queued");
        self.shared.push_back(job.clone());
        job
    }

    pub fn snapshot(&self) -> OutboundSnapshot {
        let state = self.shared.state.lock();
        OutboundSnapshot {
            queued: state.pending.len(),
            dead_lettered: state.dead_letters.len(),
            dead_letters: state.dead_letters.clone(),
        }
    }

    /// Run one worker step on the caller's task.
    ///
    /// A failed job waits out the backoff here before being requeued.
    pub async fn process_next(&self) -> StepOutcome {
        match self.shared.attempt().await {
            Attempt::Idle => StepOutcome::Idle,
            Attempt::Delivered(job_id) => StepOutcome::Delivered { job_id },
            Attempt::DeadLettered(job_id) => StepOutcome::DeadLettered { job_id },
            Attempt::Failed(Retry(job)) => {
                tokio::time::sleep(self.shared.config.backoff).await;
                let outcome = StepOutcome::Requeued {
                    job_id: job.id.clone(),
                    attempts: job.attempts,
                };
                self.shared.push_back(job);
                outcome
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker to exit and wait up to `stop_timeout` for it.
    ///
    /// A worker still busy after the timeout is left to finish on its own.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        match tokio::time::timeout(self.shared.config.stop_timeout, handle).await {
            Ok(Ok(())) => tracing::info!("Outbound delivery worker stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Outbound delivery worker panicked"),
            Err(_) => tracing::warn!(
                timeout = ?self.shared.config.stop_timeout,
                "Outbound delivery worker did not stop in time"
            ),
        }
    }
}

impl Drop for OutboundDeliveryQueue {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Sender side has asked for shutdown, or is gone.
fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    !matches!(rx.has_changed(), Ok(false)) || *rx.borrow()
}

async fn run_worker(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    tracing::info!(
        max_attempts = shared.config.max_attempts,
        backoff = ?shared.config.backoff,
        "Outbound delivery worker started"
    );

    while !shutdown_requested(&shutdown_rx) {
        match shared.attempt().await {
            Attempt::Idle => {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(shared.config.idle_wait) => {}
                }
            }
            Attempt::Delivered(_) | Attempt::DeadLettered(_) => {}
            Attempt::Failed(Retry(job)) => {
                let stopping = tokio::select! {
                    _ = shutdown_rx.changed() => true,
                    _ = tokio::time::sleep(shared.config.backoff) => false,
                };
                // Requeue before exiting so a stop never loses the job.
                shared.push_back(job);
                if stopping {
                    break;
                }
            }
        }
    }

    tracing::info!("Outbound delivery worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TributaryError};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn manual(max_attempts: u32) -> OutboundQueueConfig {
        OutboundQueueConfig {
            worker_enabled: false,
            max_attempts,
            backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn always(status: &'static str, calls: Arc<AtomicUsize>) -> Arc<dyn DeliveryFn> {
        delivery_fn(move |_, _, _, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { status.to_string() }
        })
    }

    #[derive(Default)]
    struct RecordingJournal {
        delivered: Mutex<Vec<String>>,
        dead: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OutboundJournal for RecordingJournal {
        async fn on_delivered(&self, job: &OutboundJob) -> Result<()> {
            self.delivered.lock().push(job.id.clone());
            Ok(())
        }

        async fn on_dead_lettered(&self, job: &OutboundJob) -> Result<()> {
            self.dead.lock().push(job.id.clone());
            Err(TributaryError::internal("journal offline"))
        }
    }

    #[test]
    fn test_config_defaults_and_clamp() {
        let config: OutboundQueueConfig = serde_json::from_str(r#"{"backoff": "250ms"}"#).unwrap();
        assert!(config.worker_enabled);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff, Duration::from_millis(250));
        assert_eq!(config.idle_wait, Duration::from_millis(50));

        let calls = Arc::new(AtomicUsize::new(0));
        let queue = OutboundDeliveryQueue::new(always("sent:ok", calls), manual(0), None);
        assert_eq!(queue.config().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_successful_delivery_is_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let journal = Arc::new(RecordingJournal::default());
        let queue = OutboundDeliveryQueue::new(always("sent:ok", calls.clone()), manual(3), Some(journal.clone()));

        let job = queue.enqueue("slack", "C1", "hello", None);
        assert_eq!(job.attempts, 0);
        assert_eq!(queue.snapshot().queued, 1);

        assert_eq!(queue.process_next().await, StepOutcome::Delivered { job_id: job.id.clone() });
        assert_eq!(queue.process_next().await, StepOutcome::Idle);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*journal.delivered.lock(), vec![job.id]);
        assert_eq!(queue.stats().delivered(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_job_is_dead_lettered_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let journal = Arc::new(RecordingJournal::default());
        let queue = OutboundDeliveryQueue::new(always("failed:boom", calls.clone()), manual(3), Some(journal.clone()));
        let job = queue.enqueue("telegram", "42", "hi", Some("t".into()));

        assert!(matches!(queue.process_next().await, StepOutcome::Requeued { attempts: 1, .. }));
        assert!(matches!(queue.process_next().await, StepOutcome::Requeued { attempts: 2, .. }));
        assert_eq!(queue.process_next().await, StepOutcome::DeadLettered { job_id: job.id.clone() });
        assert_eq!(queue.process_next().await, StepOutcome::Idle);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.dead_lettered, 1);
        let dead = &snapshot.dead_letters[0];
        assert_eq!(dead.id, job.id);
        assert_eq!(dead.attempts, 3);
        assert_eq!(dead.last_error.as_deref(), Some("failed:boom"));
        assert_eq!(dead.thread_id.as_deref(), Some("t"));

        // Journal failure does not undo the dead-letter.
        assert_eq!(*journal.dead.lock(), vec![job.id]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_job_goes_to_tail() {
        let queue = OutboundDeliveryQueue::new(
            delivery_fn(|_, _, text, _| async move {
                if text == "bad" {
                    "failed:nope".to_string()
                } else {
                    format!("sent:{}", text)
                }
            }),
            manual(2),
            None,
        );
        let bad = queue.enqueue("slack", "C1", "bad", None);
        let good = queue.enqueue("slack", "C1", "good", None);

        assert!(matches!(queue.process_next().await, StepOutcome::Requeued { ref job_id, .. } if *job_id == bad.id));
        assert_eq!(queue.process_next().await, StepOutcome::Delivered { job_id: good.id });
        assert_eq!(queue.process_next().await, StepOutcome::DeadLettered { job_id: bad.id });
    }

    #[tokio::test]
    async fn test_worker_delivers_in_background() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = OutboundQueueConfig {
            idle_wait: Duration::from_millis(5),
            ..Default::default()
        };
        let queue = OutboundDeliveryQueue::new(always("sent:ok", calls.clone()), config, None);
        assert!(queue.is_running());

        queue.enqueue("slack", "C1", "a", None);
        queue.enqueue("slack", "C1", "b", None);

        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        queue.stop().await;
        assert!(!queue.is_running());
        assert_eq!(queue.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn test_stop_during_backoff_keeps_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = OutboundQueueConfig {
            backoff: Duration::from_secs(3600),
            idle_wait: Duration::from_millis(5),
            ..Default::default()
        };
        let queue = OutboundDeliveryQueue::new(always("failed:down", calls.clone()), config, None);
        queue.enqueue("slack", "C1", "x", None);

        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), queue.stop()).await.unwrap();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.dead_lettered, 0);
    }
}

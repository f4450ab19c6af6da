//! Cancellable acquisition loop shared by the polling sources.

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::telemetry::SourceMetrics;

/// What the loop should do after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Poll again right away.
    Continue,
    /// Sleep the poll interval first.
    Idle,
}

/// One unit of acquisition work, driven repeatedly by [`PollHandle`].
///
/// Dropping the future returned by `poll_once` must be safe: cancellation
/// happens by dropping it at whatever await point it is parked on.
#[async_trait]
pub trait PollWorker: Send + 'static {
    async fn poll_once(&mut self) -> Result<PollOutcome>;

    /// Release resources after the loop exits.
    async fn on_shutdown(&mut self) {}
}

/// A running acquisition loop.
#[derive(Debug)]
pub struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Spawn `worker` onto the runtime.
    ///
    /// Errors from an iteration are logged and counted, then the loop sleeps
    /// `interval` and tries again; they never end the loop.
    pub fn spawn<W: PollWorker>(source_id: impl Into<String>, interval: Duration, mut worker: W) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let source_id = source_id.into();

        let task = tokio::spawn(async move {
            tracing::debug!(source_id = %source_id, "Acquisition loop started");

            loop {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    outcome = worker.poll_once() => outcome,
                };

                let pause = match outcome {
                    Ok(PollOutcome::Continue) => continue,
                    Ok(PollOutcome::Idle) => interval,
                    Err(e) => {
                        SourceMetrics::acquisition_error(&source_id);
                        tracing::warn!(
                            source_id = %source_id,
                            error_code = %e.code(),
                            error = %e,
                            retry_in = ?interval,
                            "Acquisition error"
                        );
                        interval
                    }
                };

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            worker.on_shutdown().await;
            tracing::debug!(source_id = %source_id, "Acquisition loop stopped");
        });

        Self { cancel, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Acquisition loop panicked");
            }
        }
    }
}

//! Job status poller
//!
//! Drives one "start job → fetch status on a fixed interval → terminal state"
//! loop. Progress is delivered on every tick, terminal included; exactly one
//! of `on_result` / `on_error` fires, after which the loop ends. Transport
//! failures end the loop immediately (no automatic retry; callers retry by
//! starting a new job).
//!
//! The interval is fixed. There is deliberately no backoff.

use async_trait::async_trait;
use smc_common::{TaskState, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};

/// One status report, normalized across the different status endpoints
#[derive(Debug, Clone)]
pub struct JobStatus<T> {
    pub status: TaskStatus,
    pub task_state: TaskState,
    /// Payload of a completed job; `None` on a completed job means the
    /// response was missing something the caller needs
    pub output: Option<T>,
    pub message: Option<String>,
}

/// A pollable status endpoint
#[async_trait]
pub trait StatusEndpoint: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Short label for logs
    fn name(&self) -> &'static str;

    async fn fetch(&self, task_id: &str) -> ClientResult<JobStatus<Self::Output>>;
}

/// Receiver of one poll loop's callbacks
#[async_trait]
pub trait PollObserver<T: Send + 'static>: Send + 'static {
    async fn on_progress(&mut self, state: TaskState);

    async fn on_result(&mut self, result: T);

    async fn on_error(&mut self, error: ClientError);
}

/// How a poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// `on_result` was delivered
    Completed,
    /// `on_error` was delivered
    Failed,
    /// Stopped by the caller; no terminal callback was delivered
    Stopped,
}

/// Stop handle for a spawned poll loop
#[derive(Debug)]
pub struct PollHandle {
    task_id: String,
    cancel: CancellationToken,
    join: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Stop polling; no status request is issued after this returns
    ///
    /// A callback already running is not interrupted. Observers that must stay
    /// silent once stopped share the token via [`JobPoller::spawn_with_cancel`].
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to end
    pub async fn wait(self) -> PollOutcome {
        self.join.await.unwrap_or(PollOutcome::Stopped)
    }
}

/// Fixed-interval poll driver
#[derive(Debug, Clone, Copy)]
pub struct JobPoller {
    interval: Duration,
}

impl JobPoller {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the loop on a background task
    pub fn spawn<E, O>(&self, endpoint: Arc<E>, task_id: impl Into<String>, observer: O) -> PollHandle
    where
        E: StatusEndpoint + ?Sized,
        O: PollObserver<E::Output>,
    {
        self.spawn_with_cancel(endpoint, task_id, observer, CancellationToken::new())
    }

    /// Like [`JobPoller::spawn`], stopped through a caller-owned token
    pub fn spawn_with_cancel<E, O>(
        &self,
        endpoint: Arc<E>,
        task_id: impl Into<String>,
        mut observer: O,
        cancel: CancellationToken,
    ) -> PollHandle
    where
        E: StatusEndpoint + ?Sized,
        O: PollObserver<E::Output>,
    {
        let task_id = task_id.into();
        let poller = *self;
        let loop_cancel = cancel.clone();
        let loop_task_id = task_id.clone();

        let join = tokio::spawn(async move {
            poller
                .run(endpoint.as_ref(), &loop_task_id, &mut observer, &loop_cancel)
                .await
        });

        PollHandle {
            task_id,
            cancel,
            join,
        }
    }

    /// Poll until terminal, failure or cancellation
    ///
    /// The first status query happens one interval after the call.
    pub async fn run<E, O>(
        &self,
        endpoint: &E,
        task_id: &str,
        observer: &mut O,
        cancel: &CancellationToken,
    ) -> PollOutcome
    where
        E: StatusEndpoint + ?Sized,
        O: PollObserver<E::Output>,
    {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(endpoint = endpoint.name(), task_id = task_id, "Polling started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Self::stopped(endpoint, task_id),
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Self::stopped(endpoint, task_id),
                fetched = endpoint.fetch(task_id) => fetched,
            };

            let report = match fetched {
                Ok(report) => report,
                Err(error) => {
                    tracing::warn!(
                        endpoint = endpoint.name(),
                        task_id = task_id,
                        error = %error,
                        "Status request failed, polling stopped"
                    );
                    observer.on_error(error).await;
                    return PollOutcome::Failed;
                }
            };

            tracing::debug!(
                endpoint = endpoint.name(),
                task_id = task_id,
                status = ?report.status,
                progress = report.task_state.progress,
                "Poll tick"
            );
            observer.on_progress(report.task_state).await;

            if cancel.is_cancelled() {
                return Self::stopped(endpoint, task_id);
            }

            match report.status {
                TaskStatus::Completed => {
                    return match report.output {
                        Some(output) => {
                            tracing::info!(endpoint = endpoint.name(), task_id = task_id, "Job completed");
                            observer.on_result(output).await;
                            PollOutcome::Completed
                        }
                        None => {
                            tracing::error!(
                                endpoint = endpoint.name(),
                                task_id = task_id,
                                "Completed job is missing its result payload"
                            );
                            observer
                                .on_error(ClientError::Malformed(format!(
                                    "{}: completed job {} reported no result",
                                    endpoint.name(),
                                    task_id
                                )))
                                .await;
                            PollOutcome::Failed
                        }
                    };
                }
                TaskStatus::Failed => {
                    let message = report
                        .message
                        .unwrap_or_else(|| format!("{} job {} failed", endpoint.name(), task_id));
                    tracing::warn!(
                        endpoint = endpoint.name(),
                        task_id = task_id,
                        message = %message,
                        "Job failed"
                    );
                    observer.on_error(ClientError::JobFailed(message)).await;
                    return PollOutcome::Failed;
                }
                TaskStatus::Pending | TaskStatus::Running | TaskStatus::Unknown => {}
            }
        }
    }

    fn stopped<E: StatusEndpoint + ?Sized>(endpoint: &E, task_id: &str) -> PollOutcome {
        tracing::debug!(endpoint = endpoint.name(), task_id = task_id, "Polling stopped by caller");
        PollOutcome::Stopped
    }
}

//! Shared dispatch machinery: attempt execution, retry bookkeeping, and the
//! bounded worker loop used by the in-process and durable backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{FailureDisposition, Job};
use super::{JobFailure, JobHandler, ProgressReporter, QueueEvent};
use crate::error::QueueError;

/// Storage half of a backend, as seen by the worker loop.
#[async_trait]
pub(crate) trait JobStore: Send + Sync + 'static {
    /// Take the next dispatchable job and mark it active.
    async fn claim_next(&self) -> Result<Option<Job>, QueueError>;

    /// Persist a job that reached a terminal state.
    async fn settle(&self, job: &Job) -> Result<(), QueueError>;

    /// Persist a job in `retrying` state and make it dispatchable after `delay`.
    async fn schedule_retry(&self, job: Job, delay: Duration) -> Result<(), QueueError>;
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    Completed,
    Retrying { delay: Duration },
    Failed,
}

/// Run one attempt of `job` and record the outcome.
///
/// The handler runs in its own task so a panic is converted into an
/// ordinary failed attempt instead of tearing down the worker.
pub(crate) async fn run_attempt<S: JobStore + ?Sized>(
    store: &S,
    events: &broadcast::Sender<QueueEvent>,
    handler: Arc<dyn JobHandler>,
    mut job: Job,
) -> Result<Settled, QueueError> {
    let reporter = ProgressReporter::new(job.id, job.progress, events.clone());
    let snapshot = job.clone();
    let task_reporter = reporter.clone();

    debug!(
        job_id = %job.id,
        message_id = %job.payload.message_id,
        attempt = job.attempt_number(),
        "Running job attempt"
    );

    let result = tokio::spawn(async move { handler.handle(&snapshot, &task_reporter).await })
        .await
        .unwrap_or_else(|e| Err(JobFailure::new(format!("handler panicked: {e}"))));

    job.progress = reporter.current();

    match result {
        Ok(outcome) => {
            job.record_success();
            store.settle(&job).await?;
            info!(
                job_id = %job.id,
                message_id = %job.payload.message_id,
                outcome = %outcome.label,
                "Job completed"
            );
            let _ = events.send(QueueEvent::Completed {
                job_id: job.id,
                outcome,
            });
            Ok(Settled::Completed)
        }
        Err(failure) => match job.record_failure(&failure.reason) {
            FailureDisposition::Retry { delay } => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.reason,
                    "Job attempt failed, scheduling retry"
                );
                let _ = events.send(QueueEvent::Retrying {
                    job_id: job.id,
                    attempt: job.attempts,
                    delay,
                    error: failure.reason,
                });
                store.schedule_retry(job, delay).await?;
                Ok(Settled::Retrying { delay })
            }
            FailureDisposition::Exhausted => {
                store.settle(&job).await?;
                error!(
                    job_id = %job.id,
                    message_id = %job.payload.message_id,
                    attempts = job.attempts,
                    error = %failure.reason,
                    "Job failed permanently"
                );
                let _ = events.send(QueueEvent::Failed {
                    job_id: job.id,
                    attempts: job.attempts,
                    error: failure.reason,
                });
                Ok(Settled::Failed)
            }
        },
    }
}

/// State shared between a backend and its dispatch loop.
pub(crate) struct DispatchContext<S: JobStore> {
    pub store: Arc<S>,
    pub events: broadcast::Sender<QueueEvent>,
    pub wake: Arc<Notify>,
    pub paused: AtomicBool,
    pub shutdown: AtomicBool,
    /// Fallback re-check interval when no wakeup arrives.
    pub idle_poll: Duration,
}

impl<S: JobStore> DispatchContext<S> {
    pub fn new(
        store: Arc<S>,
        events: broadcast::Sender<QueueEvent>,
        wake: Arc<Notify>,
        idle_poll: Duration,
    ) -> Self {
        Self {
            store,
            events,
            wake,
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            idle_poll,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wait until a job can be claimed. `None` means the loop should exit.
    async fn next_job(&self) -> Option<Job> {
        loop {
            if self.is_stopped() {
                return None;
            }
            if !self.is_paused() {
                match self.store.claim_next().await {
                    Ok(Some(job)) => return Some(job),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to claim next job"),
                }
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.idle_poll) => {}
            }
        }
    }
}

/// Spawn the bounded worker loop: at most `concurrency` handler invocations
/// run at once, and a worker slot is reserved before a job is claimed so
/// claimed jobs never wait in memory.
pub(crate) fn spawn_dispatcher<S: JobStore>(
    ctx: Arc<DispatchContext<S>>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
) -> JoinHandle<()> {
    let concurrency = concurrency.max(1);
    tokio::spawn(async move {
        info!(concurrency, "Job dispatcher started");
        let slots = Arc::new(Semaphore::new(concurrency));

        loop {
            let Ok(slot) = Arc::clone(&slots).acquire_owned().await else {
                break;
            };
            let Some(job) = ctx.next_job().await else {
                break;
            };

            let ctx = Arc::clone(&ctx);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let _slot = slot;
                let job_id = job.id;
                if let Err(e) = run_attempt(ctx.store.as_ref(), &ctx.events, handler, job).await {
                    error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                }
                // A slot just freed up; let the loop look again right away.
                ctx.wake.notify_one();
            });
        }

        info!("Job dispatcher stopped");
    })
}

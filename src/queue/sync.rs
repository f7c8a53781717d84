//! Synchronous backend: last-resort fallback with no queueing at all.
//!
//! `add()` runs the registered handler inline and only returns once the job
//! is terminal, so retries (and their backoff sleeps) happen inside the call.
//! A small in-memory ledger backs `stats()` and `job()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use super::job::{Job, JobId, JobOptions, JobPayload, JobStatus};
use super::worker::{JobStore, Settled, run_attempt};
use super::{
    EVENT_CHANNEL_CAPACITY, JobHandle, JobHandler, QueueBackend, QueueEvent, QueueMode,
    QueueStats,
};
use crate::error::QueueError;

/// Job ledger. Retries are driven by `add()` itself, so `schedule_retry`
/// only records the job.
#[derive(Default)]
struct Ledger {
    jobs: Mutex<HashMap<JobId, Job>>,
}

#[async_trait]
impl JobStore for Ledger {
    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        Ok(None)
    }

    async fn settle(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn schedule_retry(&self, job: Job, _delay: Duration) -> Result<(), QueueError> {
        self.jobs.lock().await.insert(job.id, job);
        Ok(())
    }
}

/// Runs every job to completion inside `add()`.
pub struct SyncBackend {
    ledger: Arc<Ledger>,
    handler: RwLock<Option<Arc<dyn JobHandler>>>,
    events: broadcast::Sender<QueueEvent>,
    seq: AtomicU64,
    paused: AtomicBool,
}

impl SyncBackend {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ledger: Arc::new(Ledger::default()),
            handler: RwLock::new(None),
            events,
            seq: AtomicU64::new(0),
            paused: AtomicBool::new(false),
        }
    }
}

impl Default for SyncBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for SyncBackend {
    fn mode(&self) -> QueueMode {
        QueueMode::Sync
    }

    async fn add(&self, payload: JobPayload, options: JobOptions) -> Result<JobHandle, QueueError> {
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or(QueueError::NoHandler)?;

        if self.paused.load(Ordering::SeqCst) {
            // Nothing to hold jobs in; pausing is advisory here.
            warn!("Sync queue is paused, running job anyway");
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut job = Job::new(payload, options, seq);
        let handle = JobHandle::new(job.id, self.events.subscribe());
        debug!(job_id = %job.id, message_id = %job.payload.message_id, "Running job inline");

        loop {
            job.activate();
            self.ledger.settle(&job).await?;

            let settled = run_attempt(
                self.ledger.as_ref(),
                &self.events,
                Arc::clone(&handler),
                job.clone(),
            )
            .await?;

            match settled {
                Settled::Completed | Settled::Failed => break,
                Settled::Retrying { delay } => {
                    tokio::time::sleep(delay).await;
                    job = self
                        .ledger
                        .jobs
                        .lock()
                        .await
                        .get(&job.id)
                        .cloned()
                        .ok_or(QueueError::NotFound { id: job.id })?;
                }
            }
        }

        Ok(handle)
    }

    async fn register_handler(
        &self,
        _concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        let mut slot = self.handler.write().await;
        if slot.is_some() {
            return Err(QueueError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        info!("Sync queue handler registered");
        Ok(())
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.ledger.jobs.lock().await;
        let count = |status: JobStatus| jobs.values().filter(|j| j.status == status).count();
        Ok(QueueStats {
            waiting: 0,
            active: count(JobStatus::Active),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            delayed: count(JobStatus::Retrying),
            total: jobs.len(),
            mode: QueueMode::Sync,
        })
    }

    async fn clean(&self, grace: Duration) -> Result<usize, QueueError> {
        let Some(cutoff) = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(0);
        };
        let mut jobs = self.ledger.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|at| at <= cutoff))
        });
        Ok(before - jobs.len())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.ledger.jobs.lock().await.get(&id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {}
}

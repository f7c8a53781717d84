//! In-process backend: an in-memory priority list plus a bounded worker pool.
//!
//! Jobs are lost on restart. Dispatch is woken by a `Notify` on every enqueue,
//! resume, and finished attempt; `idle_poll` is only a fallback re-check.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::job::{Job, JobId, JobOptions, JobPayload, JobStatus};
use super::worker::{DispatchContext, JobStore, spawn_dispatcher};
use super::{
    EVENT_CHANNEL_CAPACITY, JobHandle, JobHandler, QueueBackend, QueueEvent, QueueMode,
    QueueStats,
};
use crate::error::QueueError;

/// Entry in the waiting list, ordered by (priority rank, arrival seq).
#[derive(Debug, Clone, Copy)]
struct Waiting {
    rank: u8,
    seq: u64,
    id: JobId,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    /// Kept sorted on every insertion.
    waiting: Vec<Waiting>,
    /// Jobs sitting out a backoff delay.
    delayed: usize,
}

impl MemoryState {
    fn enqueue(&mut self, job: Job) {
        let key = (job.priority.rank(), job.seq);
        let pos = self
            .waiting
            .partition_point(|w| (w.rank, w.seq) <= key);
        self.waiting.insert(
            pos,
            Waiting {
                rank: key.0,
                seq: key.1,
                id: job.id,
            },
        );
        self.jobs.insert(job.id, job);
    }

    fn pop_next(&mut self) -> Option<Job> {
        while !self.waiting.is_empty() {
            let entry = self.waiting.remove(0);
            if let Some(job) = self.jobs.get_mut(&entry.id) {
                job.activate();
                return Some(job.clone());
            }
        }
        None
    }
}

/// Storage half of the in-process backend.
pub(crate) struct MemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    seq: Arc<AtomicU64>,
    wake: Arc<Notify>,
}

impl MemoryJobStore {
    fn new(wake: Arc<Notify>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            seq: Arc::new(AtomicU64::new(0)),
            wake,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn push(&self, job: Job) {
        self.state.lock().await.enqueue(job);
        self.wake.notify_one();
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        Ok(self.state.lock().await.pop_next())
    }

    async fn settle(&self, job: &Job) -> Result<(), QueueError> {
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn schedule_retry(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.delayed += 1;
            state.jobs.insert(job.id, job.clone());
        }

        let state = Arc::clone(&self.state);
        let seq = Arc::clone(&self.seq);
        let wake = Arc::clone(&self.wake);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state.lock().await;
            state.delayed = state.delayed.saturating_sub(1);
            // Re-enqueue at the back of its priority band.
            let mut job = state.jobs.get(&job.id).cloned().unwrap_or(job);
            job.seq = seq.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(job_id = %job.id, attempt = job.attempts + 1, "Re-enqueueing job after backoff");
            state.enqueue(job);
            drop(state);
            wake.notify_one();
        });
        Ok(())
    }
}

/// In-process priority queue backend (the default).
pub struct InProcessBackend {
    ctx: Arc<DispatchContext<MemoryJobStore>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessBackend {
    pub fn new(idle_poll: Duration) -> Self {
        let wake = Arc::new(Notify::new());
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Arc::new(MemoryJobStore::new(Arc::clone(&wake)));
        Self {
            ctx: Arc::new(DispatchContext::new(store, events, wake, idle_poll)),
            dispatcher: Mutex::new(None),
        }
    }
}

#[async_trait]
impl QueueBackend for InProcessBackend {
    fn mode(&self) -> QueueMode {
        QueueMode::InProcess
    }

    async fn add(&self, payload: JobPayload, options: JobOptions) -> Result<JobHandle, QueueError> {
        let store = &self.ctx.store;
        let job = Job::new(payload, options, store.next_seq());
        let handle = JobHandle::new(job.id, self.ctx.events.subscribe());

        debug!(
            job_id = %job.id,
            message_id = %job.payload.message_id,
            priority = %job.priority,
            "Job enqueued"
        );
        store.push(job).await;
        Ok(handle)
    }

    async fn register_handler(
        &self,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Err(QueueError::HandlerAlreadyRegistered);
        }
        *dispatcher = Some(spawn_dispatcher(Arc::clone(&self.ctx), handler, concurrency));
        info!(concurrency, "In-process queue handler registered");
        Ok(())
    }

    async fn pause(&self) {
        self.ctx.pause();
        info!("In-process queue paused");
    }

    async fn resume(&self) {
        self.ctx.resume();
        info!("In-process queue resumed");
    }

    async fn is_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.ctx.store.state.lock().await;
        let count = |status: JobStatus| state.jobs.values().filter(|j| j.status == status).count();
        Ok(QueueStats {
            waiting: state.waiting.len(),
            active: count(JobStatus::Active),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            delayed: state.delayed,
            total: state.jobs.len(),
            mode: QueueMode::InProcess,
        })
    }

    async fn clean(&self, grace: Duration) -> Result<usize, QueueError> {
        let Some(cutoff) = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(0);
        };
        let mut state = self.ctx.store.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before - state.jobs.len();
        if removed > 0 {
            debug!(removed, "Cleaned finished jobs");
        }
        Ok(removed)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.ctx.store.state.lock().await.jobs.get(&id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.ctx.events.subscribe()
    }

    async fn shutdown(&self) {
        self.ctx.stop();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::queue::{BackoffPolicy, JobFailure, JobOutcome, JobPriority, JobResolution, ProgressReporter};

    const WAIT: Duration = Duration::from_secs(5);

    fn backend() -> InProcessBackend {
        InProcessBackend::new(Duration::from_millis(20))
    }

    fn fast_retry(max_attempts: u32) -> JobOptions {
        JobOptions::default()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(5)))
    }

    /// Records the order in which messages were handled.
    #[derive(Default)]
    struct Recorder {
        order: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: &Job, progress: &ProgressReporter) -> Result<JobOutcome, JobFailure> {
            progress.report(50);
            self.order.lock().unwrap().push(job.payload.message_id.clone());
            Ok(JobOutcome::new("done"))
        }
    }

    /// Fails the first `failures` attempts of every job.
    struct Flaky {
        failures: u32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, job: &Job, _progress: &ProgressReporter) -> Result<JobOutcome, JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job.attempts < self.failures {
                Err(JobFailure::new(format!("attempt {} failed", job.attempt_number())))
            } else {
                Ok(JobOutcome::new("recovered"))
            }
        }
    }

    #[tokio::test]
    async fn urgent_job_jumps_waiting_normal_jobs() {
        let backend = backend();
        backend.pause().await;

        let normal = JobOptions::default().with_priority(JobPriority::Normal);
        backend.add(JobPayload::new("n1", "t"), normal).await.unwrap();
        backend.add(JobPayload::new("n2", "t"), normal).await.unwrap();
        let urgent = backend
            .add(
                JobPayload::new("u1", "t"),
                JobOptions::default().with_priority(JobPriority::Urgent),
            )
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        backend.register_handler(1, recorder.clone()).await.unwrap();
        let mut events = backend.subscribe();
        backend.resume().await;

        tokio::time::timeout(WAIT, urgent.wait()).await.unwrap().unwrap();
        let mut completed = 0;
        while completed < 3 {
            if let QueueEvent::Completed { .. } = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                completed += 1;
            }
        }

        let order = recorder.order.lock().unwrap().clone();
        assert_eq!(order, vec!["u1", "n1", "n2"]);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let backend = backend();
        backend.pause().await;
        for id in ["a", "b", "c", "d"] {
            backend
                .add(JobPayload::new(id, "t"), JobOptions::default().with_priority(JobPriority::Low))
                .await
                .unwrap();
        }
        let last = backend
            .add(JobPayload::new("e", "t"), JobOptions::default().with_priority(JobPriority::Low))
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        backend.register_handler(1, recorder.clone()).await.unwrap();
        backend.resume().await;
        tokio::time::timeout(WAIT, last.wait()).await.unwrap().unwrap();

        assert_eq!(*recorder.order.lock().unwrap(), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn retries_then_completes() {
        let backend = backend();
        let handler = Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        backend.register_handler(2, handler.clone()).await.unwrap();

        let handle = backend.add(JobPayload::new("m", "t"), fast_retry(3)).await.unwrap();
        let id = handle.id;
        let resolution = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

        assert!(matches!(resolution, JobResolution::Completed(ref o) if o.label == "recovered"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let job = backend.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert!(job.attempts <= job.max_attempts);
    }

    #[tokio::test]
    async fn exhausted_job_fails_with_full_attempts() {
        let backend = backend();
        let handler = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicUsize::new(0),
        });
        backend.register_handler(1, handler.clone()).await.unwrap();

        let handle = backend.add(JobPayload::new("m", "t"), fast_retry(3)).await.unwrap();
        let id = handle.id;
        let resolution = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

        assert!(matches!(resolution, JobResolution::Failed { attempts: 3, .. }));
        let job = backend.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, job.max_attempts);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_job_does_not_block_others() {
        struct FailOne;

        #[async_trait]
        impl JobHandler for FailOne {
            async fn handle(&self, job: &Job, _p: &ProgressReporter) -> Result<JobOutcome, JobFailure> {
                if job.payload.message_id == "bad" {
                    Err(JobFailure::new("bad message"))
                } else {
                    Ok(JobOutcome::new("ok"))
                }
            }
        }

        let backend = backend();
        backend.register_handler(1, Arc::new(FailOne)).await.unwrap();

        let bad = backend
            .add(JobPayload::new("bad", "t"), JobOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        let good = backend.add(JobPayload::new("good", "t"), JobOptions::default()).await.unwrap();

        let bad = tokio::time::timeout(WAIT, bad.wait()).await.unwrap().unwrap();
        let good = tokio::time::timeout(WAIT, good.wait()).await.unwrap().unwrap();
        assert!(matches!(bad, JobResolution::Failed { attempts: 1, .. }));
        assert!(matches!(good, JobResolution::Completed(_)));
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        struct Panics;

        #[async_trait]
        impl JobHandler for Panics {
            async fn handle(&self, _job: &Job, _p: &ProgressReporter) -> Result<JobOutcome, JobFailure> {
                panic!("handler exploded");
            }
        }

        let backend = backend();
        backend.register_handler(1, Arc::new(Panics)).await.unwrap();
        let handle = backend
            .add(JobPayload::new("m", "t"), JobOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        let resolution = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
        match resolution {
            JobResolution::Failed { error, .. } => assert!(error.contains("panicked")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        struct Slow {
            running: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl JobHandler for Slow {
            async fn handle(&self, _job: &Job, _p: &ProgressReporter) -> Result<JobOutcome, JobFailure> {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(JobOutcome::new("ok"))
            }
        }

        let backend = backend();
        let handler = Arc::new(Slow {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        backend.register_handler(3, handler.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(
                backend
                    .add(JobPayload::new(format!("m{i}"), "t"), JobOptions::default())
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
        }

        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn pause_holds_new_jobs() {
        let backend = backend();
        let recorder = Arc::new(Recorder::default());
        backend.register_handler(1, recorder.clone()).await.unwrap();
        backend.pause().await;
        assert!(backend.is_paused().await);

        backend.add(JobPayload::new("held", "t"), JobOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(recorder.order.lock().unwrap().is_empty());
        assert_eq!(backend.stats().await.unwrap().waiting, 1);

        let mut events = backend.subscribe();
        backend.resume().await;
        loop {
            if let QueueEvent::Completed { .. } = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                break;
            }
        }
        assert_eq!(*recorder.order.lock().unwrap(), vec!["held"]);
    }

    #[tokio::test]
    async fn stats_count_delayed_retries() {
        let backend = backend();
        let handler = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        backend.register_handler(1, handler).await.unwrap();

        let options = JobOptions::default()
            .with_max_attempts(2)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(300)));
        let mut events = backend.subscribe();
        backend.add(JobPayload::new("m", "t"), options).await.unwrap();

        loop {
            if let QueueEvent::Retrying { .. } = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                break;
            }
        }
        // Give the worker a moment to hand the job to the backoff timer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.mode, QueueMode::InProcess);
    }

    #[tokio::test]
    async fn clean_removes_finished_jobs() {
        let backend = backend();
        backend.register_handler(1, Arc::new(Recorder::default())).await.unwrap();
        let handle = backend.add(JobPayload::new("m", "t"), JobOptions::default()).await.unwrap();
        tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

        assert_eq!(backend.clean(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(backend.clean(Duration::MAX).await.unwrap(), 0);
        assert_eq!(backend.clean(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(backend.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn second_handler_rejected() {
        let backend = backend();
        backend.register_handler(1, Arc::new(Recorder::default())).await.unwrap();
        let err = backend
            .register_handler(1, Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::HandlerAlreadyRegistered));
    }

    #[tokio::test]
    async fn progress_events_are_emitted() {
        let backend = backend();
        let mut events = backend.subscribe();
        backend.register_handler(1, Arc::new(Recorder::default())).await.unwrap();
        let handle = backend.add(JobPayload::new("m", "t"), JobOptions::default()).await.unwrap();
        let id = handle.id;
        tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

        let mut saw_progress = false;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Progress { job_id, percent } = event {
                assert_eq!(job_id, id);
                assert_eq!(percent, 50);
                saw_progress = true;
            }
        }
        assert!(saw_progress);
    }
}

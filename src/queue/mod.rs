//! Job queue: one `QueueBackend` interface, three interchangeable strategies.
//!
//! - `durable`: libSQL-backed jobs table shared by any number of worker processes
//! - `memory`: in-process priority list with a bounded worker pool (default)
//! - `sync`: no queueing; `add()` runs the handler before returning
//!
//! The strategy is chosen once at startup by `factory::create_backend()`.
//! `JobScheduler` wraps whichever backend is active.

pub mod durable;
pub mod factory;
pub mod job;
pub mod memory;
pub mod scheduler;
pub mod sync;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::error::QueueError;

pub use durable::DurableBackend;
pub use factory::{create_backend, select_mode};
pub use job::{
    BackoffKind, BackoffPolicy, FailureDisposition, Job, JobId, JobOptions, JobPayload,
    JobPriority, JobStatus,
};
pub use memory::InProcessBackend;
pub use scheduler::JobScheduler;
pub use sync::SyncBackend;

/// Capacity of the lifecycle event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ── Mode ────────────────────────────────────────────────────────────

/// Which backend strategy is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Durable,
    InProcess,
    Sync,
}

impl QueueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable" => Some(Self::Durable),
            "in_process" | "in-process" | "memory" => Some(Self::InProcess),
            "sync" | "direct" => Some(Self::Sync),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Durable => "durable",
            Self::InProcess => "in_process",
            Self::Sync => "sync",
        };
        write!(f, "{s}")
    }
}

// ── Handler contract ────────────────────────────────────────────────

/// Successful result of one job, as reported in `QueueEvent::Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Short machine-readable label (e.g. `completed`, `review:low_confidence`).
    pub label: String,
    pub detail: Option<String>,
}

impl JobOutcome {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A failed attempt. Always retried while the attempt budget lasts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct JobFailure {
    pub reason: String,
}

impl JobFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Work executed for each dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<JobOutcome, JobFailure>;
}

// ── Events ──────────────────────────────────────────────────────────

/// Typed lifecycle notifications, fanned out on a broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Progress {
        job_id: JobId,
        percent: u8,
    },
    Retrying {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Completed {
        job_id: JobId,
        outcome: JobOutcome,
    },
    Failed {
        job_id: JobId,
        attempts: u32,
        error: String,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Reports monotonic progress for one job.
///
/// Values lower than the highest already reported are dropped, including
/// values reported by later attempts of the same job.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    current: Arc<AtomicU8>,
    events: broadcast::Sender<QueueEvent>,
}

impl ProgressReporter {
    pub(crate) fn new(job_id: JobId, start: u8, events: broadcast::Sender<QueueEvent>) -> Self {
        Self {
            job_id,
            current: Arc::new(AtomicU8::new(start.min(100))),
            events,
        }
    }

    /// Reporter that is not attached to any queue (for direct orchestrator calls).
    pub fn detached(job_id: JobId) -> Self {
        let (events, _rx) = broadcast::channel(1);
        Self::new(job_id, 0, events)
    }

    /// Report progress; returns true if the value advanced.
    pub fn report(&self, percent: u8) -> bool {
        let percent = percent.min(100);
        let previous = self.current.fetch_max(percent, Ordering::AcqRel);
        if percent > previous {
            let _ = self.events.send(QueueEvent::Progress {
                job_id: self.job_id,
                percent,
            });
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::Acquire)
    }
}

// ── Handles & stats ─────────────────────────────────────────────────

/// How a job finished.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResolution {
    Completed(JobOutcome),
    Failed { attempts: u32, error: String },
}

/// Returned by `add()`; resolves when the job reaches a terminal state.
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    events: broadcast::Receiver<QueueEvent>,
}

impl JobHandle {
    /// The receiver must be subscribed before the job is enqueued,
    /// otherwise a fast job can finish before anyone listens.
    pub(crate) fn new(id: JobId, events: broadcast::Receiver<QueueEvent>) -> Self {
        Self { id, events }
    }

    /// Wait for the job's terminal event.
    pub async fn wait(mut self) -> Result<JobResolution, QueueError> {
        loop {
            match self.events.recv().await {
                Ok(QueueEvent::Completed { job_id, outcome }) if job_id == self.id => {
                    return Ok(JobResolution::Completed(outcome));
                }
                Ok(QueueEvent::Failed {
                    job_id,
                    attempts,
                    error,
                }) if job_id == self.id => {
                    return Ok(JobResolution::Failed { attempts, error });
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.id, skipped, "Job handle lagged behind queue events");
                }
                Err(RecvError::Closed) => return Err(QueueError::Closed),
            }
        }
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs sitting out a backoff delay.
    pub delayed: usize,
    pub total: usize,
    pub mode: QueueMode,
}

// ── Backend trait ───────────────────────────────────────────────────

/// A concrete queueing strategy.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn mode(&self) -> QueueMode;

    /// Enqueue a job (or, for the synchronous backend, run it to completion).
    async fn add(&self, payload: JobPayload, options: JobOptions) -> Result<JobHandle, QueueError>;

    /// Install the single handler and start dispatching with `concurrency` workers.
    async fn register_handler(
        &self,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError>;

    /// Stop dispatching new jobs; active jobs run to completion.
    async fn pause(&self);

    async fn resume(&self);

    async fn is_paused(&self) -> bool;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Drop completed/failed job records that finished more than `grace` ago.
    async fn clean(&self, grace: Duration) -> Result<usize, QueueError>;

    async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    /// Stop the dispatch loop. Jobs already running are not interrupted.
    async fn shutdown(&self);
}

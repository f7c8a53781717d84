//! Job model: priority, backoff policy, and the status state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend-assigned job identifier.
pub type JobId = Uuid;

/// Default attempt budget per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for the exponential backoff policy.
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 2_000;

// ── Priority ────────────────────────────────────────────────────────

/// Semantic job priority. Lower numeric rank is dispatched first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Numeric priority: urgent 1, high 2, normal 3, low 4.
    pub fn rank(self) -> u8 {
        match self {
            Self::Urgent => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Self::Urgent),
            2 => Some(Self::High),
            3 => Some(Self::Normal),
            4 => Some(Self::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

// ── Payload & options ───────────────────────────────────────────────

/// What a job refers to: one message under one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub message_id: String,
    pub tenant_id: String,
}

impl JobPayload {
    pub fn new(message_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Delay applied before re-enqueueing a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: duration_ms(base),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: duration_ms(delay),
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    ///
    /// Exponential: `base * 2^(attempt-1)`. Fixed: `base`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(63);
                self.delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(DEFAULT_BACKOFF_DELAY_MS))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Per-job options passed to `add()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// At least one attempt is always made.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Retrying)
                | (Retrying, Active)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Job ─────────────────────────────────────────────────────────────

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-enqueue after `delay`.
    Retry { delay: Duration },
    /// Attempt budget spent; the job is permanently failed.
    Exhausted,
}

/// One unit of queued work.
///
/// Owned by the backend that created it. Handlers receive a snapshot and
/// never mutate the stored record directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: JobPriority,
    /// Failed attempts so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub status: JobStatus,
    /// Highest progress reported so far, 0–100.
    pub progress: u8,
    /// Arrival order within the backend; ties on priority dispatch by this.
    pub seq: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(payload: JobPayload, options: JobOptions, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
            status: JobStatus::Waiting,
            progress: 0,
            seq,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// True when a failure of the current attempt would exhaust the budget.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }

    /// 1-based number of the attempt currently running (or about to run).
    pub fn attempt_number(&self) -> u32 {
        self.attempts + 1
    }

    pub(crate) fn activate(&mut self) {
        self.status = JobStatus::Active;
        self.updated_at = Utc::now();
    }

    pub(crate) fn record_success(&mut self) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.last_error = None;
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Count a failed attempt and decide between retry and permanent failure.
    pub(crate) fn record_failure(&mut self, reason: &str) -> FailureDisposition {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_error = Some(reason.to_string());
        let now = Utc::now();
        self.updated_at = now;

        if self.attempts < self.max_attempts {
            self.status = JobStatus::Retrying;
            FailureDisposition::Retry {
                delay: self.backoff.delay_for_attempt(self.attempts),
            }
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            FailureDisposition::Exhausted
        }
    }
}

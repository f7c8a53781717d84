//! Review item model and its status state machine.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::matching::MatchSummary;
use crate::pipeline::types::{Category, Sentiment};

// ── Reason & priority ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewReason {
    LowConfidence,
    HighValue,
    AmbiguousRequest,
    PolicyViolation,
    NegativeSentiment,
    CustomRequest,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::HighValue => "HIGH_VALUE",
            Self::AmbiguousRequest => "AMBIGUOUS_REQUEST",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::NegativeSentiment => "NEGATIVE_SENTIMENT",
            Self::CustomRequest => "CUSTOM_REQUEST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW_CONFIDENCE" => Some(Self::LowConfidence),
            "HIGH_VALUE" => Some(Self::HighValue),
            "AMBIGUOUS_REQUEST" => Some(Self::AmbiguousRequest),
            "POLICY_VIOLATION" => Some(Self::PolicyViolation),
            "NEGATIVE_SENTIMENT" => Some(Self::NegativeSentiment),
            "CUSTOM_REQUEST" => Some(Self::CustomRequest),
            _ => None,
        }
    }

    /// Priority for a new item. `existing` is whatever the message was
    /// already flagged with; only policy and high-value reasons override it.
    pub fn priority(&self, existing: Option<ReviewPriority>) -> ReviewPriority {
        match self {
            Self::PolicyViolation => ReviewPriority::Urgent,
            Self::HighValue => ReviewPriority::High,
            _ => existing.unwrap_or(ReviewPriority::Normal),
        }
    }
}

impl std::fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl ReviewPriority {
    /// Sort key: urgent first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Urgent => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "urgent" => Some(Self::Urgent),
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// SLA target in minutes, per priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaPolicy {
    pub urgent_minutes: u32,
    pub high_minutes: u32,
    pub normal_minutes: u32,
    pub low_minutes: u32,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            urgent_minutes: 30,
            high_minutes: 120,
            normal_minutes: 480,
            low_minutes: 1440,
        }
    }
}

impl SlaPolicy {
    pub fn target_minutes(&self, priority: ReviewPriority) -> u32 {
        match priority {
            ReviewPriority::Urgent => self.urgent_minutes,
            ReviewPriority::High => self.high_minutes,
            ReviewPriority::Normal => self.normal_minutes,
            ReviewPriority::Low => self.low_minutes,
        }
    }
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    InReview,
    Approved,
    Modified,
    Escalated,
}

impl ReviewStatus {
    /// Besides the plain `pending → in_review → approved|modified` path, an
    /// item can be escalated straight from `pending`, and an escalated item
    /// goes back to `in_review` once someone picks it up.
    pub fn can_transition_to(&self, target: ReviewStatus) -> bool {
        use ReviewStatus::*;

        matches!(
            (self, target),
            (Pending, InReview)
                | (Pending, Escalated)
                | (InReview, Approved)
                | (InReview, Modified)
                | (InReview, Escalated)
                | (Escalated, InReview)
        )
    }

    /// Still waiting on a human. At most one open item exists per message.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InReview | Self::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Modified => "modified",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "modified" => Some(Self::Modified),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a reviewer closed an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved,
    Modified,
}

impl From<ReviewOutcome> for ReviewStatus {
    fn from(outcome: ReviewOutcome) -> Self {
        match outcome {
            ReviewOutcome::Approved => Self::Approved,
            ReviewOutcome::Modified => Self::Modified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerValue {
    Vip,
    Returning,
    New,
}

// ── Audit ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewActionKind {
    Created,
    Assigned,
    Completed,
    Escalated,
}

/// One immutable audit-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAction {
    pub kind: ReviewActionKind,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub details: Option<String>,
}

/// What the pipeline knew when it escalated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewContext {
    pub category: Option<Category>,
    pub confidence: Option<u8>,
    pub sentiment: Option<Sentiment>,
    pub budget: Option<Decimal>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    pub suggested_subject: Option<String>,
    pub suggested_reply: Option<String>,
    #[serde(default)]
    pub matches: Vec<MatchSummary>,
    pub notes: Option<String>,
}

// ── Item ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: Uuid,
    pub tenant_id: String,
    pub message_id: String,
    pub reason: ReviewReason,
    pub priority: ReviewPriority,
    pub status: ReviewStatus,
    pub customer_value: CustomerValue,
    pub sla_target_minutes: u32,
    pub queued_at: DateTime<Utc>,
    pub due_by: DateTime<Utc>,
    pub assigned_to: Option<String>,
    pub context: ReviewContext,
    pub actions: Vec<ReviewAction>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: &str,
        message_id: &str,
        reason: ReviewReason,
        priority: ReviewPriority,
        customer_value: CustomerValue,
        sla: &SlaPolicy,
        context: ReviewContext,
        queued_at: DateTime<Utc>,
    ) -> Self {
        let sla_target_minutes = sla.target_minutes(priority);
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            message_id: message_id.to_string(),
            reason,
            priority,
            status: ReviewStatus::Pending,
            customer_value,
            sla_target_minutes,
            queued_at,
            due_by: queued_at + Duration::minutes(i64::from(sla_target_minutes)),
            assigned_to: None,
            context,
            actions: vec![ReviewAction {
                kind: ReviewActionKind::Created,
                actor: "system".to_string(),
                at: queued_at,
                details: Some(reason.as_str().to_string()),
            }],
            completed_at: None,
            updated_at: queued_at,
        }
    }

    /// True iff the deadline passed while the item still waits on a reviewer.
    ///
    /// Escalated items are already in front of a supervisor and do not count;
    /// they re-enter the check when reassigned to `in_review`.
    pub fn sla_breached(&self, now: DateTime<Utc>) -> bool {
        self.due_by < now && matches!(self.status, ReviewStatus::Pending | ReviewStatus::InReview)
    }

    pub(crate) fn record(&mut self, kind: ReviewActionKind, actor: &str, details: Option<String>, at: DateTime<Utc>) {
        self.actions.push(ReviewAction {
            kind,
            actor: actor.to_string(),
            at,
            details,
        });
        self.updated_at = at;
    }
}

//! Human review escalation with SLA tracking.

pub mod escalator;
pub mod model;

pub use escalator::ReviewEscalator;
pub use model::{
    CustomerValue, ReviewAction, ReviewActionKind, ReviewContext, ReviewItem, ReviewOutcome,
    ReviewPriority, ReviewReason, ReviewStatus, SlaPolicy,
};

//! Per-message workflow state machine.
//!
//! `Received → Categorizing → [VisionExtraction] → Validating → Matching →
//! DraftingResponse → Sending → Completed`, with exits to `Review` and
//! `Failed`.

use std::fmt;

use crate::error::PipelineError;
use crate::review::ReviewReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStage {
    Received,
    Categorizing,
    VisionExtraction,
    Validating,
    Matching,
    DraftingResponse,
    Sending,
    Completed,
    Review,
    Failed,
}

impl WorkflowStage {
    pub fn can_advance_to(&self, next: WorkflowStage) -> bool {
        use WorkflowStage::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Received, Categorizing)
                | (Received, Completed)
                | (Categorizing, VisionExtraction)
                | (Categorizing, Validating)
                | (Categorizing, Completed)
                | (Categorizing, Review)
                | (VisionExtraction, Validating)
                | (Validating, Matching)
                | (Validating, Review)
                | (Matching, DraftingResponse)
                | (DraftingResponse, Sending)
                | (DraftingResponse, Review)
                | (Sending, Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Review | Self::Failed)
    }

    /// Progress reported once the stage has finished.
    pub fn progress(&self) -> u8 {
        match self {
            Self::Received => 10,
            Self::Categorizing => 50,
            Self::VisionExtraction | Self::Validating => 60,
            Self::Matching => 70,
            Self::DraftingResponse => 80,
            Self::Sending => 90,
            Self::Completed | Self::Review | Self::Failed => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Categorizing => "categorizing",
            Self::VisionExtraction => "vision_extraction",
            Self::Validating => "validating",
            Self::Matching => "matching",
            Self::DraftingResponse => "drafting_response",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Review => "review",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workflow run ended. Review exits are successful terminations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Customer reply sent (or deliberately not sent).
    Replied { delivered: bool },
    /// Terminated early for this category; nothing more to do.
    Closed { category: String },
    /// Supplier offers were recorded.
    OffersRecorded { count: usize },
    LinkedToQuote { quote_ref: String },
    Review { reason: ReviewReason },
    Skipped,
    Duplicate,
    /// Permanent failure recorded on the message.
    Failed { error: String },
}

impl WorkflowOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied { .. } => "replied",
            Self::Closed { .. } => "closed",
            Self::OffersRecorded { .. } => "offers_recorded",
            Self::LinkedToQuote { .. } => "linked_to_quote",
            Self::Review { .. } => "review",
            Self::Skipped => "skipped",
            Self::Duplicate => "duplicate",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Replied { delivered } => Some(format!("delivered={delivered}")),
            Self::Closed { category } => Some(category.clone()),
            Self::OffersRecorded { count } => Some(format!("{count} offer(s)")),
            Self::LinkedToQuote { quote_ref } => Some(quote_ref.clone()),
            Self::Review { reason } => Some(reason.to_string()),
            Self::Failed { error } => Some(error.clone()),
            Self::Skipped | Self::Duplicate => None,
        }
    }
}

/// One pass of a message through the workflow.
#[derive(Debug)]
pub struct WorkflowRun {
    message_id: String,
    stage: WorkflowStage,
    visited: Vec<WorkflowStage>,
}

impl WorkflowRun {
    pub fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            stage: WorkflowStage::Received,
            visited: vec![WorkflowStage::Received],
        }
    }

    pub fn stage(&self) -> WorkflowStage {
        self.stage
    }

    pub fn visited(&self) -> &[WorkflowStage] {
        &self.visited
    }

    pub fn advance(&mut self, next: WorkflowStage) -> Result<(), PipelineError> {
        if !self.stage.can_advance_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(message_id = %self.message_id, from = %self.stage, to = %next, "Workflow stage");
        self.stage = next;
        self.visited.push(next);
        Ok(())
    }
}

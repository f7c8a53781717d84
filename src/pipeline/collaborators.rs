//! Contracts of the external services the workflow calls out to.
//!
//! Each trait is one async boundary; implementations own their timeouts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::pipeline::types::{
    CategorizationResult, DeliveryReceipt, DraftContext, DraftKind, DraftedResponse,
    ExtractedData, InboundMessage, ItineraryEvaluation, OutboundMail, VisionResult,
};

/// Combined categorization and structured extraction.
#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn categorize_and_extract(
        &self,
        message: &InboundMessage,
    ) -> Result<CategorizationResult, CollaboratorError>;
}

/// Recovers contact details from image attachments.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    async fn extract_contacts(
        &self,
        message: &InboundMessage,
    ) -> Result<VisionResult, CollaboratorError>;
}

/// Decides which reply path fits a customer request.
#[async_trait]
pub trait ItineraryMatcher: Send + Sync {
    async fn evaluate(
        &self,
        extracted: &ExtractedData,
        tenant_id: &str,
    ) -> Result<ItineraryEvaluation, CollaboratorError>;
}

/// Model-drafted replies.
#[async_trait]
pub trait ResponseDrafter: Send + Sync {
    async fn draft(
        &self,
        kind: DraftKind,
        context: &DraftContext<'_>,
    ) -> Result<DraftedResponse, CollaboratorError>;
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutboundMail) -> Result<DeliveryReceipt, CollaboratorError>;
}

/// Stand-in transport when no delivery channel is configured.
///
/// Every send is a permanent `NotConfigured` error.
pub struct UnconfiguredMail;

#[async_trait]
impl MailTransport for UnconfiguredMail {
    async fn send(&self, _mail: &OutboundMail) -> Result<DeliveryReceipt, CollaboratorError> {
        Err(CollaboratorError::NotConfigured {
            service: "mail".to_string(),
            reason: "no SMTP host configured".to_string(),
        })
    }
}

/// All collaborators the orchestrator needs, bundled for injection.
#[derive(Clone)]
pub struct Collaborators {
    pub categorizer: Arc<dyn Categorizer>,
    pub vision: Arc<dyn VisionExtractor>,
    pub itinerary: Arc<dyn ItineraryMatcher>,
    pub drafter: Arc<dyn ResponseDrafter>,
    pub mail: Arc<dyn MailTransport>,
}

//! Shared types for the message processing pipeline.
//!
//! Every stage result is an explicit struct; optional fields are `Option`s
//! rather than untyped JSON. Wire-facing types use camelCase.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::matching::MatchSummary;
use crate::queue::JobPriority;
use crate::review::ReviewReason;

// ── Inbound message ─────────────────────────────────────────────────

/// A parsed inbound email, already thread-tagged by the ingestion side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub tenant_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Reply/forward of an earlier thread (computed upstream).
    #[serde(default)]
    pub is_reply: bool,
    /// Known customer record this sender maps to, if any.
    pub customer_id: Option<String>,
    /// Explicit urgency from the ingestion side; overrides subject heuristics.
    pub priority_hint: Option<JobPriority>,
}

impl InboundMessage {
    pub fn image_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_image())
    }

    pub fn has_image_attachments(&self) -> bool {
        self.image_attachments().next().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub url: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type.to_ascii_lowercase().starts_with("image/")
    }
}

// ── Categorization ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Customer,
    Supplier,
    Spam,
    Agent,
    Finance,
    Other,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Customer => "CUSTOMER",
            Self::Supplier => "SUPPLIER",
            Self::Spam => "SPAM",
            Self::Agent => "AGENT",
            Self::Finance => "FINANCE",
            Self::Other => "OTHER",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

/// Result of the combined categorize-and-extract call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizationResult {
    pub category: Category,
    /// 0–100.
    pub confidence: u8,
    #[serde(default)]
    pub sentiment: Sentiment,
    pub extracted_data: Option<ExtractedData>,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub tokens: u64,
}

// ── Extracted intent ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

impl ContactInfo {
    /// Fill fields that are still unknown. Known values are never overwritten.
    pub fn merge_missing(&mut self, other: &ContactInfo) {
        fn fill(slot: &mut Option<String>, candidate: &Option<String>) {
            if slot.as_deref().is_none_or(|s| s.trim().is_empty()) {
                if let Some(v) = candidate.as_deref().filter(|v| !v.trim().is_empty()) {
                    *slot = Some(v.to_string());
                }
            }
        }
        fill(&mut self.name, &other.name);
        fill(&mut self.email, &other.email);
        fill(&mut self.phone, &other.phone);
        fill(&mut self.company, &other.company);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    /// Last day of the trip (the start date for open-ended requests).
    pub fn last_day(&self) -> NaiveDate {
        self.end.unwrap_or(self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub amount: Decimal,
    pub currency: Option<String>,
    /// Amount is per traveller rather than for the whole party.
    #[serde(default)]
    pub per_person: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Travelers {
    pub adults: u32,
    #[serde(default)]
    pub children: u32,
}

impl Travelers {
    pub fn total(&self) -> u32 {
        self.adults.saturating_add(self.children)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    pub package_type: Option<String>,
    pub meal_plan: Option<String>,
    /// Minimum star rating.
    pub accommodation_rating: Option<u8>,
    pub notes: Option<String>,
}

/// An offer contained in a supplier's email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierOffer {
    pub title: String,
    pub destination: String,
    pub country: Option<String>,
    pub price: Option<Decimal>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub min_pax: Option<u32>,
    pub max_pax: Option<u32>,
    pub package_type: Option<String>,
    pub meal_plan: Option<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
}

/// Structured intent pulled out of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedData {
    #[serde(default)]
    pub contact: ContactInfo,
    pub destination: Option<String>,
    pub travel_dates: Option<DateRange>,
    pub budget: Option<Budget>,
    pub travelers: Option<Travelers>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub supplier_offers: Vec<SupplierOffer>,
    /// Reference to a quote this message follows up on.
    pub existing_quote_ref: Option<String>,
}

impl ExtractedData {
    /// Names of the request fields still unknown.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.destination.as_deref().is_none_or(|d| d.trim().is_empty()) {
            missing.push("destination");
        }
        if self.travel_dates.is_none() {
            missing.push("travel_dates");
        }
        if self.budget.is_none() {
            missing.push("budget");
        }
        if self.travelers.is_none_or(|t| t.total() == 0) {
            missing.push("travelers");
        }
        if self.contact.name.is_none() {
            missing.push("contact_name");
        }
        if self.contact.email.is_none() && self.contact.phone.is_none() {
            missing.push("contact_method");
        }
        missing
    }

    /// Budget for the whole party. A per-person amount too large to scale
    /// counts as no budget.
    pub fn total_budget(&self) -> Option<Decimal> {
        let budget = self.budget.as_ref()?;
        if budget.per_person {
            let party = self.travelers.map(|t| t.total()).filter(|n| *n > 0).unwrap_or(1);
            budget.amount.checked_mul(Decimal::from(party))
        } else {
            Some(budget.amount)
        }
    }
}

// ── Vision ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionResult {
    pub success: bool,
    #[serde(default)]
    pub contacts: Vec<ContactInfo>,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub tokens: u64,
}

// ── Itinerary decision ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    AskCustomerForInfo,
    SendGoodMatches,
    SendModerateMatches,
    ForwardCustomRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItineraryWorkflow {
    pub action: WorkflowAction,
    pub reason: Option<String>,
    #[serde(default)]
    pub matches: Vec<MatchSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItineraryValidation {
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default)]
    pub missing_info: Vec<String>,
}

/// Answer of the itinerary-workflow collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItineraryEvaluation {
    #[serde(default)]
    pub validation: ItineraryValidation,
    pub workflow: Option<ItineraryWorkflow>,
}

// ── Drafting & delivery ─────────────────────────────────────────────

/// Which reply path produced a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftKind {
    RequestMoreInfo,
    GoodMatches,
    ModerateMatches,
    CustomRequest,
    /// No itinerary signal; drafted by the model.
    Fallback,
}

impl DraftKind {
    pub fn for_action(action: WorkflowAction) -> Self {
        match action {
            WorkflowAction::AskCustomerForInfo => Self::RequestMoreInfo,
            WorkflowAction::SendGoodMatches => Self::GoodMatches,
            WorkflowAction::SendModerateMatches => Self::ModerateMatches,
            WorkflowAction::ForwardCustomRequest => Self::CustomRequest,
        }
    }

    /// Templated kinds are rendered locally at no model cost.
    pub fn is_templated(&self) -> bool {
        !matches!(self, Self::Fallback)
    }
}

/// Everything a drafter needs to write a reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftContext<'a> {
    pub message: &'a InboundMessage,
    pub extracted: Option<&'a ExtractedData>,
    pub matches: &'a [MatchSummary],
    pub reason: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftedResponse {
    pub kind: DraftKind,
    pub subject: String,
    pub body: String,
    pub plain_text: String,
    #[serde(default)]
    pub cost: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMail {
    pub tenant_id: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub delivery_id: String,
}

// ── Processing state ────────────────────────────────────────────────

/// `processingStatus` on the message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
    ConvertedToQuote,
    LinkedToExistingQuote,
    DuplicateDetected,
}

impl ProcessingStatus {
    pub fn can_transition_to(&self, target: ProcessingStatus) -> bool {
        use ProcessingStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Skipped)
                | (Pending, DuplicateDetected)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Skipped)
                | (Processing, DuplicateDetected)
                | (Processing, Pending)
                | (Failed, Processing)
                | (Failed, Pending)
                | (Completed, ConvertedToQuote)
                | (Completed, LinkedToExistingQuote)
        )
    }

    /// No further automated processing will happen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::ConvertedToQuote => "converted_to_quote",
            Self::LinkedToExistingQuote => "linked_to_existing_quote",
            Self::DuplicateDetected => "duplicate_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "converted_to_quote" => Some(Self::ConvertedToQuote),
            "linked_to_existing_quote" => Some(Self::LinkedToExistingQuote),
            "duplicate_detected" => Some(Self::DuplicateDetected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The message record as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message: InboundMessage,
    pub processing_status: ProcessingStatus,
    pub category: Option<Category>,
    pub confidence: Option<u8>,
    pub sentiment: Option<Sentiment>,
    pub extracted_data: Option<ExtractedData>,
    #[serde(default)]
    pub requires_review: bool,
    pub review_reason: Option<ReviewReason>,
    pub response: Option<DraftedResponse>,
    #[serde(default)]
    pub response_generated: bool,
    pub response_sent_at: Option<DateTime<Utc>>,
    pub delivery_id: Option<String>,
    /// Answered by a human outside the pipeline.
    #[serde(default)]
    pub manually_answered: bool,
    pub duplicate_of: Option<String>,
    pub quote_id: Option<String>,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub matching_results: Vec<MatchSummary>,
    /// Permanent failure surfaced to operators.
    pub processing_error: Option<String>,
    /// Delivery failure after a response was drafted (non-fatal).
    pub send_error: Option<String>,
    /// Bumped on every save; guards against lost updates.
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(message: InboundMessage) -> Self {
        let now = Utc::now();
        Self {
            message,
            processing_status: ProcessingStatus::Pending,
            category: None,
            confidence: None,
            sentiment: None,
            extracted_data: None,
            requires_review: false,
            review_reason: None,
            response: None,
            response_generated: false,
            response_sent_at: None,
            delivery_id: None,
            manually_answered: false,
            duplicate_of: None,
            quote_id: None,
            cost: Decimal::ZERO,
            tokens_used: 0,
            matching_results: Vec::new(),
            processing_error: None,
            send_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.message.tenant_id
    }

    /// Move along a declared edge. Same-status moves are a no-op.
    pub fn transition(&mut self, target: ProcessingStatus) -> Result<(), crate::error::PipelineError> {
        if self.processing_status == target {
            return Ok(());
        }
        if !self.processing_status.can_transition_to(target) {
            return Err(crate::error::PipelineError::InvalidTransition {
                from: self.processing_status.to_string(),
                to: target.to_string(),
            });
        }
        self.processing_status = target;
        Ok(())
    }

    /// Add one collaborator call's spend to the accumulators.
    pub fn add_usage(&mut self, cost: Decimal, tokens: u64) {
        self.cost = self.cost.saturating_add(cost);
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    pub fn apply_categorization(&mut self, result: &CategorizationResult) {
        self.category = Some(result.category);
        self.confidence = Some(result.confidence);
        self.sentiment = Some(result.sentiment);
        self.extracted_data = result.extracted_data.clone();
        self.add_usage(result.cost, result.tokens);
    }
}

//! `WorkflowOrchestrator`: drives one message through the workflow.
//!
//! Registered with the scheduler as the job handler. Every change to the
//! message record goes through [`MessageStore::update`] at a stage boundary,
//! so progress made before a crash or a retry is kept.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, DatabaseError, PipelineError, ReviewError};
use crate::inventory::InventorySource;
use crate::matching::{MatchCriteria, MatchSummary, MatchingEngine};
use crate::pipeline::collaborators::Collaborators;
use crate::pipeline::state::{WorkflowOutcome, WorkflowRun, WorkflowStage};
use crate::pipeline::templates;
use crate::pipeline::types::{
    CategorizationResult, Category, DraftContext, DraftKind, DraftedResponse, ExtractedData,
    ItineraryWorkflow, MessageRecord, OutboundMail, ProcessingStatus,
};
use crate::queue::{Job, JobFailure, JobHandler, JobOutcome, ProgressReporter};
use crate::review::{ReviewContext, ReviewEscalator, ReviewReason};
use crate::store::MessageStore;

/// Progress once the itinerary decision is in.
const ITINERARY_PROGRESS: u8 = 75;

pub struct WorkflowOrchestrator {
    messages: Arc<MessageStore>,
    collaborators: Collaborators,
    matching: Arc<MatchingEngine>,
    inventory: Arc<dyn InventorySource>,
    reviews: Arc<ReviewEscalator>,
    config: PipelineConfig,
}

impl WorkflowOrchestrator {
    pub fn new(
        messages: Arc<MessageStore>,
        collaborators: Collaborators,
        matching: Arc<MatchingEngine>,
        inventory: Arc<dyn InventorySource>,
        reviews: Arc<ReviewEscalator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            messages,
            collaborators,
            matching,
            inventory,
            reviews,
            config,
        }
    }

    /// Run the workflow for one message.
    ///
    /// Business exits (review, spam, supplier) are `Ok`. Errors are left for
    /// the caller to classify as retryable or permanent.
    pub async fn process(
        &self,
        message_id: &str,
        progress: &ProgressReporter,
    ) -> Result<WorkflowOutcome, PipelineError> {
        let mut run = WorkflowRun::new(message_id);
        let record = self
            .messages
            .get(message_id)
            .await?
            .ok_or_else(|| PipelineError::MessageNotFound {
                id: message_id.to_string(),
            })?;

        if record.processing_status.is_terminal() {
            info!(
                message_id,
                status = %record.processing_status,
                "Message already settled, nothing to do"
            );
            return Ok(WorkflowOutcome::Closed {
                category: record.processing_status.to_string(),
            });
        }

        if record.duplicate_of.is_some() {
            self.set_status(message_id, ProcessingStatus::DuplicateDetected).await?;
            info!(message_id, duplicate_of = ?record.duplicate_of, "Duplicate message");
            return Ok(WorkflowOutcome::Duplicate);
        }

        if record.manually_answered {
            self.set_status(message_id, ProcessingStatus::Skipped).await?;
            info!(message_id, "Already answered by a human, skipping");
            return Ok(WorkflowOutcome::Skipped);
        }

        let record = self.set_status(message_id, ProcessingStatus::Processing).await?;

        // ── Categorizing ────────────────────────────────────────────
        step(&mut run, WorkflowStage::Categorizing, progress)?;
        let categorization = match persisted_categorization(&record) {
            Some(previous) => {
                debug!(message_id, "Reusing persisted categorization");
                previous
            }
            None => {
                let result = self
                    .collaborators
                    .categorizer
                    .categorize_and_extract(&record.message)
                    .await?;
                self.messages
                    .update(message_id, |r: &mut MessageRecord| {
                        r.apply_categorization(&result);
                        Ok::<_, DatabaseError>(())
                    })
                    .await?;
                result
            }
        };
        info!(
            message_id,
            category = %categorization.category,
            confidence = categorization.confidence,
            "Message categorized"
        );

        if categorization.confidence < self.config.confidence_threshold {
            let record = self.messages.require(message_id).await?;
            let context = review_context(&record, &[], None);
            return self
                .exit_to_review(&mut run, message_id, ReviewReason::LowConfidence, context)
                .await;
        }

        match categorization.category {
            Category::Customer => {}
            Category::Supplier => {
                let count = self.record_supplier_offers(&record, &categorization).await?;
                self.complete(&mut run, message_id, None).await?;
                return Ok(WorkflowOutcome::OffersRecorded { count });
            }
            other => {
                self.complete(&mut run, message_id, None).await?;
                return Ok(WorkflowOutcome::Closed {
                    category: other.to_string(),
                });
            }
        }

        // ── Vision extraction ───────────────────────────────────────
        if record.message.has_image_attachments() {
            step(&mut run, WorkflowStage::VisionExtraction, progress)?;
            self.extract_image_contacts(&record).await?;
        }

        // ── Validating ──────────────────────────────────────────────
        step(&mut run, WorkflowStage::Validating, progress)?;
        let record = self.messages.require(message_id).await?;
        let extracted = record.extracted_data.clone().unwrap_or_default();
        let missing = extracted.missing_fields();
        if missing.len() > self.config.max_missing_fields {
            debug!(message_id, ?missing, "Request too ambiguous to match");
            let context = review_context(&record, &[], None);
            return self
                .exit_to_review(&mut run, message_id, ReviewReason::AmbiguousRequest, context)
                .await;
        }

        // ── Matching ────────────────────────────────────────────────
        step(&mut run, WorkflowStage::Matching, progress)?;
        let criteria = MatchCriteria::from_extracted(&extracted);
        let candidates = self
            .matching
            .match_packages(&criteria, record.tenant_id())
            .await?;
        let summaries: Vec<MatchSummary> = candidates.iter().map(|c| c.summary()).collect();
        self.messages
            .update(message_id, |r: &mut MessageRecord| {
                r.matching_results = summaries.clone();
                Ok::<_, DatabaseError>(())
            })
            .await?;
        progress.report(WorkflowStage::Matching.progress());

        let workflow = self.evaluate_itinerary(&extracted, record.tenant_id()).await;
        progress.report(ITINERARY_PROGRESS);

        // ── Drafting ────────────────────────────────────────────────
        step(&mut run, WorkflowStage::DraftingResponse, progress)?;
        let draft = self
            .draft_response(&record, &extracted, &summaries, workflow.as_ref())
            .await?;

        // The draft stays on the record for the reviewer; nothing here sends
        // it once the review is approved.
        if let Some(budget) = extracted
            .total_budget()
            .filter(|budget| *budget > self.config.high_value_threshold)
        {
            info!(message_id, %budget, "High-value request, holding reply for approval");
            let record = self.messages.require(message_id).await?;
            let context = review_context(&record, &summaries, Some(&draft));
            return self
                .exit_to_review(&mut run, message_id, ReviewReason::HighValue, context)
                .await;
        }

        // ── Sending ─────────────────────────────────────────────────
        step(&mut run, WorkflowStage::Sending, progress)?;
        let delivered = self.send_reply(message_id, &extracted, &draft).await?;
        progress.report(WorkflowStage::Sending.progress());

        self.complete(&mut run, message_id, extracted.existing_quote_ref.as_deref())
            .await?;
        match extracted.existing_quote_ref {
            Some(quote_ref) => Ok(WorkflowOutcome::LinkedToQuote { quote_ref }),
            None => Ok(WorkflowOutcome::Replied { delivered }),
        }
    }

    async fn set_status(
        &self,
        message_id: &str,
        status: ProcessingStatus,
    ) -> Result<MessageRecord, PipelineError> {
        self.messages
            .update(message_id, |r: &mut MessageRecord| r.transition(status))
            .await
    }

    /// Finish as completed, optionally linking to the quote the message
    /// follows up on.
    async fn complete(
        &self,
        run: &mut WorkflowRun,
        message_id: &str,
        quote_ref: Option<&str>,
    ) -> Result<(), PipelineError> {
        run.advance(WorkflowStage::Completed)?;
        self.messages
            .update(message_id, |r: &mut MessageRecord| {
                r.transition(ProcessingStatus::Completed)?;
                if let Some(quote_ref) = quote_ref {
                    r.transition(ProcessingStatus::LinkedToExistingQuote)?;
                    r.quote_id = Some(quote_ref.to_string());
                }
                Ok::<_, PipelineError>(())
            })
            .await?;
        Ok(())
    }

    async fn exit_to_review(
        &self,
        run: &mut WorkflowRun,
        message_id: &str,
        reason: ReviewReason,
        context: ReviewContext,
    ) -> Result<WorkflowOutcome, PipelineError> {
        run.advance(WorkflowStage::Review)?;
        let item = self
            .reviews
            .send_to_review(message_id, reason, context)
            .await?;
        self.messages
            .update(message_id, |r: &mut MessageRecord| {
                r.transition(ProcessingStatus::Completed)
            })
            .await?;
        info!(message_id, review_id = %item.id, %reason, "Workflow exited to review");
        Ok(WorkflowOutcome::Review { reason })
    }

    async fn record_supplier_offers(
        &self,
        record: &MessageRecord,
        categorization: &CategorizationResult,
    ) -> Result<usize, PipelineError> {
        let offers = categorization
            .extracted_data
            .as_ref()
            .map(|data| data.supplier_offers.as_slice())
            .unwrap_or_default();
        if offers.is_empty() {
            debug!(message_id = record.id(), "Supplier message without offers");
            return Ok(0);
        }
        let supplier = record
            .message
            .sender_name
            .as_deref()
            .unwrap_or(&record.message.sender);
        Ok(self
            .inventory
            .record_supplier_offers(record.tenant_id(), supplier, offers)
            .await?)
    }

    /// Merge contacts found in images into the extracted data. Vision
    /// failures never stop the workflow.
    async fn extract_image_contacts(&self, record: &MessageRecord) -> Result<(), PipelineError> {
        let vision = match self
            .collaborators
            .vision
            .extract_contacts(&record.message)
            .await
        {
            Ok(vision) => vision,
            Err(e) => {
                warn!(message_id = record.id(), error = %e, "Vision extraction failed, continuing");
                return Ok(());
            }
        };

        self.messages
            .update(record.id(), |r: &mut MessageRecord| {
                r.add_usage(vision.cost, vision.tokens);
                if vision.success {
                    let data = r.extracted_data.get_or_insert_with(ExtractedData::default);
                    for contact in &vision.contacts {
                        data.contact.merge_missing(contact);
                    }
                }
                Ok::<_, DatabaseError>(())
            })
            .await?;
        debug!(
            message_id = record.id(),
            contacts = vision.contacts.len(),
            "Vision extraction merged"
        );
        Ok(())
    }

    /// Itinerary decision, or `None` when the collaborator has no signal.
    async fn evaluate_itinerary(
        &self,
        extracted: &ExtractedData,
        tenant_id: &str,
    ) -> Option<ItineraryWorkflow> {
        match self
            .collaborators
            .itinerary
            .evaluate(extracted, tenant_id)
            .await
        {
            Ok(evaluation) => evaluation.workflow,
            Err(e) => {
                warn!(tenant_id, error = %e, "Itinerary evaluation failed, using fallback draft");
                None
            }
        }
    }

    async fn draft_response(
        &self,
        record: &MessageRecord,
        extracted: &ExtractedData,
        summaries: &[MatchSummary],
        workflow: Option<&ItineraryWorkflow>,
    ) -> Result<DraftedResponse, PipelineError> {
        if let Some(previous) = record.response.clone().filter(|_| record.response_generated) {
            debug!(message_id = record.id(), "Reusing persisted draft");
            return Ok(previous);
        }

        let kind = workflow
            .map(|w| DraftKind::for_action(w.action))
            .unwrap_or(DraftKind::Fallback);
        let matches = match workflow {
            Some(w) if !w.matches.is_empty() => w.matches.as_slice(),
            _ => summaries,
        };
        let context = DraftContext {
            message: &record.message,
            extracted: Some(extracted),
            matches,
            reason: workflow.and_then(|w| w.reason.as_deref()),
        };

        let draft = match templates::render(kind, &context) {
            Some(draft) => draft,
            None => self.collaborators.drafter.draft(kind, &context).await?,
        };

        self.messages
            .update(record.id(), |r: &mut MessageRecord| {
                r.response = Some(draft.clone());
                r.response_generated = true;
                r.add_usage(draft.cost, 0);
                Ok::<_, DatabaseError>(())
            })
            .await?;
        info!(message_id = record.id(), kind = ?draft.kind, "Response drafted");
        Ok(draft)
    }

    /// Send the drafted reply. Returns whether it went out.
    ///
    /// A missing delivery channel is a permanent error; any other send
    /// failure is noted on the message and the workflow carries on.
    async fn send_reply(
        &self,
        message_id: &str,
        extracted: &ExtractedData,
        draft: &DraftedResponse,
    ) -> Result<bool, PipelineError> {
        let record = self.messages.require(message_id).await?;
        if record.response_sent_at.is_some() {
            debug!(message_id, delivery_id = ?record.delivery_id, "Reply already sent by an earlier attempt");
            return Ok(true);
        }
        if record.manually_answered {
            info!(message_id, "Answered by a human meanwhile, not sending");
            return Ok(false);
        }

        let to = extracted
            .contact
            .email
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| record.message.sender.clone());
        let mail = OutboundMail {
            tenant_id: record.tenant_id().to_string(),
            to,
            subject: draft.subject.clone(),
            html_body: draft.body.clone(),
            text_body: draft.plain_text.clone(),
            in_reply_to: Some(record.id().to_string()).filter(|id| id.starts_with('<')),
        };

        match self.collaborators.mail.send(&mail).await {
            Ok(receipt) => {
                self.messages
                    .update(message_id, |r: &mut MessageRecord| {
                        r.response_sent_at = Some(chrono::Utc::now());
                        r.delivery_id = Some(receipt.delivery_id.clone());
                        r.send_error = None;
                        Ok::<_, DatabaseError>(())
                    })
                    .await?;
                Ok(true)
            }
            Err(e @ CollaboratorError::NotConfigured { .. }) => Err(e.into()),
            Err(e) => {
                warn!(message_id, error = %e, "Reply not delivered");
                let note = e.to_string();
                self.messages
                    .update(message_id, |r: &mut MessageRecord| {
                        r.send_error = Some(note.clone());
                        Ok::<_, DatabaseError>(())
                    })
                    .await?;
                Ok(false)
            }
        }
    }

    /// Mark the message failed with `error`. Best effort.
    async fn record_failure(&self, message_id: &str, error: &str) {
        let result = self
            .messages
            .update(message_id, |r: &mut MessageRecord| {
                if r.processing_status == ProcessingStatus::Pending {
                    r.transition(ProcessingStatus::Processing)?;
                }
                r.transition(ProcessingStatus::Failed)?;
                r.processing_error = Some(error.to_string());
                Ok::<_, PipelineError>(())
            })
            .await;
        if let Err(e) = result {
            warn!(message_id, error = %e, "Could not record processing failure");
        }
    }
}

/// Worth another attempt: the same input might succeed later.
fn is_retryable(err: &PipelineError) -> bool {
    match err {
        PipelineError::Collaborator(e) => e.is_transient(),
        PipelineError::Database(e) | PipelineError::Review(ReviewError::Database(e)) => {
            !matches!(e, DatabaseError::NotFound { .. } | DatabaseError::Serialization(_))
        }
        PipelineError::Queue(_) => true,
        PipelineError::MessageNotFound { .. }
        | PipelineError::InvalidTransition { .. }
        | PipelineError::Review(_) => false,
    }
}

/// Leave `run`'s current stage and enter `next`.
fn step(
    run: &mut WorkflowRun,
    next: WorkflowStage,
    progress: &ProgressReporter,
) -> Result<(), PipelineError> {
    progress.report(run.stage().progress());
    run.advance(next)
}

/// Categorization persisted by an earlier attempt, if any.
fn persisted_categorization(record: &MessageRecord) -> Option<CategorizationResult> {
    Some(CategorizationResult {
        category: record.category?,
        confidence: record.confidence?,
        sentiment: record.sentiment.unwrap_or_default(),
        extracted_data: record.extracted_data.clone(),
        cost: Decimal::ZERO,
        tokens: 0,
    })
}

fn review_context(
    record: &MessageRecord,
    matches: &[MatchSummary],
    draft: Option<&DraftedResponse>,
) -> ReviewContext {
    ReviewContext {
        category: record.category,
        confidence: record.confidence,
        sentiment: record.sentiment,
        budget: record
            .extracted_data
            .as_ref()
            .and_then(|data| data.total_budget()),
        missing_fields: record
            .extracted_data
            .as_ref()
            .map(|data| data.missing_fields())
            .unwrap_or_default()
            .into_iter()
            .map(str::to_string)
            .collect(),
        suggested_subject: draft.map(|d| d.subject.clone()),
        suggested_reply: draft.map(|d| d.plain_text.clone()),
        matches: matches.to_vec(),
        notes: None,
    }
}

#[async_trait]
impl JobHandler for WorkflowOrchestrator {
    async fn handle(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<JobOutcome, JobFailure> {
        let message_id = job.payload.message_id.as_str();
        debug!(
            job_id = %job.id,
            message_id,
            tenant_id = %job.payload.tenant_id,
            attempt = job.attempt_number(),
            "Processing message"
        );

        let outcome = match self.process(message_id, progress).await {
            Ok(outcome) => outcome,
            Err(e) if is_retryable(&e) && !job.is_final_attempt() => {
                warn!(
                    job_id = %job.id,
                    message_id,
                    attempt = job.attempt_number(),
                    error = %e,
                    "Transient workflow failure, will retry"
                );
                return Err(JobFailure::new(e.to_string()));
            }
            Err(e) => {
                let error = e.to_string();
                error!(job_id = %job.id, message_id, error = %error, "Workflow failed");
                self.record_failure(message_id, &error).await;
                if is_retryable(&e) {
                    // Out of attempts: let the scheduler mark the job failed.
                    return Err(JobFailure::new(error));
                }
                WorkflowOutcome::Failed { error }
            }
        };

        progress.report(100);
        let mut result = JobOutcome::new(outcome.label());
        if let Some(detail) = outcome.detail() {
            result = result.with_detail(detail);
        }
        Ok(result)
    }
}

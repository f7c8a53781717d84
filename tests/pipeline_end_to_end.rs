//! End-to-end tests: scheduler + orchestrator + matching + review.
//!
//! Every collaborator is a hand-written stub that records its calls, so the
//! tests can assert which stages ran. Storage is an in-memory libSQL database.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::timeout;
use uuid::Uuid;

use travel_inbox::config::{PipelineConfig, ReviewConfig};
use travel_inbox::error::{CollaboratorError, DatabaseError};
use travel_inbox::inventory::{DbInventory, InventoryItem, InventorySource, SourceType};
use travel_inbox::matching::MatchingEngine;
use travel_inbox::pipeline::types::{
    Budget, CategorizationResult, Category, ContactInfo, DateRange, DeliveryReceipt,
    DraftContext, DraftKind, DraftedResponse, ExtractedData, InboundMessage,
    ItineraryEvaluation, ItineraryWorkflow, MessageRecord, OutboundMail, ProcessingStatus,
    Sentiment, SupplierOffer, Travelers, VisionResult, WorkflowAction,
};
use travel_inbox::pipeline::{
    Categorizer, Collaborators, ItineraryMatcher, MailTransport, ResponseDrafter,
    UnconfiguredMail, VisionExtractor, WorkflowOrchestrator, intake_pending, recover_stranded,
};
use travel_inbox::queue::{
    BackoffPolicy, InProcessBackend, JobOptions, JobResolution, JobScheduler, JobStatus,
    QueueBackend, QueueEvent, QueueMode, SyncBackend,
};
use travel_inbox::review::{ReviewEscalator, ReviewItem, ReviewPriority, ReviewReason};
use travel_inbox::store::{Database, LibSqlBackend, MessageStore};

/// Maximum time any job is allowed to take before we consider it hung.
const WAIT: Duration = Duration::from_secs(5);

// ── Stub collaborators ──────────────────────────────────────────────

/// Plays back scripted results, then repeats `fallback`.
struct StubCategorizer {
    script: StdMutex<VecDeque<Result<CategorizationResult, CollaboratorError>>>,
    fallback: Result<CategorizationResult, CollaboratorError>,
    calls: AtomicUsize,
}

impl StubCategorizer {
    fn always(result: Result<CategorizationResult, CollaboratorError>) -> Self {
        Self::scripted(Vec::new(), result)
    }

    fn scripted(
        script: Vec<Result<CategorizationResult, CollaboratorError>>,
        fallback: Result<CategorizationResult, CollaboratorError>,
    ) -> Self {
        Self {
            script: StdMutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Categorizer for StubCategorizer {
    async fn categorize_and_extract(
        &self,
        _message: &InboundMessage,
    ) -> Result<CategorizationResult, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Default)]
struct StubVision {
    calls: AtomicUsize,
}

#[async_trait]
impl VisionExtractor for StubVision {
    async fn extract_contacts(
        &self,
        _message: &InboundMessage,
    ) -> Result<VisionResult, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(VisionResult {
            success: true,
            contacts: vec![ContactInfo {
                phone: Some("+30 210 555 0100".into()),
                ..ContactInfo::default()
            }],
            cost: dec!(0.005),
            tokens: 40,
        })
    }
}

struct StubItinerary {
    workflow: Option<ItineraryWorkflow>,
    calls: AtomicUsize,
}

#[async_trait]
impl ItineraryMatcher for StubItinerary {
    async fn evaluate(
        &self,
        _extracted: &ExtractedData,
        _tenant_id: &str,
    ) -> Result<ItineraryEvaluation, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ItineraryEvaluation {
            workflow: self.workflow.clone(),
            ..ItineraryEvaluation::default()
        })
    }
}

#[derive(Default)]
struct StubDrafter {
    calls: AtomicUsize,
}

#[async_trait]
impl ResponseDrafter for StubDrafter {
    async fn draft(
        &self,
        kind: DraftKind,
        _context: &DraftContext<'_>,
    ) -> Result<DraftedResponse, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DraftedResponse {
            kind,
            subject: "Re: Holiday in Crete".into(),
            body: "<p>stub reply</p>".into(),
            plain_text: "stub reply".into(),
            cost: dec!(0.02),
        })
    }
}

/// Records delivered mail. With `failure` set every send is refused.
#[derive(Default)]
struct StubMail {
    sent: StdMutex<Vec<OutboundMail>>,
    failure: Option<CollaboratorError>,
}

#[async_trait]
impl MailTransport for StubMail {
    async fn send(&self, mail: &OutboundMail) -> Result<DeliveryReceipt, CollaboratorError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail.clone());
        Ok(DeliveryReceipt {
            delivery_id: format!("<{}@mail.test>", sent.len()),
        })
    }
}

/// Counts how often matching gathered inventory.
struct CountingInventory {
    inner: DbInventory,
    gathers: AtomicUsize,
}

#[async_trait]
impl InventorySource for CountingInventory {
    async fn verified_offers(&self, tenant_id: &str) -> Result<Vec<InventoryItem>, DatabaseError> {
        self.gathers.fetch_add(1, Ordering::SeqCst);
        self.inner.verified_offers(tenant_id).await
    }

    async fn published_itineraries(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<InventoryItem>, DatabaseError> {
        self.inner.published_itineraries(tenant_id).await
    }

    async fn record_supplier_offers(
        &self,
        tenant_id: &str,
        supplier: &str,
        offers: &[SupplierOffer],
    ) -> Result<usize, DatabaseError> {
        self.inner
            .record_supplier_offers(tenant_id, supplier, offers)
            .await
    }
}

/// Loses the first save that settles a message after its reply went out,
/// the way a dropped connection would.
struct LossyDatabase {
    inner: LibSqlBackend,
    armed: AtomicBool,
}

#[async_trait]
impl Database for LossyDatabase {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
        self.inner.insert_message(record).await
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        self.inner.get_message(id).await
    }

    async fn save_message(&self, record: &MessageRecord) -> Result<i64, DatabaseError> {
        let settling = record.response_sent_at.is_some()
            && record.processing_status == ProcessingStatus::Completed;
        if settling && self.armed.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Query("connection reset".into()));
        }
        self.inner.save_message(record).await
    }

    async fn list_messages_by_status(
        &self,
        status: ProcessingStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        self.inner.list_messages_by_status(status, limit).await
    }

    async fn insert_review_item(&self, item: &ReviewItem) -> Result<(), DatabaseError> {
        self.inner.insert_review_item(item).await
    }

    async fn get_review_item(&self, id: Uuid) -> Result<Option<ReviewItem>, DatabaseError> {
        self.inner.get_review_item(id).await
    }

    async fn open_review_for_message(
        &self,
        message_id: &str,
    ) -> Result<Option<ReviewItem>, DatabaseError> {
        self.inner.open_review_for_message(message_id).await
    }

    async fn update_review_item(&self, item: &ReviewItem) -> Result<(), DatabaseError> {
        self.inner.update_review_item(item).await
    }

    async fn list_open_reviews(&self, tenant_id: &str) -> Result<Vec<ReviewItem>, DatabaseError> {
        self.inner.list_open_reviews(tenant_id).await
    }

    async fn list_reviews_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ReviewItem>, DatabaseError> {
        self.inner.list_reviews_for_message(message_id).await
    }

    async fn insert_inventory_item(&self, item: &InventoryItem) -> Result<(), DatabaseError> {
        self.inner.insert_inventory_item(item).await
    }

    async fn list_inventory(
        &self,
        tenant_id: &str,
        source_type: SourceType,
    ) -> Result<Vec<InventoryItem>, DatabaseError> {
        self.inner.list_inventory(tenant_id, source_type).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    messages: Arc<MessageStore>,
    inventory: Arc<CountingInventory>,
    reviews: Arc<ReviewEscalator>,
    categorizer: Arc<StubCategorizer>,
    vision: Arc<StubVision>,
    itinerary: Arc<StubItinerary>,
    drafter: Arc<StubDrafter>,
    mail: Arc<StubMail>,
    scheduler: Arc<JobScheduler>,
}

struct Options {
    backend: Arc<dyn QueueBackend>,
    workflow: Option<ItineraryWorkflow>,
    mail_configured: bool,
    mail_failure: Option<CollaboratorError>,
    lose_settling_save: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend: Arc::new(InProcessBackend::new(Duration::from_millis(20))),
            workflow: Some(ItineraryWorkflow {
                action: WorkflowAction::SendGoodMatches,
                reason: None,
                matches: Vec::new(),
            }),
            mail_configured: true,
            mail_failure: None,
            lose_settling_save: false,
        }
    }
}

impl Harness {
    async fn new(categorizer: StubCategorizer) -> Self {
        Self::with(categorizer, Options::default()).await
    }

    async fn with(categorizer: StubCategorizer, options: Options) -> Self {
        let db: Arc<dyn Database> = Arc::new(LossyDatabase {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            armed: AtomicBool::new(options.lose_settling_save),
        });
        let messages = Arc::new(MessageStore::new(Arc::clone(&db)));
        let inventory = Arc::new(CountingInventory {
            inner: DbInventory::new(Arc::clone(&db)),
            gathers: AtomicUsize::new(0),
        });
        let reviews = Arc::new(ReviewEscalator::new(
            Arc::clone(&db),
            Arc::clone(&messages),
            ReviewConfig::default(),
        ));

        let categorizer = Arc::new(categorizer);
        let vision = Arc::new(StubVision::default());
        let itinerary = Arc::new(StubItinerary {
            workflow: options.workflow,
            calls: AtomicUsize::new(0),
        });
        let drafter = Arc::new(StubDrafter::default());
        let mail = Arc::new(StubMail {
            failure: options.mail_failure,
            ..StubMail::default()
        });
        let transport: Arc<dyn MailTransport> = if options.mail_configured {
            mail.clone()
        } else {
            Arc::new(UnconfiguredMail)
        };

        let collaborators = Collaborators {
            categorizer: categorizer.clone(),
            vision: vision.clone(),
            itinerary: itinerary.clone(),
            drafter: drafter.clone(),
            mail: transport,
        };
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::clone(&messages),
            collaborators,
            Arc::new(MatchingEngine::new(inventory.clone())),
            inventory.clone(),
            Arc::clone(&reviews),
            PipelineConfig::default(),
        ));

        let defaults = JobOptions::default()
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10)));
        let scheduler = Arc::new(JobScheduler::new(options.backend, defaults, 2));
        scheduler.register_handler(orchestrator).await.unwrap();

        Self {
            messages,
            inventory,
            reviews,
            categorizer,
            vision,
            itinerary,
            drafter,
            mail,
            scheduler,
        }
    }

    async fn publish(&self, item: InventoryItem) {
        self.inventory.inner.publish_itinerary(&item).await.unwrap();
    }

    async fn receive(&self, id: &str) -> MessageRecord {
        self.messages.insert(inbound(id)).await.unwrap()
    }

    /// Enqueue `id` directly and wait for the job to settle.
    async fn run(&self, id: &str) -> JobResolution {
        let handle = self
            .scheduler
            .add_message(id, "acme", Default::default())
            .await
            .unwrap();
        timeout(WAIT, handle.wait()).await.unwrap().unwrap()
    }

    async fn record(&self, id: &str) -> MessageRecord {
        self.messages.require(id).await.unwrap()
    }

    fn sent(&self) -> Vec<OutboundMail> {
        self.mail.sent.lock().unwrap().clone()
    }
}

fn inbound(id: &str) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        tenant_id: "acme".to_string(),
        sender: "jane@example.com".to_string(),
        sender_name: Some("Jane Doe".to_string()),
        subject: Some("Holiday in Crete".to_string()),
        content: "Two of us, first week of June, around 4000 EUR.".to_string(),
        received_at: Utc::now(),
        attachments: Vec::new(),
        is_reply: false,
        customer_id: None,
        priority_hint: None,
    }
}

fn request(budget: Decimal) -> ExtractedData {
    ExtractedData {
        contact: ContactInfo {
            name: Some("Jane Doe".into()),
            email: Some("jane@example.com".into()),
            ..ContactInfo::default()
        },
        destination: Some("Crete".into()),
        travel_dates: Some(DateRange {
            start: NaiveDate::from_ymd_opt(2027, 6, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2027, 6, 8),
        }),
        budget: Some(Budget {
            amount: budget,
            currency: Some("EUR".into()),
            per_person: false,
        }),
        travelers: Some(Travelers {
            adults: 2,
            children: 0,
        }),
        ..ExtractedData::default()
    }
}

fn categorized(
    category: Category,
    confidence: u8,
    extracted: Option<ExtractedData>,
) -> Result<CategorizationResult, CollaboratorError> {
    Ok(CategorizationResult {
        category,
        confidence,
        sentiment: Sentiment::Positive,
        extracted_data: extracted,
        cost: dec!(0.01),
        tokens: 120,
    })
}

fn customer(budget: Decimal) -> Result<CategorizationResult, CollaboratorError> {
    categorized(Category::Customer, 92, Some(request(budget)))
}

fn timeout_error() -> CollaboratorError {
    CollaboratorError::Timeout {
        service: "categorizer".into(),
        after: Duration::from_secs(60),
    }
}

fn cretan_villas() -> InventoryItem {
    InventoryItem {
        price: Some(dec!(4100)),
        year_round: true,
        ..InventoryItem::catalog("acme", "Cretan Villas", "Crete")
    }
}

fn completed_label(resolution: &JobResolution) -> &str {
    match resolution {
        JobResolution::Completed(outcome) => &outcome.label,
        JobResolution::Failed { error, .. } => panic!("job failed: {error}"),
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn spam_completes_without_matching_or_reply() {
    let h = Harness::new(StubCategorizer::always(categorized(Category::Spam, 95, None))).await;
    h.receive("m-spam").await;

    let resolution = h.run("m-spam").await;
    match &resolution {
        JobResolution::Completed(outcome) => {
            assert_eq!(outcome.label, "closed");
            assert_eq!(outcome.detail.as_deref(), Some("SPAM"));
        }
        other => panic!("unexpected resolution: {other:?}"),
    }

    let record = h.record("m-spam").await;
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
    assert_eq!(record.category, Some(Category::Spam));
    assert!(record.matching_results.is_empty());
    assert!(record.response.is_none());
    assert_eq!(h.inventory.gathers.load(Ordering::SeqCst), 0);
    assert_eq!(h.itinerary.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.drafter.calls.load(Ordering::SeqCst), 0);
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn low_confidence_goes_to_review_before_matching() {
    let h = Harness::new(StubCategorizer::always(categorized(
        Category::Customer,
        65,
        Some(request(dec!(4000))),
    )))
    .await;
    h.publish(cretan_villas()).await;
    h.receive("m-unsure").await;

    let resolution = h.run("m-unsure").await;
    assert_eq!(completed_label(&resolution), "review");

    let record = h.record("m-unsure").await;
    assert!(record.requires_review);
    assert_eq!(record.review_reason, Some(ReviewReason::LowConfidence));
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
    assert!(record.matching_results.is_empty());
    assert_eq!(h.inventory.gathers.load(Ordering::SeqCst), 0);
    assert!(h.sent().is_empty());

    let item = h.reviews.open_for_message("m-unsure").await.unwrap().unwrap();
    assert_eq!(item.reason, ReviewReason::LowConfidence);
    assert_eq!(item.priority, ReviewPriority::Normal);
    assert_eq!(item.context.confidence, Some(65));
}

#[tokio::test]
async fn customer_request_is_matched_and_answered() {
    let h = Harness::new(StubCategorizer::always(customer(dec!(4000)))).await;
    h.publish(cretan_villas()).await;
    h.publish(InventoryItem {
        price: Some(dec!(3000)),
        ..InventoryItem::catalog("acme", "Alpine Lodge", "Zermatt")
    })
    .await;
    h.receive("m-happy").await;

    let mut events = h.scheduler.subscribe();
    let handle = h
        .scheduler
        .add_message("m-happy", "acme", Default::default())
        .await
        .unwrap();
    let job_id = handle.id;
    let resolution = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    match &resolution {
        JobResolution::Completed(outcome) => {
            assert_eq!(outcome.label, "replied");
            assert_eq!(outcome.detail.as_deref(), Some("delivered=true"));
        }
        other => panic!("unexpected resolution: {other:?}"),
    }

    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::Progress { job_id: id, percent } = event {
            if id == job_id {
                progress.push(percent);
            }
        }
    }
    assert_eq!(progress, vec![10, 50, 60, 70, 75, 80, 90, 100]);

    let record = h.record("m-happy").await;
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
    assert!(!record.requires_review);
    assert_eq!(record.matching_results.len(), 1);
    assert_eq!(record.matching_results[0].title, "Cretan Villas");
    assert!(record.response_generated);
    assert_eq!(record.delivery_id.as_deref(), Some("<1@mail.test>"));
    assert!(record.response_sent_at.is_some());
    // Templated reply: only the categorization was paid for.
    assert_eq!(record.cost, dec!(0.01));
    assert_eq!(record.tokens_used, 120);
    assert_eq!(h.drafter.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.vision.calls.load(Ordering::SeqCst), 0);

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "jane@example.com");
    assert_eq!(sent[0].subject, "Re: Holiday in Crete");
    assert!(sent[0].text_body.contains("Cretan Villas"));
    assert!(!sent[0].text_body.contains("Alpine Lodge"));
}

#[tokio::test]
async fn no_itinerary_signal_uses_the_drafter() {
    let h = Harness::with(
        StubCategorizer::always(customer(dec!(4000))),
        Options {
            workflow: None,
            ..Options::default()
        },
    )
    .await;
    h.receive("m-fallback").await;

    let resolution = h.run("m-fallback").await;
    assert_eq!(completed_label(&resolution), "replied");

    assert_eq!(h.drafter.calls.load(Ordering::SeqCst), 1);
    let record = h.record("m-fallback").await;
    assert_eq!(record.response.map(|r| r.kind), Some(DraftKind::Fallback));
    assert_eq!(record.cost, dec!(0.03));
    assert_eq!(h.sent()[0].text_body, "stub reply");
}

#[tokio::test]
async fn image_contacts_are_merged() {
    let mut request = request(dec!(4000));
    request.contact.phone = None;
    let h = Harness::new(StubCategorizer::always(categorized(
        Category::Customer,
        90,
        Some(request),
    )))
    .await;
    let mut message = inbound("m-card");
    message.attachments.push(travel_inbox::pipeline::types::Attachment {
        filename: "card.png".into(),
        content_type: "image/png".into(),
        size_bytes: 2048,
        url: None,
    });
    h.messages.insert(message).await.unwrap();

    let resolution = h.run("m-card").await;
    assert_eq!(completed_label(&resolution), "replied");

    assert_eq!(h.vision.calls.load(Ordering::SeqCst), 1);
    let record = h.record("m-card").await;
    let contact = record.extracted_data.unwrap().contact;
    assert_eq!(contact.phone.as_deref(), Some("+30 210 555 0100"));
    assert_eq!(contact.name.as_deref(), Some("Jane Doe"));
    assert_eq!(record.tokens_used, 160);
}

#[tokio::test]
async fn high_value_request_is_held_for_approval() {
    let h = Harness::new(StubCategorizer::always(customer(dec!(25000)))).await;
    h.publish(cretan_villas()).await;
    h.receive("m-vip").await;

    let resolution = h.run("m-vip").await;
    assert_eq!(completed_label(&resolution), "review");
    assert!(h.sent().is_empty());

    let record = h.record("m-vip").await;
    assert!(record.requires_review);
    assert_eq!(record.review_reason, Some(ReviewReason::HighValue));
    assert!(record.response_generated);
    assert!(record.response_sent_at.is_none());

    let item = h.reviews.open_for_message("m-vip").await.unwrap().unwrap();
    assert_eq!(item.priority, ReviewPriority::High);
    assert_eq!(item.context.budget, Some(dec!(25000)));
    assert!(item.context.suggested_reply.is_some());
    assert_eq!(item.context.matches.len(), 1);
}

#[tokio::test]
async fn ambiguous_request_goes_to_review() {
    let vague = ExtractedData {
        destination: Some("somewhere warm".into()),
        ..ExtractedData::default()
    };
    let h = Harness::new(StubCategorizer::always(categorized(
        Category::Customer,
        88,
        Some(vague),
    )))
    .await;
    h.receive("m-vague").await;

    let resolution = h.run("m-vague").await;
    assert_eq!(completed_label(&resolution), "review");

    let item = h.reviews.open_for_message("m-vague").await.unwrap().unwrap();
    assert_eq!(item.reason, ReviewReason::AmbiguousRequest);
    assert!(item.context.missing_fields.contains(&"budget".to_string()));
    assert_eq!(h.inventory.gathers.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn follow_up_is_linked_to_existing_quote() {
    let mut follow_up = request(dec!(4000));
    follow_up.existing_quote_ref = Some("Q-1001".into());
    let h = Harness::new(StubCategorizer::always(categorized(
        Category::Customer,
        90,
        Some(follow_up),
    )))
    .await;
    h.receive("m-quote").await;

    let resolution = h.run("m-quote").await;
    match &resolution {
        JobResolution::Completed(outcome) => {
            assert_eq!(outcome.label, "linked_to_quote");
            assert_eq!(outcome.detail.as_deref(), Some("Q-1001"));
        }
        other => panic!("unexpected resolution: {other:?}"),
    }

    let record = h.record("m-quote").await;
    assert_eq!(
        record.processing_status,
        ProcessingStatus::LinkedToExistingQuote
    );
    assert_eq!(record.quote_id.as_deref(), Some("Q-1001"));
}

#[tokio::test]
async fn supplier_offers_are_cached() {
    let offer = |title: &str| SupplierOffer {
        title: title.into(),
        destination: "Crete".into(),
        country: Some("Greece".into()),
        price: Some(dec!(3800)),
        valid_from: None,
        valid_to: None,
        min_pax: Some(2),
        max_pax: Some(4),
        package_type: None,
        meal_plan: None,
        highlights: Vec::new(),
    };
    let extracted = ExtractedData {
        supplier_offers: vec![offer("Elounda Retreat"), offer("Chania Old Town")],
        ..ExtractedData::default()
    };
    let h = Harness::new(StubCategorizer::always(categorized(
        Category::Supplier,
        97,
        Some(extracted),
    )))
    .await;
    h.receive("m-supplier").await;

    let resolution = h.run("m-supplier").await;
    match &resolution {
        JobResolution::Completed(outcome) => {
            assert_eq!(outcome.label, "offers_recorded");
            assert_eq!(outcome.detail.as_deref(), Some("2 offer(s)"));
        }
        other => panic!("unexpected resolution: {other:?}"),
    }

    let cached = h.inventory.inner.verified_offers("acme").await.unwrap();
    assert_eq!(cached.len(), 2);
    assert_eq!(cached[0].supplier.as_deref(), Some("Jane Doe"));
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let h = Harness::new(StubCategorizer::scripted(
        vec![Err(timeout_error())],
        customer(dec!(4000)),
    ))
    .await;
    h.receive("m-flaky").await;

    let handle = h
        .scheduler
        .add_message("m-flaky", "acme", Default::default())
        .await
        .unwrap();
    let job_id = handle.id;
    let resolution = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(completed_label(&resolution), "replied");

    assert_eq!(h.categorizer.calls.load(Ordering::SeqCst), 2);
    let job = h.scheduler.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(h.record("m-flaky").await.processing_status, ProcessingStatus::Completed);
}

#[tokio::test]
async fn exhausted_retries_fail_job_and_message() {
    let h = Harness::new(StubCategorizer::always(Err(timeout_error()))).await;
    h.receive("m-down").await;

    let resolution = h.run("m-down").await;
    assert!(matches!(resolution, JobResolution::Failed { attempts: 3, .. }));
    assert_eq!(h.categorizer.calls.load(Ordering::SeqCst), 3);

    let record = h.record("m-down").await;
    assert_eq!(record.processing_status, ProcessingStatus::Failed);
    assert!(record.processing_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn permanent_failure_is_recorded_without_retry() {
    let rejected = CollaboratorError::Rejected {
        service: "categorizer".into(),
        reason: "payload too large".into(),
    };
    let h = Harness::new(StubCategorizer::scripted(
        vec![Err(rejected)],
        customer(dec!(4000)),
    ))
    .await;
    h.receive("m-bad").await;

    let resolution = h.run("m-bad").await;
    assert_eq!(completed_label(&resolution), "failed");
    assert_eq!(h.categorizer.calls.load(Ordering::SeqCst), 1);

    let record = h.record("m-bad").await;
    assert_eq!(record.processing_status, ProcessingStatus::Failed);
    assert!(record.processing_error.unwrap().contains("payload too large"));

    // An operator resets it and the next run succeeds.
    let reset = h.messages.reset_for_retry("m-bad").await.unwrap();
    assert_eq!(reset.processing_status, ProcessingStatus::Pending);
    assert!(reset.processing_error.is_none());

    let resolution = h.run("m-bad").await;
    assert_eq!(completed_label(&resolution), "replied");
}

#[tokio::test]
async fn missing_mail_transport_fails_the_message() {
    let h = Harness::with(
        StubCategorizer::always(customer(dec!(4000))),
        Options {
            mail_configured: false,
            ..Options::default()
        },
    )
    .await;
    h.receive("m-nomail").await;

    let resolution = h.run("m-nomail").await;
    assert_eq!(completed_label(&resolution), "failed");

    let record = h.record("m-nomail").await;
    assert_eq!(record.processing_status, ProcessingStatus::Failed);
    assert!(record.response_generated);
    assert!(record.processing_error.unwrap().contains("not configured"));
}

#[tokio::test]
async fn undelivered_reply_is_noted_and_workflow_completes() {
    let h = Harness::with(
        StubCategorizer::always(customer(dec!(4000))),
        Options {
            mail_failure: Some(CollaboratorError::Rejected {
                service: "smtp".into(),
                reason: "mailbox unavailable".into(),
            }),
            ..Options::default()
        },
    )
    .await;
    h.publish(cretan_villas()).await;
    h.receive("m-bounce").await;

    let resolution = h.run("m-bounce").await;
    match &resolution {
        JobResolution::Completed(outcome) => {
            assert_eq!(outcome.label, "replied");
            assert_eq!(outcome.detail.as_deref(), Some("delivered=false"));
        }
        other => panic!("unexpected resolution: {other:?}"),
    }

    let record = h.record("m-bounce").await;
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
    assert!(record.send_error.unwrap().contains("mailbox unavailable"));
    assert!(record.processing_error.is_none());
    assert!(record.response_generated);
    assert!(record.response.unwrap().plain_text.contains("Cretan Villas"));
    assert_eq!(record.cost, dec!(0.01));
    assert!(record.response_sent_at.is_none());
    assert!(record.delivery_id.is_none());
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn retry_after_delivery_does_not_resend() {
    let h = Harness::with(
        StubCategorizer::always(customer(dec!(4000))),
        Options {
            lose_settling_save: true,
            ..Options::default()
        },
    )
    .await;
    h.publish(cretan_villas()).await;
    h.receive("m-once").await;

    let handle = h
        .scheduler
        .add_message("m-once", "acme", Default::default())
        .await
        .unwrap();
    let job_id = handle.id;
    let resolution = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(completed_label(&resolution), "replied");

    let job = h.scheduler.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(h.sent().len(), 1);

    let record = h.record("m-once").await;
    assert_eq!(record.processing_status, ProcessingStatus::Completed);
    assert_eq!(record.delivery_id.as_deref(), Some("<1@mail.test>"));
    assert_eq!(record.cost, dec!(0.01));
}

#[tokio::test]
async fn stranded_messages_are_picked_up_after_restart() {
    let h = Harness::new(StubCategorizer::always(categorized(Category::Spam, 95, None))).await;
    h.receive("m-lost").await;
    // Claimed by a worker whose in-process queue died with it.
    h.messages
        .update("m-lost", |r: &mut MessageRecord| {
            r.transition(ProcessingStatus::Processing)
        })
        .await
        .unwrap();
    assert_eq!(intake_pending(&h.messages, &h.scheduler).await.unwrap(), 0);

    let released = recover_stranded(&h.messages, QueueMode::Durable, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(released, 0);
    let released = recover_stranded(&h.messages, QueueMode::InProcess, Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(released, 0);

    let released = recover_stranded(&h.messages, QueueMode::InProcess, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(released, 1);
    assert_eq!(h.record("m-lost").await.processing_status, ProcessingStatus::Pending);

    let mut events = h.scheduler.subscribe();
    assert_eq!(intake_pending(&h.messages, &h.scheduler).await.unwrap(), 1);
    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let QueueEvent::Completed { .. } = event {
            break;
        }
    }
    assert_eq!(h.record("m-lost").await.processing_status, ProcessingStatus::Completed);
}

#[tokio::test]
async fn manually_answered_message_is_skipped() {
    let h = Harness::new(StubCategorizer::always(customer(dec!(4000)))).await;
    h.receive("m-human").await;
    h.messages.mark_manually_answered("m-human").await.unwrap();

    let resolution = h.run("m-human").await;
    assert_eq!(completed_label(&resolution), "skipped");
    assert_eq!(h.categorizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.record("m-human").await.processing_status, ProcessingStatus::Skipped);
}

#[tokio::test]
async fn sync_backend_finishes_inside_add() {
    let h = Harness::with(
        StubCategorizer::always(customer(dec!(4000))),
        Options {
            backend: Arc::new(SyncBackend::new()),
            ..Options::default()
        },
    )
    .await;
    h.publish(cretan_villas()).await;
    h.receive("m-sync").await;

    let handle = h
        .scheduler
        .add_message("m-sync", "acme", Default::default())
        .await
        .unwrap();

    // Already settled before anyone waits.
    assert_eq!(h.record("m-sync").await.processing_status, ProcessingStatus::Completed);
    assert_eq!(h.sent().len(), 1);

    let resolution = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(completed_label(&resolution), "replied");
}

#[tokio::test]
async fn intake_enqueues_pending_messages_once() {
    let h = Harness::new(StubCategorizer::always(categorized(Category::Spam, 95, None))).await;
    h.receive("m-1").await;
    h.receive("m-2").await;
    h.receive("m-dup").await;
    h.messages
        .update("m-dup", |r: &mut MessageRecord| {
            r.duplicate_of = Some("m-1".into());
            Ok::<_, DatabaseError>(())
        })
        .await
        .unwrap();

    let mut events = h.scheduler.subscribe();
    let enqueued = intake_pending(&h.messages, &h.scheduler).await.unwrap();
    assert_eq!(enqueued, 2);

    let mut completed = 0;
    while completed < 2 {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let QueueEvent::Completed { .. } = event {
            completed += 1;
        }
    }

    assert_eq!(h.record("m-1").await.processing_status, ProcessingStatus::Completed);
    assert_eq!(h.record("m-2").await.processing_status, ProcessingStatus::Completed);
    assert_eq!(
        h.record("m-dup").await.processing_status,
        ProcessingStatus::DuplicateDetected
    );
    assert_eq!(h.categorizer.calls.load(Ordering::SeqCst), 2);

    // Nothing left pending.
    assert_eq!(intake_pending(&h.messages, &h.scheduler).await.unwrap(), 0);
}

#[tokio::test]
async fn review_can_be_worked_after_the_workflow() {
    let h = Harness::new(StubCategorizer::always(customer(dec!(25000)))).await;
    h.receive("m-approve").await;
    h.run("m-approve").await;

    let item = h.reviews.open_for_message("m-approve").await.unwrap().unwrap();
    let item = h.reviews.assign(item.id, "maria").await.unwrap();
    let done = h
        .reviews
        .complete(
            item.id,
            "maria",
            travel_inbox::review::ReviewOutcome::Approved,
            Some("Sent with a small discount".into()),
        )
        .await
        .unwrap();
    assert!(done.completed_at.is_some());
    assert!(h.reviews.open_for_message("m-approve").await.unwrap().is_none());
    assert!(h.reviews.list_open("acme").await.unwrap().is_empty());

    // Quoting picks it up from here.
    let quoted = h
        .messages
        .mark_converted_to_quote("m-approve", "Q-2001")
        .await
        .unwrap();
    assert_eq!(quoted.processing_status, ProcessingStatus::ConvertedToQuote);
}

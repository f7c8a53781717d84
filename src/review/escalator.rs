//! `ReviewEscalator`: creates review items and walks them through their lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    CustomerValue, ReviewActionKind, ReviewContext, ReviewItem, ReviewOutcome, ReviewPriority,
    ReviewReason, ReviewStatus,
};
use crate::config::ReviewConfig;
use crate::error::{DatabaseError, ReviewError};
use crate::pipeline::types::MessageRecord;
use crate::queue::JobPriority;
use crate::store::{Database, MessageStore};

pub struct ReviewEscalator {
    db: Arc<dyn Database>,
    messages: Arc<MessageStore>,
    config: ReviewConfig,
    /// Serializes read-modify-write of review items.
    write_lock: Mutex<()>,
}

impl ReviewEscalator {
    pub fn new(db: Arc<dyn Database>, messages: Arc<MessageStore>, config: ReviewConfig) -> Self {
        Self {
            db,
            messages,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Flag the message for review and open an item for it.
    ///
    /// If the message already has an open item, that item is returned
    /// unchanged; a message never has two open items.
    pub async fn send_to_review(
        &self,
        message_id: &str,
        reason: ReviewReason,
        context: ReviewContext,
    ) -> Result<ReviewItem, ReviewError> {
        let record = self
            .messages
            .update(message_id, |record: &mut MessageRecord| {
                record.requires_review = true;
                record.review_reason = Some(reason);
                Ok::<_, DatabaseError>(())
            })
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => ReviewError::MessageNotFound {
                    message_id: message_id.to_string(),
                },
                other => ReviewError::Database(other),
            })?;

        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.db.open_review_for_message(message_id).await? {
            debug!(
                message_id,
                review_id = %existing.id,
                "Message already has an open review item"
            );
            return Ok(existing);
        }

        let priority = reason.priority(record.message.priority_hint.map(hinted_priority));
        let item = ReviewItem::new(
            record.tenant_id(),
            message_id,
            reason,
            priority,
            self.customer_value(&record),
            &self.config.sla,
            context,
            Utc::now(),
        );

        match self.db.insert_review_item(&item).await {
            Ok(()) => {}
            // Lost a race with another process; the unique index kept one open item.
            Err(DatabaseError::Constraint(_)) => {
                warn!(message_id, "Concurrent review item creation, using existing item");
                return self
                    .db
                    .open_review_for_message(message_id)
                    .await?
                    .ok_or_else(|| ReviewError::MessageNotFound {
                        message_id: message_id.to_string(),
                    });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            review_id = %item.id,
            message_id,
            tenant_id = %item.tenant_id,
            reason = %reason,
            priority = item.priority.as_str(),
            due_by = %item.due_by,
            "Message sent to review"
        );
        Ok(item)
    }

    /// `vip` above the budget threshold, `returning` for known customers, else `new`.
    pub fn customer_value(&self, record: &MessageRecord) -> CustomerValue {
        let budget = record
            .extracted_data
            .as_ref()
            .and_then(|data| data.total_budget());
        match budget {
            Some(budget) if budget > self.config.vip_budget_threshold => CustomerValue::Vip,
            _ if record.message.customer_id.is_some() => CustomerValue::Returning,
            _ => CustomerValue::New,
        }
    }

    /// Hand an item to a reviewer. Reassigning an item already in review
    /// only changes the assignee.
    pub async fn assign(&self, id: Uuid, reviewer: &str) -> Result<ReviewItem, ReviewError> {
        self.mutate(id, |item, now| {
            if item.status != ReviewStatus::InReview {
                ensure_transition(item, ReviewStatus::InReview, "assign")?;
                item.status = ReviewStatus::InReview;
            }
            item.assigned_to = Some(reviewer.to_string());
            item.record(ReviewActionKind::Assigned, reviewer, None, now);
            Ok(())
        })
        .await
    }

    /// Close an item as approved or modified.
    ///
    /// This only settles the review. A reply held back for approval (a
    /// high-value request) stays as the drafted response on the message and
    /// is sent by the operator, not by the workflow.
    pub async fn complete(
        &self,
        id: Uuid,
        actor: &str,
        outcome: ReviewOutcome,
        notes: Option<String>,
    ) -> Result<ReviewItem, ReviewError> {
        let item = self
            .mutate(id, |item, now| {
                let target = ReviewStatus::from(outcome);
                ensure_transition(item, target, "complete")?;
                item.status = target;
                item.completed_at = Some(now);
                item.record(ReviewActionKind::Completed, actor, notes.clone(), now);
                Ok(())
            })
            .await?;
        info!(review_id = %id, actor, status = %item.status, "Review completed");
        Ok(item)
    }

    /// Escalate to urgent. The deadline moves to the urgent target from now
    /// unless the current one is already sooner.
    pub async fn escalate(
        &self,
        id: Uuid,
        actor: &str,
        details: Option<String>,
    ) -> Result<ReviewItem, ReviewError> {
        let urgent_minutes = self.config.sla.target_minutes(ReviewPriority::Urgent);
        let item = self
            .mutate(id, |item, now| {
                ensure_transition(item, ReviewStatus::Escalated, "escalate")?;
                item.status = ReviewStatus::Escalated;
                item.priority = ReviewPriority::Urgent;
                item.sla_target_minutes = urgent_minutes;
                item.due_by = item
                    .due_by
                    .min(now + Duration::minutes(i64::from(urgent_minutes)));
                item.record(ReviewActionKind::Escalated, actor, details.clone(), now);
                Ok(())
            })
            .await?;
        warn!(review_id = %id, actor, due_by = %item.due_by, "Review escalated");
        Ok(item)
    }

    pub async fn get(&self, id: Uuid) -> Result<ReviewItem, ReviewError> {
        self.db
            .get_review_item(id)
            .await?
            .ok_or(ReviewError::NotFound { id })
    }

    pub async fn open_for_message(
        &self,
        message_id: &str,
    ) -> Result<Option<ReviewItem>, ReviewError> {
        Ok(self.db.open_review_for_message(message_id).await?)
    }

    /// Every item ever opened for a message, oldest first.
    pub async fn history(&self, message_id: &str) -> Result<Vec<ReviewItem>, ReviewError> {
        Ok(self.db.list_reviews_for_message(message_id).await?)
    }

    /// Open items, urgent first, then by due date.
    pub async fn list_open(&self, tenant_id: &str) -> Result<Vec<ReviewItem>, ReviewError> {
        Ok(self.db.list_open_reviews(tenant_id).await?)
    }

    /// Open items past their deadline and still waiting on a reviewer.
    pub async fn breached(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReviewItem>, ReviewError> {
        let breached: Vec<_> = self
            .list_open(tenant_id)
            .await?
            .into_iter()
            .filter(|item| item.sla_breached(now))
            .collect();
        if !breached.is_empty() {
            warn!(tenant_id, count = breached.len(), "Review SLA breached");
        }
        Ok(breached)
    }

    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<ReviewItem, ReviewError>
    where
        F: FnOnce(&mut ReviewItem, DateTime<Utc>) -> Result<(), ReviewError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut item = self.get(id).await?;
        f(&mut item, Utc::now())?;
        self.db.update_review_item(&item).await?;
        Ok(item)
    }
}

fn ensure_transition(
    item: &ReviewItem,
    target: ReviewStatus,
    action: &str,
) -> Result<(), ReviewError> {
    if item.status.can_transition_to(target) {
        Ok(())
    } else {
        Err(ReviewError::InvalidTransition {
            id: item.id,
            status: item.status.to_string(),
            action: action.to_string(),
        })
    }
}

fn hinted_priority(hint: JobPriority) -> ReviewPriority {
    match hint {
        JobPriority::Urgent => ReviewPriority::Urgent,
        JobPriority::High => ReviewPriority::High,
        JobPriority::Normal => ReviewPriority::Normal,
        JobPriority::Low => ReviewPriority::Low,
    }
}

//! Unified `Database` trait: single async interface for all persistence.
//!
//! Structured records are stored as JSON documents next to the handful of
//! columns that queries filter or sort on.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::inventory::{InventoryItem, SourceType};
use crate::pipeline::types::{MessageRecord, ProcessingStatus};
use crate::review::ReviewItem;

/// Backend-agnostic database trait covering messages, review items, and inventory.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a new message record. Fails with `Constraint` if the id exists.
    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError>;

    /// Save `record` if the stored version still equals `record.version`.
    ///
    /// Returns the new version. A stale version is `DatabaseError::Conflict`.
    async fn save_message(&self, record: &MessageRecord) -> Result<i64, DatabaseError>;

    /// Oldest first.
    async fn list_messages_by_status(
        &self,
        status: ProcessingStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    // ── Review items ────────────────────────────────────────────────

    /// Insert a review item. A second open item for the same message is a
    /// `Constraint` error.
    async fn insert_review_item(&self, item: &ReviewItem) -> Result<(), DatabaseError>;

    async fn get_review_item(&self, id: Uuid) -> Result<Option<ReviewItem>, DatabaseError>;

    async fn open_review_for_message(
        &self,
        message_id: &str,
    ) -> Result<Option<ReviewItem>, DatabaseError>;

    async fn update_review_item(&self, item: &ReviewItem) -> Result<(), DatabaseError>;

    /// Open items for a tenant, by priority then due date.
    async fn list_open_reviews(&self, tenant_id: &str) -> Result<Vec<ReviewItem>, DatabaseError>;

    /// Full review history of a message, oldest first.
    async fn list_reviews_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ReviewItem>, DatabaseError>;

    // ── Inventory ───────────────────────────────────────────────────

    async fn insert_inventory_item(&self, item: &InventoryItem) -> Result<(), DatabaseError>;

    /// Items of one source type for a tenant, in insertion order.
    async fn list_inventory(
        &self,
        tenant_id: &str,
        source_type: SourceType,
    ) -> Result<Vec<InventoryItem>, DatabaseError>;
}

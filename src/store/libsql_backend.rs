//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::inventory::{InventoryItem, SourceType};
use crate::pipeline::types::{MessageRecord, ProcessingStatus};
use crate::review::ReviewItem;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a query whose rows carry a JSON document in column 0.
    async fn query_docs<T: DeserializeOwned>(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut docs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let data: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
            docs.push(from_json(&data)?);
        }
        Ok(docs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(data: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(data).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a write failure, surfacing unique-index violations as `Constraint`.
fn write_err(op: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {message}"))
    } else {
        DatabaseError::Query(format!("{op}: {message}"))
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Decode a message row of `(data, version)`; the column is authoritative
/// for the version.
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let data: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("row_to_message: {e}")))?;
    let version: i64 = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("row_to_message: {e}")))?;
    let mut record: MessageRecord = from_json(&data)?;
    record.version = version;
    Ok(record)
}

// ── Database trait implementation ───────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO messages (id, tenant_id, status, data, version, received_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id(),
                    record.tenant_id(),
                    record.processing_status.as_str(),
                    to_json(record)?,
                    record.version,
                    timestamp(&record.message.received_at),
                    timestamp(&record.created_at),
                    timestamp(&record.updated_at),
                ],
            )
            .await
            .map_err(|e| write_err("insert_message", e))?;

        debug!(message_id = record.id(), tenant_id = record.tenant_id(), "Inserted message");
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT data, version FROM messages WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?
        {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_message(&self, record: &MessageRecord) -> Result<i64, DatabaseError> {
        let next = record.version + 1;
        let mut stored = record.clone();
        stored.version = next;

        let affected = self
            .conn()
            .execute(
                "UPDATE messages SET status = ?1, data = ?2, version = ?3, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    stored.processing_status.as_str(),
                    to_json(&stored)?,
                    next,
                    timestamp(&stored.updated_at),
                    record.id(),
                    record.version,
                ],
            )
            .await
            .map_err(|e| write_err("save_message", e))?;

        if affected == 0 {
            return Err(match self.get_message(record.id()).await? {
                Some(_) => DatabaseError::Conflict {
                    entity: "message".to_string(),
                    id: record.id().to_string(),
                    expected: record.version,
                },
                None => DatabaseError::NotFound {
                    entity: "message".to_string(),
                    id: record.id().to_string(),
                },
            });
        }
        Ok(next)
    }

    async fn list_messages_by_status(
        &self,
        status: ProcessingStatus,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT data, version FROM messages WHERE status = ?1
                 ORDER BY received_at ASC, rowid ASC LIMIT ?2",
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages_by_status: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages_by_status: {e}")))?
        {
            records.push(row_to_message(&row)?);
        }
        Ok(records)
    }

    // ── Review items ────────────────────────────────────────────────

    async fn insert_review_item(&self, item: &ReviewItem) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO review_items (id, tenant_id, message_id, status, priority_rank, due_by_ms, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    item.id.to_string(),
                    item.tenant_id.as_str(),
                    item.message_id.as_str(),
                    item.status.as_str(),
                    i64::from(item.priority.rank()),
                    item.due_by.timestamp_millis(),
                    to_json(item)?,
                    timestamp(&item.queued_at),
                    timestamp(&item.updated_at),
                ],
            )
            .await
            .map_err(|e| write_err("insert_review_item", e))?;
        Ok(())
    }

    async fn get_review_item(&self, id: Uuid) -> Result<Option<ReviewItem>, DatabaseError> {
        let mut items = self
            .query_docs(
                "get_review_item",
                "SELECT data FROM review_items WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok(items.pop())
    }

    async fn open_review_for_message(
        &self,
        message_id: &str,
    ) -> Result<Option<ReviewItem>, DatabaseError> {
        let mut items = self
            .query_docs(
                "open_review_for_message",
                "SELECT data FROM review_items
                 WHERE message_id = ?1 AND status IN ('pending', 'in_review', 'escalated')",
                params![message_id],
            )
            .await?;
        Ok(items.pop())
    }

    async fn update_review_item(&self, item: &ReviewItem) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE review_items SET status = ?1, priority_rank = ?2, due_by_ms = ?3, data = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    item.status.as_str(),
                    i64::from(item.priority.rank()),
                    item.due_by.timestamp_millis(),
                    to_json(item)?,
                    timestamp(&item.updated_at),
                    item.id.to_string(),
                ],
            )
            .await
            .map_err(|e| write_err("update_review_item", e))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "review_item".to_string(),
                id: item.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_open_reviews(&self, tenant_id: &str) -> Result<Vec<ReviewItem>, DatabaseError> {
        self.query_docs(
            "list_open_reviews",
            "SELECT data FROM review_items
             WHERE tenant_id = ?1 AND status IN ('pending', 'in_review', 'escalated')
             ORDER BY priority_rank ASC, due_by_ms ASC",
            params![tenant_id],
        )
        .await
    }

    async fn list_reviews_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ReviewItem>, DatabaseError> {
        self.query_docs(
            "list_reviews_for_message",
            "SELECT data FROM review_items WHERE message_id = ?1 ORDER BY rowid ASC",
            params![message_id],
        )
        .await
    }

    // ── Inventory ───────────────────────────────────────────────────

    async fn insert_inventory_item(&self, item: &InventoryItem) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO inventory_items (id, tenant_id, source_type, title, destination, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.id.as_str(),
                    item.tenant_id.as_str(),
                    item.source_type.as_str(),
                    item.title.as_str(),
                    item.destination.as_str(),
                    to_json(item)?,
                    timestamp(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| write_err("insert_inventory_item", e))?;
        Ok(())
    }

    async fn list_inventory(
        &self,
        tenant_id: &str,
        source_type: SourceType,
    ) -> Result<Vec<InventoryItem>, DatabaseError> {
        self.query_docs(
            "list_inventory",
            "SELECT data FROM inventory_items
             WHERE tenant_id = ?1 AND source_type = ?2 ORDER BY seq ASC",
            params![tenant_id, source_type.as_str()],
        )
        .await
    }
}

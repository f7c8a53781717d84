//! `JobScheduler`: the queue facade used by the rest of the crate.
//!
//! Callers never see which backend is active; they enqueue message ids and
//! read stats/events through this type.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use super::job::{Job, JobId, JobOptions, JobPayload, JobPriority};
use super::{JobHandle, JobHandler, QueueBackend, QueueEvent, QueueMode, QueueStats};
use crate::error::QueueError;

pub struct JobScheduler {
    backend: Arc<dyn QueueBackend>,
    defaults: JobOptions,
    concurrency: usize,
}

impl JobScheduler {
    pub fn new(backend: Arc<dyn QueueBackend>, defaults: JobOptions, concurrency: usize) -> Self {
        Self {
            backend,
            defaults,
            concurrency,
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.backend.mode()
    }

    /// Options used when the caller passes none.
    pub fn default_options(&self) -> JobOptions {
        self.defaults
    }

    /// Enqueue an arbitrary payload.
    pub async fn add(
        &self,
        payload: JobPayload,
        options: Option<JobOptions>,
    ) -> Result<JobHandle, QueueError> {
        self.backend
            .add(payload, options.unwrap_or(self.defaults))
            .await
    }

    /// Enqueue one message for processing at the given priority.
    pub async fn add_message(
        &self,
        message_id: &str,
        tenant_id: &str,
        priority: JobPriority,
    ) -> Result<JobHandle, QueueError> {
        self.backend
            .add(
                JobPayload::new(message_id, tenant_id),
                self.defaults.with_priority(priority),
            )
            .await
    }

    /// Register the handler with the configured concurrency.
    pub async fn register_handler(&self, handler: Arc<dyn JobHandler>) -> Result<(), QueueError> {
        self.register_handler_with(self.concurrency, handler).await
    }

    pub async fn register_handler_with(
        &self,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        self.backend.register_handler(concurrency, handler).await
    }

    pub async fn pause(&self) {
        self.backend.pause().await;
    }

    pub async fn resume(&self) {
        self.backend.resume().await;
    }

    pub async fn is_paused(&self) -> bool {
        self.backend.is_paused().await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    pub async fn clean(&self, grace: Duration) -> Result<usize, QueueError> {
        let removed = self.backend.clean(grace).await?;
        if removed > 0 {
            info!(removed, mode = %self.mode(), "Removed finished jobs");
        }
        Ok(removed)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.backend.job(id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.backend.subscribe()
    }

    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
        info!(mode = %self.mode(), "Job scheduler shut down");
    }
}

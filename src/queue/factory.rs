//! Backend selection, decided once at process start.
//!
//! Fallback chain: durable → in-process → sync.

use std::sync::Arc;

use tracing::{info, warn};

use super::{DurableBackend, InProcessBackend, QueueBackend, QueueMode, SyncBackend};
use crate::config::QueueConfig;

/// Pick a mode from configuration and whether the durable store answered.
///
/// Durable is only chosen when it was requested, configured, and reachable.
/// Zero concurrency means there is no worker pool to run, so jobs execute inline.
pub fn select_mode(config: &QueueConfig, durable_reachable: bool) -> QueueMode {
    match config.mode {
        QueueMode::Sync => QueueMode::Sync,
        _ if config.concurrency == 0 => QueueMode::Sync,
        QueueMode::Durable if config.durable_path.is_some() && durable_reachable => {
            QueueMode::Durable
        }
        QueueMode::Durable | QueueMode::InProcess => QueueMode::InProcess,
    }
}

/// Build the backend for this process.
pub async fn create_backend(config: &QueueConfig) -> Arc<dyn QueueBackend> {
    let mut durable = None;

    if config.mode == QueueMode::Durable && config.concurrency > 0 {
        match &config.durable_path {
            Some(path) => match DurableBackend::open(
                path,
                config.idle_poll_interval,
                config.stalled_after,
            )
            .await
            {
                Ok(backend) => durable = Some(backend),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Durable queue unreachable, falling back to in-process queue"
                ),
            },
            None => warn!("QUEUE_MODE=durable but QUEUE_DURABLE_URL is not set, using in-process queue"),
        }
    }

    let mode = select_mode(config, durable.is_some());
    info!(mode = %mode, concurrency = config.concurrency, "Job queue backend selected");

    match (mode, durable) {
        (QueueMode::Durable, Some(backend)) => Arc::new(backend),
        (QueueMode::Sync, _) => Arc::new(SyncBackend::new()),
        _ => Arc::new(InProcessBackend::new(config.idle_poll_interval)),
    }
}

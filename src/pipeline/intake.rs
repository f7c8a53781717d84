//! Background intake: turns stored `pending` messages into queued jobs.
//!
//! Timer-based loop:
//! 1. List `pending` messages, oldest first
//! 2. Duplicates are settled on the spot; everything else moves to `processing`
//! 3. One job per message, at the priority the message was tagged with

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, QueueError};
use crate::pipeline::types::{MessageRecord, ProcessingStatus};
use crate::queue::{JobScheduler, QueueMode};
use crate::store::MessageStore;

/// Messages picked up per tick.
const INTAKE_BATCH: usize = 100;

/// Spawn a background task that enqueues pending messages every `interval`.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_intake_loop(
    messages: Arc<MessageStore>,
    scheduler: Arc<JobScheduler>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), mode = %scheduler.mode(), "Intake started");

        let mut tick = tokio::time::interval(interval);

        // First tick fires immediately.
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Intake shutting down");
                return;
            }

            match intake_pending(&messages, &scheduler).await {
                Ok(0) => {}
                Ok(n) => debug!(enqueued = n, "Intake tick"),
                Err(e) => error!("Intake failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}

/// Release messages claimed by a previous run whose jobs are gone.
///
/// Only the durable queue keeps jobs across restarts and recovers them
/// itself; with any other backend a message left in `processing` for
/// `stalled_after` goes back to `pending` for the next intake tick.
pub async fn recover_stranded(
    messages: &MessageStore,
    mode: QueueMode,
    stalled_after: Duration,
) -> Result<usize, PipelineError> {
    if mode == QueueMode::Durable {
        return Ok(0);
    }
    let released = messages.requeue_stalled(stalled_after).await?;
    if released > 0 {
        info!(released, %mode, "Stranded messages returned to intake");
    }
    Ok(released)
}

/// Enqueue every pending message once. Returns how many jobs were added.
pub async fn intake_pending(
    messages: &MessageStore,
    scheduler: &JobScheduler,
) -> Result<usize, PipelineError> {
    let pending = messages
        .list_by_status(ProcessingStatus::Pending, INTAKE_BATCH)
        .await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut enqueued = 0;
    for record in pending {
        let message_id = record.id().to_string();

        if record.duplicate_of.is_some() {
            messages
                .update(&message_id, |r: &mut MessageRecord| {
                    r.transition(ProcessingStatus::DuplicateDetected)
                })
                .await?;
            info!(message_id, duplicate_of = ?record.duplicate_of, "Duplicate message, not enqueued");
            continue;
        }

        // Claim before enqueueing so the next tick does not see it again.
        messages
            .update(&message_id, |r: &mut MessageRecord| {
                r.transition(ProcessingStatus::Processing)
            })
            .await?;

        let priority = record.message.priority_hint.unwrap_or_default();
        match scheduler
            .add_message(&message_id, record.tenant_id(), priority)
            .await
        {
            Ok(handle) => {
                debug!(message_id, job_id = %handle.id, %priority, "Message enqueued");
                enqueued += 1;
            }
            Err(e) => {
                warn!(message_id, error = %e, "Could not enqueue message");
                mark_enqueue_failed(messages, &message_id, &e).await?;
            }
        }
    }
    Ok(enqueued)
}

async fn mark_enqueue_failed(
    messages: &MessageStore,
    message_id: &str,
    err: &QueueError,
) -> Result<(), PipelineError> {
    messages
        .update(message_id, |r: &mut MessageRecord| {
            r.transition(ProcessingStatus::Failed)?;
            r.processing_error = Some(format!("enqueue failed: {err}"));
            Ok::<_, PipelineError>(())
        })
        .await?;
    Ok(())
}

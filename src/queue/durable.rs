//! Durable backend: jobs live in a libSQL `jobs` table.
//!
//! Any number of worker processes can share one database file. A job is
//! claimed atomically with `UPDATE … RETURNING`, so two workers never run
//! the same attempt. Retry delays are stored as `run_at_ms` and survive
//! restarts.
//!
//! Pause/resume only affects this process's dispatcher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{BackoffPolicy, Job, JobId, JobOptions, JobPayload, JobPriority, JobStatus};
use super::worker::{DispatchContext, JobStore, spawn_dispatcher};
use super::{
    EVENT_CHANNEL_CAPACITY, JobHandle, JobHandler, QueueBackend, QueueEvent, QueueMode,
    QueueStats,
};
use crate::error::{DatabaseError, QueueError};

const JOB_COLUMNS: &str = "id, seq, message_id, tenant_id, priority, attempts, max_attempts, backoff, status, progress, last_error, created_ms, updated_ms, finished_ms";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL,
        message_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        priority INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        backoff TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'waiting',
        progress INTEGER NOT NULL DEFAULT 0,
        run_at_ms INTEGER NOT NULL,
        last_error TEXT,
        created_ms INTEGER NOT NULL,
        updated_ms INTEGER NOT NULL,
        finished_ms INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(status, priority, seq);
    CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(finished_ms);
"#;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds in `d`, clamped to what the `*_ms` columns can hold.
fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_integer(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> QueueError + '_ {
    move |e| QueueError::Storage(DatabaseError::Query(format!("{op}: {e}")))
}

fn row_to_job(row: &libsql::Row) -> Result<Job, QueueError> {
    let parse = |e: libsql::Error| QueueError::Serialization(format!("job row: {e}"));

    let id: String = row.get(0).map_err(parse)?;
    let backoff_json: String = row.get(7).map_err(parse)?;
    let status_str: String = row.get(8).map_err(parse)?;

    let backoff: BackoffPolicy = serde_json::from_str(&backoff_json)
        .map_err(|e| QueueError::Serialization(format!("job backoff: {e}")))?;
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| QueueError::Serialization(format!("unknown job status '{status_str}'")))?;
    let priority = JobPriority::from_rank(row.get::<i64>(4).map_err(parse)? as u8)
        .unwrap_or_default();

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| QueueError::Serialization(format!("job id: {e}")))?,
        seq: row.get::<i64>(1).map_err(parse)? as u64,
        payload: JobPayload {
            message_id: row.get(2).map_err(parse)?,
            tenant_id: row.get(3).map_err(parse)?,
        },
        priority,
        attempts: row.get::<i64>(5).map_err(parse)? as u32,
        max_attempts: row.get::<i64>(6).map_err(parse)? as u32,
        backoff,
        status,
        progress: row.get::<i64>(9).map_err(parse)?.clamp(0, 100) as u8,
        last_error: row.get::<String>(10).ok(),
        created_at: ms_to_datetime(row.get::<i64>(11).map_err(parse)?),
        updated_at: ms_to_datetime(row.get::<i64>(12).map_err(parse)?),
        finished_at: row.get::<i64>(13).ok().map(ms_to_datetime),
    })
}

// ── Store ───────────────────────────────────────────────────────────

/// libSQL-backed job storage.
pub(crate) struct SqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    wake: Arc<Notify>,
}

impl SqlJobStore {
    async fn open(path: &Path, wake: Arc<Notify>) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::Unavailable {
                mode: QueueMode::Durable.to_string(),
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open job database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("jobs schema: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            wake,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut rows = self
            .conn
            .query("SELECT 1", ())
            .await
            .map_err(query_err("ping"))?;
        rows.next().await.map_err(query_err("ping"))?;
        Ok(())
    }

    async fn insert(&self, payload: JobPayload, options: JobOptions) -> Result<Job, QueueError> {
        let backoff = serde_json::to_string(&options.backoff)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = Uuid::new_v4();
        let now = now_ms();

        let mut rows = self
            .conn
            .query(
                &format!(
                    "INSERT INTO jobs (id, seq, message_id, tenant_id, priority, max_attempts, backoff, status, run_at_ms, created_ms, updated_ms)
                     VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs), ?2, ?3, ?4, ?5, ?6, 'waiting', ?7, ?7, ?7)
                     RETURNING {JOB_COLUMNS}"
                ),
                params![
                    id.to_string(),
                    payload.message_id,
                    payload.tenant_id,
                    options.priority.rank() as i64,
                    options.max_attempts.max(1) as i64,
                    backoff,
                    now,
                ],
            )
            .await
            .map_err(query_err("insert_job"))?;

        let row = rows
            .next()
            .await
            .map_err(query_err("insert_job"))?
            .ok_or_else(|| QueueError::Storage(DatabaseError::Query("insert_job: no row returned".into())))?;
        row_to_job(&row)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_job"))?;
        match rows.next().await.map_err(query_err("get_job"))? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Put jobs left `active` by a crashed worker back in line.
    async fn requeue_stalled(&self, stalled_after: Duration) -> Result<usize, QueueError> {
        let cutoff = now_ms().saturating_sub(duration_ms(stalled_after));
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'waiting', run_at_ms = ?1, updated_ms = ?1
                 WHERE status = 'active' AND updated_ms <= ?2",
                params![now_ms(), cutoff],
            )
            .await
            .map_err(query_err("requeue_stalled"))?;
        Ok(n as usize)
    }

    async fn count(&self, sql: &str, args: impl libsql::params::IntoParams) -> Result<usize, QueueError> {
        let mut rows = self.conn.query(sql, args).await.map_err(query_err("count_jobs"))?;
        match rows.next().await.map_err(query_err("count_jobs"))? {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as usize),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl JobStore for SqlJobStore {
    async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let now = now_ms();
        let mut rows = self
            .conn
            .query(
                &format!(
                    "UPDATE jobs SET status = 'active', updated_ms = ?1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE status IN ('waiting', 'retrying') AND run_at_ms <= ?1
                         ORDER BY priority ASC, seq ASC
                         LIMIT 1
                     ) AND status IN ('waiting', 'retrying')
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now],
            )
            .await
            .map_err(query_err("claim_job"))?;

        match rows.next().await.map_err(query_err("claim_job"))? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn settle(&self, job: &Job) -> Result<(), QueueError> {
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, attempts = ?2, progress = ?3, last_error = ?4, updated_ms = ?5, finished_ms = ?6
                 WHERE id = ?7",
                params![
                    job.status.as_str(),
                    job.attempts as i64,
                    job.progress as i64,
                    opt_text(job.last_error.as_deref()),
                    job.updated_at.timestamp_millis(),
                    opt_integer(job.finished_at.map(|t| t.timestamp_millis())),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(query_err("settle_job"))?;
        Ok(())
    }

    async fn schedule_retry(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        let run_at = now_ms().saturating_add(duration_ms(delay));
        // Fresh seq: a retried job queues behind jobs of equal priority.
        self.conn
            .execute(
                "UPDATE jobs SET status = 'retrying', attempts = ?1, progress = ?2, last_error = ?3,
                     run_at_ms = ?4, updated_ms = ?5, seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs)
                 WHERE id = ?6",
                params![
                    job.attempts as i64,
                    job.progress as i64,
                    opt_text(job.last_error.as_deref()),
                    run_at,
                    now_ms(),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(query_err("schedule_retry"))?;

        let wake = Arc::clone(&self.wake);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            wake.notify_one();
        });
        Ok(())
    }
}

// ── Backend ─────────────────────────────────────────────────────────

/// Shared, restart-safe queue on a libSQL database file.
pub struct DurableBackend {
    ctx: Arc<DispatchContext<SqlJobStore>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl DurableBackend {
    /// Open the job database, verify it answers, and recover stalled jobs.
    pub async fn open(
        path: &Path,
        idle_poll: Duration,
        stalled_after: Duration,
    ) -> Result<Self, QueueError> {
        let wake = Arc::new(Notify::new());
        let store = SqlJobStore::open(path, Arc::clone(&wake)).await?;
        store.ping().await?;

        let recovered = store.requeue_stalled(stalled_after).await?;
        if recovered > 0 {
            warn!(recovered, "Requeued stalled jobs from a previous run");
        }

        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(path = %path.display(), "Durable job queue opened");
        Ok(Self {
            ctx: Arc::new(DispatchContext::new(Arc::new(store), events, wake, idle_poll)),
            dispatcher: Mutex::new(None),
        })
    }
}

#[async_trait]
impl QueueBackend for DurableBackend {
    fn mode(&self) -> QueueMode {
        QueueMode::Durable
    }

    async fn add(&self, payload: JobPayload, options: JobOptions) -> Result<JobHandle, QueueError> {
        // Subscribe before the row exists so a fast worker can't outrun us.
        let events = self.ctx.events.subscribe();
        let job = self.ctx.store.insert(payload, options).await?;
        debug!(
            job_id = %job.id,
            message_id = %job.payload.message_id,
            priority = %job.priority,
            seq = job.seq,
            "Durable job enqueued"
        );
        self.ctx.wake.notify_one();
        Ok(JobHandle::new(job.id, events))
    }

    async fn register_handler(
        &self,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Err(QueueError::HandlerAlreadyRegistered);
        }
        *dispatcher = Some(spawn_dispatcher(Arc::clone(&self.ctx), handler, concurrency));
        info!(concurrency, "Durable queue handler registered");
        Ok(())
    }

    async fn pause(&self) {
        self.ctx.pause();
        info!("Durable queue paused for this worker");
    }

    async fn resume(&self) {
        self.ctx.resume();
        info!("Durable queue resumed for this worker");
    }

    async fn is_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = now_ms();
        let mut rows = self
            .ctx
            .store
            .conn
            .query(
                "SELECT
                    COALESCE(SUM(CASE WHEN status = 'waiting' OR (status = 'retrying' AND run_at_ms <= ?1) THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'retrying' AND run_at_ms > ?1 THEN 1 ELSE 0 END), 0),
                    COUNT(*)
                 FROM jobs",
                params![now],
            )
            .await
            .map_err(query_err("job_stats"))?;

        let row = rows
            .next()
            .await
            .map_err(query_err("job_stats"))?
            .ok_or_else(|| QueueError::Storage(DatabaseError::Query("job_stats: no row".into())))?;
        let col = |i: i32| row.get::<i64>(i).unwrap_or(0).max(0) as usize;

        Ok(QueueStats {
            waiting: col(0),
            active: col(1),
            completed: col(2),
            failed: col(3),
            delayed: col(4),
            total: col(5),
            mode: QueueMode::Durable,
        })
    }

    async fn clean(&self, grace: Duration) -> Result<usize, QueueError> {
        let cutoff = now_ms().saturating_sub(duration_ms(grace));
        let removed = self
            .ctx
            .store
            .conn
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND finished_ms <= ?1",
                params![cutoff],
            )
            .await
            .map_err(query_err("clean_jobs"))?;
        if removed > 0 {
            debug!(removed, "Cleaned finished durable jobs");
        }
        Ok(removed as usize)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.ctx.store.get(id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.ctx.events.subscribe()
    }

    async fn shutdown(&self) {
        self.ctx.stop();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl DurableBackend {
    /// Jobs currently eligible for dispatch (test and diagnostics helper).
    pub async fn ready_count(&self) -> Result<usize, QueueError> {
        self.ctx
            .store
            .count(
                "SELECT COUNT(*) FROM jobs WHERE status IN ('waiting', 'retrying') AND run_at_ms <= ?1",
                params![now_ms()],
            )
            .await
    }
}

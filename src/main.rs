use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use travel_inbox::config::AppConfig;
use travel_inbox::inventory::{DbInventory, InventorySource};
use travel_inbox::matching::MatchingEngine;
use travel_inbox::pipeline::{
    Collaborators, HttpCollaborators, MailTransport, SmtpMailer, UnconfiguredMail,
    WorkflowOrchestrator, recover_stranded, spawn_intake_loop,
};
use travel_inbox::queue::{JobScheduler, create_backend};
use travel_inbox::review::ReviewEscalator;
use travel_inbox::store::{Database, LibSqlBackend, MessageStore};
use travel_inbox::tenant::TenantCache;

/// How often finished jobs and stale tenant clients are swept.
const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);

/// How long shutdown waits for the intake loop to notice its flag.
const INTAKE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("✈️  Travel Inbox worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.store.db_path.display());
    eprintln!("   Queue: {} (concurrency {})", config.queue.mode, config.queue.concurrency);
    eprintln!("   Collaborators: {}", config.pipeline.collaborator_base_url);
    match &config.mail {
        Some(mail) => eprintln!("   SMTP: {}:{} as {}", mail.smtp_host, mail.smtp_port, mail.from_address),
        None => eprintln!("   SMTP: not configured (replies will fail)"),
    }
    eprintln!();

    let worker = Worker::start(&config)
        .await
        .context("Failed to start worker")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    worker.shutdown().await;

    Ok(())
}

/// Console output always; a daily rolling file as well when a log directory is set.
///
/// The returned guard flushes the file writer on drop, so keep it alive for
/// the life of the process.
fn init_tracing(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "travel-inbox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

/// Everything running in the background once startup succeeds.
struct Worker {
    scheduler: Arc<JobScheduler>,
    intake: JoinHandle<()>,
    intake_stop: Arc<AtomicBool>,
    janitor: JoinHandle<()>,
}

impl Worker {
    async fn start(config: &AppConfig) -> travel_inbox::Result<Self> {
        // ── Database ─────────────────────────────────────────────────────
        let db: Arc<dyn Database> =
            Arc::new(LibSqlBackend::new_local(&config.store.db_path).await?);
        info!(path = %config.store.db_path.display(), "Database opened");

        let messages = Arc::new(MessageStore::new(Arc::clone(&db)));
        let inventory: Arc<dyn InventorySource> = Arc::new(DbInventory::new(Arc::clone(&db)));
        let matching = Arc::new(MatchingEngine::new(Arc::clone(&inventory)));
        let reviews = Arc::new(ReviewEscalator::new(
            Arc::clone(&db),
            Arc::clone(&messages),
            config.review.clone(),
        ));

        // ── Collaborators ────────────────────────────────────────────────
        let clients = Arc::new(TenantCache::new(config.pipeline.tenant_cache_ttl));
        let http = Arc::new(HttpCollaborators::new(&config.pipeline, Arc::clone(&clients)));
        let mail: Arc<dyn MailTransport> = match &config.mail {
            Some(mail_config) => Arc::new(SmtpMailer::new(mail_config)?),
            None => {
                warn!("SMTP_HOST not set, customer replies cannot be delivered");
                Arc::new(UnconfiguredMail)
            }
        };
        let collaborators = Collaborators {
            categorizer: Arc::clone(&http) as _,
            vision: Arc::clone(&http) as _,
            itinerary: Arc::clone(&http) as _,
            drafter: http,
            mail,
        };

        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::clone(&messages),
            collaborators,
            matching,
            inventory,
            reviews,
            config.pipeline.clone(),
        ));

        // ── Queue ────────────────────────────────────────────────────────
        let backend = create_backend(&config.queue).await;
        let scheduler = Arc::new(JobScheduler::new(
            backend,
            config.queue.job_options(),
            config.queue.concurrency,
        ));
        scheduler.register_handler(orchestrator).await?;
        recover_stranded(&messages, scheduler.mode(), config.queue.stalled_after).await?;

        let (intake, intake_stop) = spawn_intake_loop(
            Arc::clone(&messages),
            Arc::clone(&scheduler),
            config.pipeline.intake_interval,
        );
        let janitor = spawn_janitor(
            Arc::clone(&scheduler),
            clients,
            config.queue.completed_retention,
        );

        info!(mode = %scheduler.mode(), "Worker started");
        Ok(Self {
            scheduler,
            intake,
            intake_stop,
            janitor,
        })
    }

    async fn shutdown(self) {
        self.intake_stop.store(true, Ordering::Relaxed);
        if tokio::time::timeout(INTAKE_STOP_TIMEOUT, self.intake)
            .await
            .is_err()
        {
            warn!("Intake loop did not stop in time");
        }
        self.janitor.abort();
        self.scheduler.shutdown().await;

        match self.scheduler.stats().await {
            Ok(stats) => info!(
                waiting = stats.waiting,
                active = stats.active,
                completed = stats.completed,
                failed = stats.failed,
                "Worker stopped"
            ),
            Err(e) => warn!(error = %e, "Worker stopped, queue stats unavailable"),
        }
    }
}

/// Periodically drop old finished jobs and expired tenant clients.
fn spawn_janitor(
    scheduler: Arc<JobScheduler>,
    clients: Arc<TenantCache<reqwest::Client>>,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            tick.tick().await;
            match scheduler.clean(retention).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Cleaned finished jobs"),
                Err(e) => warn!(error = %e, "Job cleanup failed"),
            }
            let evicted = clients.evict_expired().await;
            if evicted > 0 {
                debug!(evicted, "Evicted idle tenant clients");
            }
        }
    })
}

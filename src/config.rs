//! Configuration types.
//!
//! Everything is read from environment variables once at startup. Unset
//! variables fall back to defaults; set-but-unparseable ones are rejected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::queue::{BackoffPolicy, JobOptions, QueueMode};
use crate::review::SlaPolicy;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub pipeline: PipelineConfig,
    pub review: ReviewConfig,
    /// `None` when no SMTP host is configured.
    pub mail: Option<MailConfig>,
    pub store: StoreConfig,
    /// Directory for rolling log files; stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        Ok(Self {
            queue: QueueConfig::load(&env)?,
            pipeline: PipelineConfig::load(&env)?,
            review: ReviewConfig::load(&env)?,
            mail: MailConfig::load(&env)?,
            store: StoreConfig::load(&env),
            log_dir: env.get("TRAVEL_INBOX_LOG_DIR").map(PathBuf::from),
        })
    }
}

// ── Queue ───────────────────────────────────────────────────────────

/// Job queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Preferred backend. Durable still needs `durable_path` and a reachable database.
    pub mode: QueueMode,
    pub durable_path: Option<PathBuf>,
    /// Parallel handler invocations. Zero selects the synchronous backend.
    pub concurrency: usize,
    /// Fallback re-check interval for the dispatcher. Wakeups are normally
    /// channel-driven; lower values trade CPU for latency on missed wakeups.
    pub idle_poll_interval: Duration,
    pub default_max_attempts: u32,
    pub default_backoff: BackoffPolicy,
    /// Finished jobs older than this are removed by `clean`.
    pub completed_retention: Duration,
    /// Durable jobs left active longer than this are requeued on startup.
    pub stalled_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::InProcess,
            durable_path: None,
            concurrency: 3,
            idle_poll_interval: Duration::from_millis(100),
            default_max_attempts: 3,
            default_backoff: BackoffPolicy::default(),
            completed_retention: Duration::from_secs(24 * 3600),
            stalled_after: Duration::from_secs(600),
        }
    }
}

impl QueueConfig {
    fn load(env: &Env<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mode = match env.get("QUEUE_MODE") {
            Some(raw) => QueueMode::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "QUEUE_MODE".into(),
                message: format!("expected durable, in_process or sync, got '{raw}'"),
            })?,
            None => defaults.mode,
        };

        Ok(Self {
            mode,
            durable_path: env.get("QUEUE_DURABLE_URL").map(|s| {
                PathBuf::from(s.strip_prefix("file:").unwrap_or(&s))
            }),
            concurrency: env.parse("QUEUE_CONCURRENCY", defaults.concurrency)?,
            idle_poll_interval: env.millis("QUEUE_IDLE_POLL_MS", defaults.idle_poll_interval)?,
            default_max_attempts: env
                .parse("QUEUE_MAX_ATTEMPTS", defaults.default_max_attempts)?
                .max(1),
            default_backoff: BackoffPolicy::exponential(
                env.millis("QUEUE_BACKOFF_MS", Duration::from_millis(defaults.default_backoff.delay_ms))?,
            ),
            completed_retention: env.secs("QUEUE_RETENTION_SECS", defaults.completed_retention)?,
            stalled_after: env.secs("QUEUE_STALLED_SECS", defaults.stalled_after)?,
        })
    }

    /// Options applied to jobs enqueued without explicit overrides.
    pub fn job_options(&self) -> JobOptions {
        JobOptions::default()
            .with_max_attempts(self.default_max_attempts)
            .with_backoff(self.default_backoff)
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Orchestrator thresholds and collaborator endpoints.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Categorizations below this confidence go to review.
    pub confidence_threshold: u8,
    /// More missing fields than this makes a request ambiguous.
    pub max_missing_fields: usize,
    /// Budgets above this are held for review before sending.
    pub high_value_threshold: Decimal,
    pub collaborator_base_url: String,
    pub collaborator_api_key: Option<SecretString>,
    /// Per-tenant overrides of `collaborator_api_key`.
    pub tenant_api_keys: HashMap<String, SecretString>,
    pub request_timeout: Duration,
    pub intake_interval: Duration,
    pub tenant_cache_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 70,
            max_missing_fields: 3,
            high_value_threshold: dec!(10000),
            collaborator_base_url: "http://localhost:8080".to_string(),
            collaborator_api_key: None,
            tenant_api_keys: HashMap::new(),
            request_timeout: Duration::from_secs(60),
            intake_interval: Duration::from_secs(15),
            tenant_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    fn load(env: &Env<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let confidence_threshold: u8 =
            env.parse("PIPELINE_CONFIDENCE_THRESHOLD", defaults.confidence_threshold)?;
        if confidence_threshold > 100 {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_CONFIDENCE_THRESHOLD".into(),
                message: format!("must be 0-100, got {confidence_threshold}"),
            });
        }

        Ok(Self {
            confidence_threshold,
            max_missing_fields: env.parse("PIPELINE_MAX_MISSING_FIELDS", defaults.max_missing_fields)?,
            high_value_threshold: env
                .parse("PIPELINE_HIGH_VALUE_THRESHOLD", defaults.high_value_threshold)?,
            collaborator_base_url: env
                .get("COLLABORATOR_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.collaborator_base_url),
            collaborator_api_key: env.get("COLLABORATOR_API_KEY").map(SecretString::from),
            tenant_api_keys: parse_tenant_keys(env.get("COLLABORATOR_TENANT_KEYS"))?,
            request_timeout: env.secs("COLLABORATOR_TIMEOUT_SECS", defaults.request_timeout)?,
            intake_interval: env.secs("INTAKE_INTERVAL_SECS", defaults.intake_interval)?,
            tenant_cache_ttl: env.secs("TENANT_CACHE_TTL_SECS", defaults.tenant_cache_ttl)?,
        })
    }
}

/// `tenant-a=key1,tenant-b=key2`
fn parse_tenant_keys(raw: Option<String>) -> Result<HashMap<String, SecretString>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(HashMap::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (tenant, key) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: "COLLABORATOR_TENANT_KEYS".into(),
                message: format!("expected tenant=key, got '{pair}'"),
            })?;
            Ok((tenant.trim().to_string(), SecretString::from(key.trim().to_string())))
        })
        .collect()
}

// ── Review ──────────────────────────────────────────────────────────

/// Review escalation settings.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    /// Customers with a budget above this are tagged VIP.
    pub vip_budget_threshold: Decimal,
    pub sla: SlaPolicy,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            vip_budget_threshold: dec!(10000),
            sla: SlaPolicy::default(),
        }
    }
}

impl ReviewConfig {
    fn load(env: &Env<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let d = defaults.sla;
        Ok(Self {
            vip_budget_threshold: env.parse("REVIEW_VIP_THRESHOLD", defaults.vip_budget_threshold)?,
            sla: SlaPolicy {
                urgent_minutes: env.parse("REVIEW_SLA_URGENT_MIN", d.urgent_minutes)?,
                high_minutes: env.parse("REVIEW_SLA_HIGH_MIN", d.high_minutes)?,
                normal_minutes: env.parse("REVIEW_SLA_NORMAL_MIN", d.normal_minutes)?,
                low_minutes: env.parse("REVIEW_SLA_LOW_MIN", d.low_minutes)?,
            },
        })
    }
}

// ── Mail ────────────────────────────────────────────────────────────

/// SMTP settings for outbound replies.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl MailConfig {
    fn load(env: &Env<'_>) -> Result<Option<Self>, ConfigError> {
        let Some(smtp_host) = env.get("SMTP_HOST") else {
            return Ok(None);
        };
        let username = env.get("SMTP_USERNAME").unwrap_or_default();
        let from_address = env
            .get("SMTP_FROM")
            .or_else(|| (!username.is_empty()).then(|| username.clone()))
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "SMTP_FROM".into(),
                hint: "Set SMTP_FROM or SMTP_USERNAME when SMTP_HOST is configured".into(),
            })?;

        Ok(Some(Self {
            smtp_host,
            smtp_port: env.parse("SMTP_PORT", 587)?,
            username,
            password: SecretString::from(env.get("SMTP_PASSWORD").unwrap_or_default()),
            from_address,
        }))
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// Message/review database location.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/travel-inbox.db"),
        }
    }
}

impl StoreConfig {
    fn load(env: &Env<'_>) -> Self {
        env.get("TRAVEL_INBOX_DB_PATH")
            .map(|p| Self { db_path: PathBuf::from(p) })
            .unwrap_or_default()
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse(key, default.as_secs())?))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(
            self.parse(key, default.as_millis() as u64)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.queue.mode, QueueMode::InProcess);
        assert_eq!(cfg.queue.concurrency, 3);
        assert_eq!(cfg.queue.idle_poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.queue.default_max_attempts, 3);
        assert_eq!(cfg.queue.default_backoff, BackoffPolicy::default());
        assert_eq!(cfg.pipeline.confidence_threshold, 70);
        assert_eq!(cfg.pipeline.max_missing_fields, 3);
        assert_eq!(cfg.pipeline.high_value_threshold, dec!(10000));
        assert_eq!(cfg.review.sla.urgent_minutes, 30);
        assert_eq!(cfg.review.sla.low_minutes, 1440);
        assert!(cfg.mail.is_none());
        assert_eq!(cfg.store.db_path, PathBuf::from("./data/travel-inbox.db"));
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("QUEUE_MODE", "durable"),
            ("QUEUE_DURABLE_URL", "file:/var/lib/inbox/jobs.db"),
            ("QUEUE_CONCURRENCY", "8"),
            ("QUEUE_BACKOFF_MS", "500"),
            ("PIPELINE_HIGH_VALUE_THRESHOLD", "25000.50"),
            ("COLLABORATOR_BASE_URL", "https://ai.example.com/"),
            ("COLLABORATOR_TENANT_KEYS", "acme=k1, globex = k2"),
        ])
        .unwrap();

        assert_eq!(cfg.queue.mode, QueueMode::Durable);
        assert_eq!(
            cfg.queue.durable_path,
            Some(PathBuf::from("/var/lib/inbox/jobs.db"))
        );
        assert_eq!(cfg.queue.concurrency, 8);
        assert_eq!(cfg.queue.default_backoff.delay_ms, 500);
        assert_eq!(cfg.pipeline.high_value_threshold, dec!(25000.50));
        assert_eq!(cfg.pipeline.collaborator_base_url, "https://ai.example.com");
        assert_eq!(cfg.pipeline.tenant_api_keys["globex"].expose_secret(), "k2");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = config(&[("QUEUE_CONCURRENCY", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "QUEUE_CONCURRENCY"));

        let err = config(&[("QUEUE_MODE", "redis")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = config(&[("PIPELINE_CONFIDENCE_THRESHOLD", "150")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = config(&[("COLLABORATOR_TENANT_KEYS", "nokey")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn mail_requires_from_address() {
        let err = config(&[("SMTP_HOST", "smtp.example.com")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));

        let cfg = config(&[
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USERNAME", "bookings@example.com"),
        ])
        .unwrap();
        let mail = cfg.mail.unwrap();
        assert_eq!(mail.smtp_port, 587);
        assert_eq!(mail.from_address, "bookings@example.com");
    }

    #[test]
    fn job_options_follow_queue_defaults() {
        let cfg = config(&[("QUEUE_MAX_ATTEMPTS", "5")]).unwrap();
        let opts = cfg.queue.job_options();
        assert_eq!(opts.max_attempts, 5);
    }
}

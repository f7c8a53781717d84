//! Error types for the travel inbox pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Optimistic version check failed: someone else saved the record first.
    #[error("Concurrent update of {entity} {id}: expected version {expected}")]
    Conflict {
        entity: String,
        id: String,
        expected: i64,
    },
}

/// Queue and scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("No job handler registered")]
    NoHandler,

    #[error("A job handler is already registered")]
    HandlerAlreadyRegistered,

    #[error("Queue is shut down")]
    Closed,

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Queue backend {mode} unavailable: {reason}")]
    Unavailable { mode: String, reason: String },

    #[error("Queue storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Job serialization error: {0}")]
    Serialization(String),
}

/// Errors from external collaborators (model services, itinerary matcher, mail transport).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("{service} network error: {reason}")]
    Network { service: String, reason: String },

    #[error("{service} rate limited, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("{service} upstream error (HTTP {status}): {reason}")]
    Upstream {
        service: String,
        status: u16,
        reason: String,
    },

    #[error("{service} is not configured: {reason}")]
    NotConfigured { service: String, reason: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("{service} rejected the request: {reason}")]
    Rejected { service: String, reason: String },
}

impl CollaboratorError {
    /// Transient failures are worth retrying; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Network { .. }
                | Self::RateLimited { .. }
                | Self::Upstream { .. }
        )
    }

    /// Name of the collaborator that failed.
    pub fn service(&self) -> &str {
        match self {
            Self::Timeout { service, .. }
            | Self::Network { service, .. }
            | Self::RateLimited { service, .. }
            | Self::Upstream { service, .. }
            | Self::NotConfigured { service, .. }
            | Self::InvalidResponse { service, .. }
            | Self::Rejected { service, .. } => service,
        }
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Message {id} not found")]
    MessageNotFound { id: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Review escalation errors.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("Review item {id} not found")]
    NotFound { id: Uuid },

    #[error("Message {message_id} not found")]
    MessageNotFound { message_id: String },

    #[error("Review item {id} cannot {action} while {status}")]
    InvalidTransition {
        id: Uuid,
        status: String,
        action: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

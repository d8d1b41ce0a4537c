//! Error types for Outflow.

use uuid::Uuid;

/// Top-level error type for the outreach core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Shared store error: {0}")]
    SharedStore(#[from] SharedStoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

impl Error {
    /// Whether the failure is transient (lock contention, provider timeout).
    ///
    /// Both transient failures and permanent provider rejections are retried
    /// by the queue up to the bounded attempt count; the distinction matters
    /// for logging, not for routing.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Worker(WorkerError::LockContended { .. }) => true,
            Error::Provider(p) => p.is_transient(),
            Error::Database(_) | Error::SharedStore(_) => true,
            _ => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the shared atomic key-value service.
///
/// Callers treat any of these as "deny" — the limiter and lock layers are
/// fail-closed, so an unreachable store never permits a send.
#[derive(Debug, thiserror::Error)]
pub enum SharedStoreError {
    #[error("Shared store unavailable: {0}")]
    Unavailable(String),

    #[error("Shared store operation failed: {0}")]
    Operation(String),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid job payload: {0}")]
    Payload(String),

    #[error("Invalid repeat schedule: {0}")]
    Schedule(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Provider adapter errors, classified for retry routing.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Transient provider failure: {reason}")]
    Transient { reason: String },

    #[error("Permanent provider rejection: {reason}")]
    Permanent { reason: String },

    #[error("Authentication failed for mailbox {mailbox_id}")]
    Auth { mailbox_id: Uuid },

    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// Delivery worker errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Mailbox {mailbox_id} is locked by another worker")]
    LockContended { mailbox_id: Uuid },

    #[error("Sending log {log_id} references missing {entity}")]
    MissingData { log_id: Uuid, entity: &'static str },
}

/// Inbound reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Inbound event has neither a correlation id nor a sender address")]
    Unresolvable,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the outreach core.
pub type Result<T> = std::result::Result<T, Error>;

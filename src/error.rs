use thiserror::Error;

/// Main error type for the broker synchronization engine
#[derive(Error, Debug)]
pub enum SyncError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Broker errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Broker operation failed: {0}")]
    Broker(String),

    #[error("Broker call timed out after {elapsed_ms}ms: {operation}")]
    BrokerTimeout { operation: String, elapsed_ms: u64 },

    // Reconciliation errors
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    // Listener errors
    #[error("Listener error on queue {queue}: {reason}")]
    Listener { queue: String, reason: String },

    // Correlation errors
    #[error("Correlation error: {0}")]
    Correlation(String),

    #[error("Version conflict on transaction {transaction_id}")]
    VersionConflict { transaction_id: String },

    #[error("Duplicate transaction id: {0}")]
    DuplicateTransaction(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Startup errors
    #[error("Component {component} failed to start: {reason}")]
    StartupFailed { component: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether retrying the same operation later can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_)
                | SyncError::Broker(_)
                | SyncError::BrokerTimeout { .. }
                | SyncError::Database(_)
                | SyncError::VersionConflict { .. }
        )
    }

    pub fn listener(queue: &str, reason: impl Into<String>) -> Self {
        SyncError::Listener {
            queue: queue.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

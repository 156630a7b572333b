use thiserror::Error;

/// Convenience type alias for Results with FleetError
pub type Result<T> = std::result::Result<T, FleetError>;

/// Main error type for Fleet Core
///
/// Each variant corresponds to one kind in the error taxonomy. Variants are
/// matched on by the API layer for status-code mapping and by the executor to
/// decide between task failure and caller-surfaced errors, so new failure
/// modes get a variant here rather than a string convention.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Agent runtime error: {message}")]
    AgentRpc { message: String },

    #[error("Validation runner error: {message}")]
    ValidationRpc { message: String },

    #[error("Bus publish error: {0}")]
    BusPublish(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    /// True for errors the assigner treats as "skip this candidate" rather
    /// than a hard failure of the whole selection pass.
    pub fn is_skip(&self) -> bool {
        matches!(self, FleetError::ResourceBusy(_) | FleetError::Conflict(_))
    }
}

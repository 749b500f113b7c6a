/// Error types for the VisionWeaver workflow orchestrator.
use thiserror::Error;

/// Failure reported by an external collaborator (language model, image backend, ...).
#[derive(Error, Debug)]
pub enum CollaboratorError {
    /// The collaborator answered, but with an explicit error field.
    #[error("{0}")]
    Reported(String),

    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Process failed: {0}")]
    ProcessError(String),
}

impl CollaboratorError {
    /// Detail suitable for embedding in a user-facing sentence.
    ///
    /// Only reported errors are considered safe to show; transport failures are not.
    pub fn reported_detail(&self) -> Option<&str> {
        match self {
            CollaboratorError::Reported(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Result type for collaborator calls.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Errors raised by lease and task stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Rejections produced in front of the workflow engine.
#[derive(Error, Debug)]
pub enum GateError {
    /// Another request holds the execution lease.
    #[error("System busy, retry in {retry_after_secs}s")]
    Busy {
        holder: Option<String>,
        retry_after_secs: u64,
    },

    /// The safety filter refused the request.
    #[error("Request rejected: {reason}")]
    Rejected { reason: String },

    #[error("Lease store error: {0}")]
    Store(#[from] StoreError),
}

impl GateError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::Busy { .. })
    }
}

/// Result type for gate operations.
pub type GateResult<T> = Result<T, GateError>;

/// Crate-level error type.
#[derive(Error, Debug)]
pub enum WeaverError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for crate-level operations.
pub type WeaverResult<T> = Result<T, WeaverError>;

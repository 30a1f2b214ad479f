//! Error types for the scheduler.

use thiserror::Error;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job's expiration time is already in the past.
    #[error("job {job_id} has delay {delay_millis}ms, its expiration time has passed")]
    NegativeDelay { job_id: String, delay_millis: i64 },

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Invalid job configuration.
    #[error("invalid job configuration: {0}")]
    InvalidJob(String),

    /// The backing repository failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// The low-level timer backend failed.
    #[error("timer error: {0}")]
    Timer(String),

    /// HTTP client setup failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

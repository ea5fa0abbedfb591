use std::time::Duration;
use thiserror::Error;

/// Every failure the packager can surface.
///
/// Errors are `Clone` because a single job failure is handed to every waiter
/// attached to that job.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PackagerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Catalog fetch failed: {0}")]
    FetchFailure(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Archive creation failed: {0}")]
    ArchiveFailure(String),

    #[error("Extension merge failed: {0}")]
    MergeFailure(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Packager is shutting down")]
    ShuttingDown,

    #[error("Notification failed: {0}")]
    NotificationFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PackagerError {
    /// True for errors that terminate a job once it has been accepted,
    /// as opposed to errors that reject the submission itself.
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            PackagerError::FetchFailure(_)
                | PackagerError::StorageFailure(_)
                | PackagerError::ArchiveFailure(_)
                | PackagerError::MergeFailure(_)
                | PackagerError::Timeout(_)
                | PackagerError::Internal(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PackagerError::InvalidRequest(_) => ErrorSeverity::Low,
            PackagerError::QueueFull { .. } => ErrorSeverity::Low,
            PackagerError::NotificationFailure(_) => ErrorSeverity::Low,
            PackagerError::StorageFailure(_) => ErrorSeverity::High,
            PackagerError::Configuration(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Stable label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PackagerError::InvalidRequest(_) => "invalid_request",
            PackagerError::QueueFull { .. } => "queue_full",
            PackagerError::FetchFailure(_) => "fetch",
            PackagerError::StorageFailure(_) => "storage",
            PackagerError::ArchiveFailure(_) => "archive",
            PackagerError::MergeFailure(_) => "merge",
            PackagerError::Timeout(_) => "timeout",
            PackagerError::ShuttingDown => "shutting_down",
            PackagerError::NotificationFailure(_) => "notification",
            PackagerError::Configuration(_) => "configuration",
            PackagerError::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<std::io::Error> for PackagerError {
    fn from(err: std::io::Error) -> Self {
        PackagerError::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for PackagerError {
    fn from(err: serde_json::Error) -> Self {
        PackagerError::FetchFailure(format!("malformed catalog response: {err}"))
    }
}

impl From<reqwest::Error> for PackagerError {
    fn from(err: reqwest::Error) -> Self {
        PackagerError::FetchFailure(err.to_string())
    }
}

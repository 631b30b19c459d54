use thiserror::Error;

/// Errors surfaced by the job store, the audit log and dump/restore.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job does not exist: {0}")]
    JobNotFound(String),

    #[error("Job {0} has expired and can no longer be changed")]
    JobExpired(String),

    #[error("{field} of job {job_id} cannot be changed")]
    ImmutableField { job_id: String, field: &'static str },

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    #[error("Restore failed at line {line_number} ({line}): {reason}")]
    Restore {
        line_number: usize,
        line: String,
        reason: String,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Why a job was skipped during an evaluation pass without running its action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ConfigurationNotFound,
    PeerNotFound,
    InvalidNumericValue,
    /// The value did not parse as a timestamp; the job is left alone this tick.
    UnparseableTimestamp,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::ConfigurationNotFound => write!(f, "configuration not found"),
            SkipReason::PeerNotFound => write!(f, "peer not found"),
            SkipReason::InvalidNumericValue => write!(f, "invalid numeric value"),
            SkipReason::UnparseableTimestamp => write!(f, "unparseable timestamp"),
        }
    }
}

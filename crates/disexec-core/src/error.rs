use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(
        "schema mismatch in {} (record {record}): expected {expected} columns, found {found}",
        .path.display()
    )]
    SchemaMismatch {
        path: PathBuf,
        record: usize,
        expected: usize,
        found: usize,
    },
    #[error("duplicate column '{column}' in header of {}", .path.display())]
    DuplicateColumn { path: PathBuf, column: String },
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("task {task_id} failed with exit status {status}")]
    ExecutionFailure { task_id: u64, status: String },
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("malformed report {}: {reason}", .path.display())]
    MalformedReport { path: PathBuf, reason: String },
    #[error("task {task_id}: cannot {action} while {phase}")]
    InvalidPhase {
        task_id: u64,
        action: &'static str,
        phase: &'static str,
    },
    #[error("worker {0} panicked")]
    WorkerPanicked(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// True for failures that must abort the whole process rather than a
    /// single task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::QueueUnavailable(_))
    }
}

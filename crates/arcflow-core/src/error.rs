// Error types for the workflow engine

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while loading or validating a workflow document.
///
/// These are fatal: a process with an invalid workflow refuses to start.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The document parsed but the graph breaks an invariant
    #[error("invalid workflow: {0}")]
    Invalid(String),

    /// The document could not be read
    #[error("failed to read workflow document: {0}")]
    Io(#[from] std::io::Error),

    /// The document could not be parsed
    #[error("failed to parse workflow document: {0}")]
    Parse(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        WorkflowError::Invalid(msg.into())
    }
}

/// Errors surfaced by the package queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// Every waiting queue is at capacity
    #[error("all package queues are full")]
    Full,

    /// The queue has been stopped and admits no further work
    #[error("queue stopped")]
    Shutdown,
}

/// Errors surfaced by the task backend to the owning job.
///
/// Both variants carry the per-task results that were collected before the
/// failure was observed, so the job can still persist and aggregate them.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Some tasks in the batch finished with a non-zero exit code
    #[error("{failed} of {total} tasks in the batch failed")]
    PartialFailure {
        failed: usize,
        total: usize,
        results: Vec<crate::task::TaskResult>,
    },

    /// The batch could not be dispatched or collected in full
    #[error("task transport failure: {detail}")]
    Transport {
        detail: String,
        results: Vec<crate::task::TaskResult>,
    },
}

/// Errors surfaced by a state store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("package not found: {0}")]
    PackageNotFound(Uuid),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl std::fmt::Display) -> Self {
        StoreError::Backend(msg.to_string())
    }
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Uncaught error inside a job body; converted to a Failed job status
    #[error("job internal error: {0}")]
    JobInternal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn job_internal(msg: impl Into<String>) -> Self {
        EngineError::JobInternal(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}

use thiserror::Error;

/// Errors raised by the job subsystem
#[derive(Error, Debug)]
pub enum JobError {
    /// Malformed enqueue request; nothing was written
    #[error("Invalid job request: {0}")]
    Validation(String),

    /// No handler registered for the job type
    #[error("Unknown job type: {0}")]
    UnknownType(String),

    /// Another row already holds this dedupe key in the same scope
    #[error("Dedupe key already held by an active job: {0}")]
    DedupeConflict(String),

    /// Raised by a handler that observed cancellation
    #[error("Job was canceled")]
    Canceled,

    /// Raised by a handler for failures that retrying cannot fix
    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    /// Find a `JobError` anywhere in a handler's error chain.
    pub fn find_in(error: &anyhow::Error) -> Option<&JobError> {
        error.chain().find_map(|cause| cause.downcast_ref::<JobError>())
    }

    /// Whether a handler error signals cooperative cancellation.
    pub fn is_cancellation(error: &anyhow::Error) -> bool {
        matches!(Self::find_in(error), Some(JobError::Canceled))
    }

    /// Whether a handler error must not be retried automatically.
    pub fn is_permanent(error: &anyhow::Error) -> bool {
        matches!(Self::find_in(error), Some(JobError::Permanent(_)))
    }
}

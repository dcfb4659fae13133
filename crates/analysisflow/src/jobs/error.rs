use crate::jobs::model::JobStatus;
use crate::stores::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {job_id} is not finished yet (status: {status})")]
    NotReady { job_id: String, status: JobStatus },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl QueueError {
    /// Errors a worker should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        QueueError::StoreUnavailable(e.to_string())
    }
}

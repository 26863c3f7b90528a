//! Worker error types.

use thiserror::Error;

use vrelay_models::JobType;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Encoder not found: {0}")]
    EncoderNotFound(String),

    #[error("Encode timed out after {0} seconds")]
    Timeout(u64),

    #[error("Job type {0} is not executed locally")]
    Unsupported(JobType),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// The lease was reclaimed or cancelled while the job ran.
    #[error("Lease lost")]
    LeaseLost,

    /// The worker is shutting down.
    #[error("Cancelled")]
    Cancelled,

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] vrelay_scheduler::SchedulerError),

    #[error("Store error: {0}")]
    Store(#[from] vrelay_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn encode_failed(msg: impl Into<String>) -> Self {
        Self::EncodeFailed(msg.into())
    }

    /// True when the job should be handed back instead of reported as failed.
    pub fn is_abort(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }
}

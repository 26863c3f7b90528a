//! Scheduler error types.

use thiserror::Error;

use vrelay_models::{JobId, JobState, PayloadError};
use vrelay_store::StoreError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency lost more often than the retry budget allows.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    /// Stale or wrong lease token.
    #[error("Invalid lease for job {0}")]
    InvalidLease(JobId),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Lease expired for job {0}")]
    LeaseExpired(JobId),

    #[error("Job {id} cannot leave state {state}")]
    InvalidTransition { id: JobId, state: JobState },

    #[error("Result handler failed: {0}")]
    Handler(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl SchedulerError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailed(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::Conflict(_))
    }
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SchedulerError::NotFound(id),
            StoreError::Conflict { id, .. } => SchedulerError::Conflict(id),
            other => SchedulerError::Store(other),
        }
    }
}

impl From<PayloadError> for SchedulerError {
    fn from(e: PayloadError) -> Self {
        SchedulerError::ValidationFailed(e.to_string())
    }
}

//! Structured lifecycle logging for locally executed jobs.

use std::fmt::Display;
use std::time::Duration;

use tracing::{error, info, info_span, warn, Span};
use vrelay_models::{JobRecord, JobType};

use crate::command::EncodeProgress;

/// Logs one leased job's lifecycle with its identifying fields attached.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    job_type: JobType,
    video_key: String,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.to_string(),
            job_type: job.job_type,
            video_key: job.private_payload.video_key.clone(),
            attempt: job.failure_count + 1,
        }
    }

    pub fn claimed(&self) {
        info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            video_key = %self.video_key,
            attempt = self.attempt,
            "Running job locally"
        );
    }

    pub fn progress(&self, progress: &EncodeProgress) {
        info!(
            job_id = %self.job_id,
            frame = progress.frame,
            out_time_ms = progress.out_time_ms,
            "Encoding"
        );
    }

    pub fn completed(&self, elapsed: Duration) {
        info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            elapsed_ms = elapsed.as_millis() as u64,
            "Local job completed"
        );
    }

    /// The lease was reclaimed while encoding; the result is discarded.
    pub fn lease_lost(&self) {
        warn!(job_id = %self.job_id, "Lease lost, dropping result");
    }

    pub fn handed_back(&self, reason: &str) {
        warn!(job_id = %self.job_id, reason, "Handing job back");
    }

    pub fn failed(&self, err: &dyn Display) {
        error!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            error = %err,
            "Local job failed"
        );
    }

    pub fn report_failed(&self, err: &dyn Display) {
        error!(job_id = %self.job_id, error = %err, "Failed to report job outcome");
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span for instrumenting the whole execution.
    pub fn span(&self) -> Span {
        info_span!(
            "local_job",
            job_id = %self.job_id,
            job_type = %self.job_type,
            video_key = %self.video_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrelay_models::PrivatePayload;

    #[test]
    fn test_attempt_counts_previous_failures() {
        let mut job = JobRecord::new(
            JobType::VodHls,
            serde_json::json!({}),
            PrivatePayload::for_video("video-1"),
            100,
            None,
        );
        assert_eq!(JobLogger::new(&job).attempt(), 1);

        job.failure_count = 2;
        let logger = JobLogger::new(&job);
        assert_eq!(logger.attempt(), 3);
        assert_eq!(logger.job_id(), job.id.as_str());
    }
}

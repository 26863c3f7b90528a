//! Hand-off of validated job results to the catalog layer.

use async_trait::async_trait;
use tracing::info;

use vrelay_models::{JobRecord, LiveChunkUpdate, SuccessPayload};

use crate::error::SchedulerResult;
use crate::live::ChunkChange;

/// Applies job results outside the scheduler (moving files, updating the
/// catalog). Called while the job is `Completing`; an error ends the job
/// in `Errored`.
#[async_trait]
pub trait JobResultHandler: Send + Sync {
    async fn on_success(&self, job: &JobRecord, result: &SuccessPayload) -> SchedulerResult<()>;

    /// Called after a live chunk operation was applied to the window.
    async fn on_live_chunk(
        &self,
        _job: &JobRecord,
        _update: &LiveChunkUpdate,
        _change: &ChunkChange,
    ) -> SchedulerResult<()> {
        Ok(())
    }
}

/// Handler that only logs results.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResultHandler;

#[async_trait]
impl JobResultHandler for LoggingResultHandler {
    async fn on_success(&self, job: &JobRecord, result: &SuccessPayload) -> SchedulerResult<()> {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            video_key = %job.private_payload.video_key,
            result = ?result,
            "Job result accepted"
        );
        Ok(())
    }

    async fn on_live_chunk(
        &self,
        job: &JobRecord,
        update: &LiveChunkUpdate,
        change: &ChunkChange,
    ) -> SchedulerResult<()> {
        info!(
            job_id = %job.id,
            chunk = update.chunk_filename(),
            rendition = %change.rendition,
            window = change.window.len(),
            evicted = change.evicted.len(),
            "Live chunk applied"
        );
        Ok(())
    }
}

//! Lease manager: the claim protocol and job state machine.
//!
//! All transitions are read-modify-write cycles against the store's version
//! check, so any number of callers (remote agents, the local worker, the
//! reaper) may race on the same job. A lost race is retried a bounded number
//! of times before `Conflict` is surfaced.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use vrelay_models::{
    parent_input, resolve_parent_input, AgentId, JobId, JobRecord, JobState, JobType, LeaseToken,
    LiveChunkUpdate, SuccessPayload,
};
use vrelay_store::{JobFilter, JobMutation, JobRepository, Page};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, JobEvent};
use crate::live::{ChunkChange, LiveChunkController};
use crate::metrics::{
    record_cancelled, record_claimed, record_completed, record_failed, record_lease_rejection,
};
use crate::result::JobResultHandler;

/// Reason recorded when the reaper reclaims a lease.
pub const LEASE_EXPIRED_REASON: &str = "lease-expired";

/// Reason recorded when a job never left `Completing`.
pub const RESULT_NOT_RECORDED_REASON: &str = "result-not-recorded";

/// Base delay between conflict retries (multiplied by the attempt number).
const RETRY_BASE_DELAY_MS: u64 = 5;

/// States a failure or cancellation cascade moves children out of.
const CASCADE_FROM: &[JobState] = &[
    JobState::WaitingForParent,
    JobState::Pending,
    JobState::Processing,
];

/// Result of an accepted `update`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAck {
    Applied {
        progress: Option<u8>,
        chunk: Option<ChunkChange>,
    },
    /// The job is already completing; nothing to do.
    Ignored,
}

/// Where a failed or aborted job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `Pending` for another attempt
    Retrying,
    /// Terminal `Errored`
    Errored,
}

fn require_lease(job: &JobRecord, token: &LeaseToken, op: &'static str) -> SchedulerResult<bool> {
    if job.holds_lease(token) {
        return Ok(true);
    }

    record_lease_rejection(op);
    warn!(
        job_id = %job.id,
        job_type = %job.job_type,
        state = %job.state,
        op,
        "Rejected stale or unknown lease token"
    );
    Err(SchedulerError::InvalidLease(job.id.clone()))
}

/// Hands out leases and drives jobs through their lifecycle.
pub struct LeaseManager {
    jobs: Arc<dyn JobRepository>,
    config: Arc<SchedulerConfig>,
    live: LiveChunkController,
    events: EventBus,
    results: Arc<dyn JobResultHandler>,
}

impl LeaseManager {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        config: Arc<SchedulerConfig>,
        events: EventBus,
        results: Arc<dyn JobResultHandler>,
    ) -> Self {
        let live = LiveChunkController::new(config.live_window_size);
        Self {
            jobs,
            config,
            live,
            events,
            results,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn live(&self) -> &LiveChunkController {
        &self.live
    }

    pub async fn get(&self, job_id: &JobId) -> SchedulerResult<JobRecord> {
        Ok(self.jobs.get(job_id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> SchedulerResult<Page<JobRecord>> {
        Ok(self.jobs.list(filter).await?)
    }

    pub async fn list_for_video(&self, video_key: &str) -> SchedulerResult<Vec<JobRecord>> {
        Ok(self.jobs.list_for_video(video_key).await?)
    }

    /// Lease the best pending job accepted by the caller.
    ///
    /// Returns `Ok(None)` when nothing is claimable.
    pub async fn claim(
        &self,
        agent_id: &AgentId,
        accepted: Option<&[JobType]>,
    ) -> SchedulerResult<Option<JobRecord>> {
        let attempts = self.config.claim_attempts.max(1);

        for attempt in 0..attempts {
            let candidates = self
                .jobs
                .list_pending(accepted, self.config.pending_page_size)
                .await?;

            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                let mutation = |j: &mut JobRecord| {
                    j.start_lease(agent_id.clone());
                };

                match self.jobs.update(&candidate.id, candidate.version, &mutation).await {
                    Ok(job) => {
                        record_claimed(job.job_type);
                        info!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            agent_id = %agent_id,
                            priority = job.priority,
                            "Job claimed"
                        );
                        self.publish_state(&job);
                        return Ok(Some(job));
                    }
                    Err(e) if e.is_conflict() || e.is_not_found() => {
                        debug!(job_id = %candidate.id, "Lost claim race, trying next candidate");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * (attempt as u64 + 1))).await;
        }

        warn!(agent_id = %agent_id, attempts, "Claim failed after repeated conflicts");
        Err(SchedulerError::Conflict("claim".to_string()))
    }

    /// Public payload with a parent-output input replaced by the location
    /// the parent's result was stored at.
    pub async fn resolve_input(&self, job: &JobRecord) -> SchedulerResult<serde_json::Value> {
        let Some(parent_id) = parent_input(&job.public_payload) else {
            return Ok(job.public_payload.clone());
        };

        let parent = self.jobs.get(&parent_id).await?;
        let location = parent
            .private_payload
            .output_location
            .as_deref()
            .filter(|_| parent.state == JobState::Completed)
            .ok_or_else(|| {
                SchedulerError::not_found(format!("output of parent job {}", parent_id))
            })?;

        Ok(resolve_parent_input(&job.public_payload, location))
    }

    /// Record progress and, for live jobs, apply a chunk operation.
    pub async fn update(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        progress: Option<u8>,
        chunk: Option<&LiveChunkUpdate>,
    ) -> SchedulerResult<UpdateAck> {
        if progress.is_some_and(|p| p > 100) {
            return Err(SchedulerError::validation("progress must be between 0 and 100"));
        }

        let check = |current: &JobRecord| -> SchedulerResult<bool> {
            if matches!(current.state, JobState::Completing | JobState::Completed) {
                debug!(job_id = %current.id, "Update after success ignored");
                return Ok(false);
            }
            require_lease(current, token, "update")?;
            if chunk.is_some() && !current.job_type.is_live() {
                return Err(SchedulerError::validation(format!(
                    "chunk updates are not accepted for {}",
                    current.job_type
                )));
            }
            Ok(true)
        };
        let mutation = |j: &mut JobRecord| {
            if let Some(p) = progress {
                j.progress = Some(p);
            }
        };

        let Some(job) = self.modify(job_id, "update", check, &mutation).await? else {
            return Ok(UpdateAck::Ignored);
        };

        let change = match chunk {
            Some(update) => {
                let change = self.live.apply(&job.id, update);
                self.results.on_live_chunk(&job, update, &change).await?;
                Some(change)
            }
            None => None,
        };

        Ok(UpdateAck::Applied {
            progress: job.progress,
            chunk: change,
        })
    }

    /// Accept a job's result and release its children.
    pub async fn complete(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        result: &SuccessPayload,
    ) -> SchedulerResult<()> {
        let check = |current: &JobRecord| -> SchedulerResult<bool> {
            require_lease(current, token, "complete")?;
            if !result.fits(current.job_type) {
                return Err(SchedulerError::validation(format!(
                    "result does not match job type {}",
                    current.job_type
                )));
            }
            Ok(true)
        };
        let location = result.output_location().map(str::to_string);
        let mutation = |j: &mut JobRecord| {
            j.clear_lease();
            j.state = JobState::Completing;
            j.progress = Some(100);
            j.private_payload.output_location = location.clone();
        };

        let job = self
            .modify(job_id, "complete", check, &mutation)
            .await?
            .ok_or_else(|| SchedulerError::InvalidLease(job_id.clone()))?;
        self.publish_state(&job);

        match self.results.on_success(&job, result).await {
            Ok(()) => {
                if let Some(done) = self
                    .transition(job_id, "complete", &[JobState::Completing], JobState::Completed, None)
                    .await?
                {
                    record_completed(done.job_type);
                    info!(job_id = %done.id, job_type = %done.job_type, "Job completed");
                    let released = self
                        .cascade(job_id, &[JobState::WaitingForParent], JobState::Pending)
                        .await?;
                    if released > 0 {
                        debug!(job_id = %done.id, released, "Children released");
                    }
                }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Result handler failed");
                let message = e.to_string();
                if self
                    .transition(
                        job_id,
                        "complete",
                        &[JobState::Completing],
                        JobState::Errored,
                        Some(&message),
                    )
                    .await?
                    .is_some()
                {
                    record_failed(job.job_type, true);
                    self.cascade(job_id, CASCADE_FROM, JobState::ParentErrored).await?;
                }
            }
        }

        self.on_terminal(&job).await
    }

    /// Report a failure, spending one unit of the configured retry budget.
    pub async fn fail(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        reason: &str,
    ) -> SchedulerResult<FailOutcome> {
        self.fail_with_budget(job_id, token, reason, self.config.max_failures)
            .await
    }

    /// Report a failure; the job becomes terminal once `max_failures` is reached.
    /// Live jobs are never retried.
    pub async fn fail_with_budget(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        reason: &str,
        max_failures: u32,
    ) -> SchedulerResult<FailOutcome> {
        let check = |current: &JobRecord| -> SchedulerResult<bool> {
            require_lease(current, token, "fail")
        };
        let mutation = |j: &mut JobRecord| {
            j.failure_count += 1;
            j.set_last_error(reason);
            if j.job_type.is_live() || j.failure_count >= max_failures {
                j.finish(JobState::Errored);
            } else {
                j.reset_to_pending();
            }
        };

        let job = self
            .modify(job_id, "fail", check, &mutation)
            .await?
            .ok_or_else(|| SchedulerError::InvalidLease(job_id.clone()))?;

        let outcome = self.after_failure(&job, "fail").await?;
        record_failed(job.job_type, outcome == FailOutcome::Errored);
        Ok(outcome)
    }

    /// Give a job back. VOD jobs return to `Pending` without spending the
    /// retry budget; live jobs end.
    pub async fn abort(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        reason: &str,
    ) -> SchedulerResult<FailOutcome> {
        let check = |current: &JobRecord| -> SchedulerResult<bool> {
            require_lease(current, token, "abort")
        };
        let mutation = |j: &mut JobRecord| {
            j.set_last_error(reason);
            if j.job_type.is_live() {
                j.finish(JobState::Errored);
            } else {
                j.reset_to_pending();
            }
        };

        let job = self
            .modify(job_id, "abort", check, &mutation)
            .await?
            .ok_or_else(|| SchedulerError::InvalidLease(job_id.clone()))?;

        self.after_failure(&job, "abort").await
    }

    /// Reclaim the lease of a job whose holder stopped reporting.
    ///
    /// Returns `Ok(None)` when the lease changed since `job` was read.
    pub async fn expire_lease(&self, job: &JobRecord) -> SchedulerResult<Option<FailOutcome>> {
        let Some(token) = job.lease_token.as_ref() else {
            return Ok(None);
        };

        match self.fail(&job.id, token, LEASE_EXPIRED_REASON).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(SchedulerError::InvalidLease(_)) | Err(SchedulerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// End a job stuck in `Completing` as `Errored` and error its children.
    ///
    /// Returns false when the job left `Completing` since it was read.
    pub async fn expire_completing(&self, job: &JobRecord) -> SchedulerResult<bool> {
        let Some(errored) = self
            .transition(
                &job.id,
                "expire-completing",
                &[JobState::Completing],
                JobState::Errored,
                Some(RESULT_NOT_RECORDED_REASON),
            )
            .await?
        else {
            return Ok(false);
        };

        record_failed(errored.job_type, true);
        warn!(
            job_id = %errored.id,
            job_type = %errored.job_type,
            since = %job.updated_at,
            "Result was never recorded, job errored"
        );
        self.cascade(&errored.id, CASCADE_FROM, JobState::ParentErrored).await?;
        self.on_terminal(&errored).await?;
        Ok(true)
    }

    /// Cancel a job and its waiting children. Not lease-gated.
    ///
    /// Returns `None` when the job was already terminal.
    pub async fn cancel(&self, job_id: &JobId, reason: &str) -> SchedulerResult<Option<JobRecord>> {
        let check = |current: &JobRecord| -> SchedulerResult<bool> {
            if current.state.is_cancellable() {
                Ok(true)
            } else if current.state.is_terminal() {
                Ok(false)
            } else {
                Err(SchedulerError::InvalidTransition {
                    id: current.id.clone(),
                    state: current.state,
                })
            }
        };
        let mutation = |j: &mut JobRecord| {
            j.set_last_error(reason);
            j.finish(JobState::Cancelled);
        };

        let Some(job) = self.modify(job_id, "cancel", check, &mutation).await? else {
            return Ok(None);
        };

        record_cancelled(job.job_type);
        info!(job_id = %job.id, job_type = %job.job_type, reason, "Job cancelled");
        self.publish_state(&job);

        self.cascade(job_id, CASCADE_FROM, JobState::ParentCancelled).await?;
        self.on_terminal(&job).await?;
        Ok(Some(job))
    }

    /// Cancel every non-terminal job of a video, optionally only some types.
    ///
    /// Returns the ids cancelled directly; cascaded children are not listed.
    pub async fn cancel_batch(
        &self,
        video_key: &str,
        types: Option<&[JobType]>,
        reason: &str,
    ) -> SchedulerResult<Vec<JobId>> {
        let mut targets: Vec<JobRecord> = self
            .jobs
            .list_for_video(video_key)
            .await?
            .into_iter()
            .filter(|j| j.state.is_cancellable())
            .filter(|j| types.map_or(true, |t| t.contains(&j.job_type)))
            .collect();
        // Parents first so their children are cascaded instead of cancelled.
        targets.sort_by_key(|j| j.depends_on_job_id.is_some());

        let mut cancelled = Vec::new();
        for job in targets {
            match self.cancel(&job.id, reason).await {
                Ok(Some(done)) => cancelled.push(done.id),
                Ok(None) => {}
                Err(SchedulerError::InvalidTransition { .. }) | Err(SchedulerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(video_key, cancelled = cancelled.len(), "Batch cancelled");
        Ok(cancelled)
    }

    /// Remove a job, cancelling it first when it is still cancellable.
    pub async fn delete(&self, job_id: &JobId) -> SchedulerResult<()> {
        let job = self.jobs.get(job_id).await?;

        if job.state.is_cancellable() {
            self.cancel(job_id, "deleted").await?;
        } else if job.state == JobState::Completing {
            return Err(SchedulerError::InvalidTransition {
                id: job.id,
                state: job.state,
            });
        }

        self.jobs.delete(job_id).await?;
        self.live.remove_job(job_id);
        info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    /// Bounded read-modify-write. `check` inspects each fresh read:
    /// `Ok(false)` skips the write, an error aborts without writing.
    async fn modify<C>(
        &self,
        job_id: &JobId,
        op: &'static str,
        check: C,
        mutation: JobMutation<'_>,
    ) -> SchedulerResult<Option<JobRecord>>
    where
        C: Fn(&JobRecord) -> SchedulerResult<bool>,
    {
        let attempts = self.config.claim_attempts.max(1);

        for attempt in 0..attempts {
            let current = self.jobs.get(job_id).await?;
            if !check(&current)? {
                return Ok(None);
            }

            match self.jobs.update(job_id, current.version, mutation).await {
                Ok(written) => return Ok(Some(written)),
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %job_id, op, attempt = attempt + 1, "Version conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        RETRY_BASE_DELAY_MS * (attempt as u64 + 1),
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(job_id = %job_id, op, attempts, "Giving up after repeated version conflicts");
        Err(SchedulerError::Conflict(format!("{} on job {}", op, job_id)))
    }

    /// Move a job from one of `from` to `to`, if it is still in `from`.
    async fn transition(
        &self,
        job_id: &JobId,
        op: &'static str,
        from: &[JobState],
        to: JobState,
        reason: Option<&str>,
    ) -> SchedulerResult<Option<JobRecord>> {
        let check = |current: &JobRecord| -> SchedulerResult<bool> {
            Ok(from.contains(&current.state))
        };
        let mutation = |j: &mut JobRecord| {
            if let Some(reason) = reason {
                j.set_last_error(reason);
            }
            if to.is_terminal() {
                j.finish(to);
            } else {
                j.state = to;
            }
        };

        let moved = self.modify(job_id, op, check, &mutation).await?;
        if let Some(job) = &moved {
            self.publish_state(job);
        }
        Ok(moved)
    }

    /// Move every direct child in one of `from` to `to`. Returns how many moved.
    async fn cascade(&self, parent: &JobId, from: &[JobState], to: JobState) -> SchedulerResult<usize> {
        let children = self.jobs.list_children_of(parent).await?;
        let mut moved = 0;

        for child in children.iter().filter(|c| from.contains(&c.state)) {
            if self.transition(&child.id, "cascade", from, to, None).await?.is_some() {
                moved += 1;
                debug!(job_id = %child.id, parent = %parent, state = %to, "Cascaded to child");
            }
        }

        Ok(moved)
    }

    async fn after_failure(&self, job: &JobRecord, op: &'static str) -> SchedulerResult<FailOutcome> {
        self.publish_state(job);

        if job.state == JobState::Errored {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                failures = job.failure_count,
                error = job.last_error.as_deref().unwrap_or_default(),
                op,
                "Job errored"
            );
            self.cascade(&job.id, CASCADE_FROM, JobState::ParentErrored).await?;
            self.on_terminal(job).await?;
            Ok(FailOutcome::Errored)
        } else {
            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                failures = job.failure_count,
                op,
                "Job returned to pending"
            );
            Ok(FailOutcome::Retrying)
        }
    }

    /// Cleanup once a job can make no further progress.
    async fn on_terminal(&self, job: &JobRecord) -> SchedulerResult<()> {
        if job.job_type.is_live() {
            self.live.remove_job(&job.id);
        }
        self.check_input_release(job).await
    }

    /// Signal input release once the owning main job completed and every
    /// sibling main of its batch is terminal. Fires at most once per batch.
    async fn check_input_release(&self, job: &JobRecord) -> SchedulerResult<()> {
        if job.depends_on_job_id.is_some() {
            return Ok(());
        }
        let Some(batch_id) = job.private_payload.batch_id.as_deref() else {
            return Ok(());
        };

        let mains: Vec<JobRecord> = self
            .jobs
            .list_for_video(&job.private_payload.video_key)
            .await?
            .into_iter()
            .filter(|j| j.depends_on_job_id.is_none())
            .filter(|j| j.private_payload.batch_id.as_deref() == Some(batch_id))
            .collect();

        let Some(owner) = mains.iter().find(|j| j.private_payload.delete_input_file) else {
            return Ok(());
        };
        if owner.state != JobState::Completed
            || owner.private_payload.input_released
            || !mains.iter().all(|j| j.is_terminal())
        {
            return Ok(());
        }

        let check = |current: &JobRecord| -> SchedulerResult<bool> {
            Ok(current.state == JobState::Completed && !current.private_payload.input_released)
        };
        let mutation = |j: &mut JobRecord| {
            j.private_payload.input_released = true;
        };

        if let Some(owner) = self.modify(&owner.id, "release-input", check, &mutation).await? {
            info!(
                job_id = %owner.id,
                video_key = %owner.private_payload.video_key,
                "Original input can be released"
            );
            self.events.publish(JobEvent::InputReleasable {
                job_id: owner.id.clone(),
                video_key: owner.private_payload.video_key.clone(),
            });
        }

        Ok(())
    }

    fn publish_state(&self, job: &JobRecord) {
        self.events.publish(JobEvent::StateChanged {
            job_id: job.id.clone(),
            job_type: job.job_type,
            video_key: job.private_payload.video_key.clone(),
            state: job.state,
        });
    }
}

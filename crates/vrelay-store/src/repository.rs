//! Repository traits.
//!
//! Pure data access: no scheduling policy lives behind these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vrelay_models::{Agent, AgentId, JobId, JobRecord, JobState, JobType, RunnerToken};

use crate::error::StoreResult;

/// Mutation applied to a job inside [`JobRepository::update`].
pub type JobMutation<'a> = &'a (dyn Fn(&mut JobRecord) + Send + Sync);

/// Filter for administrative job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub states: Option<Vec<JobState>>,
    pub job_type: Option<JobType>,
    pub video_key: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobRecord) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&job.state) {
                return false;
            }
        }
        if let Some(ty) = self.job_type {
            if job.job_type != ty {
                return false;
            }
        }
        if let Some(key) = &self.video_key {
            if &job.private_payload.video_key != key {
                return false;
            }
        }
        true
    }
}

/// One page of a listing plus the total match count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Persistence for job records.
///
/// Every successful write bumps the record's `version`; `update` fails with
/// [`StoreError::Conflict`](crate::StoreError::Conflict) when the caller's
/// expected version is stale.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new record.
    async fn create(&self, record: JobRecord) -> StoreResult<JobId>;

    async fn get(&self, id: &JobId) -> StoreResult<JobRecord>;

    /// Pending jobs, ordered by priority then creation time, at most `limit`.
    async fn list_pending(
        &self,
        types: Option<&[JobType]>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>>;

    /// Processing jobs whose last lease activity is older than `older_than`.
    ///
    /// Lease activity is the lease start or the latest write under the lease,
    /// whichever is later.
    async fn list_stale(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<JobRecord>>;

    async fn list_children_of(&self, id: &JobId) -> StoreResult<Vec<JobRecord>>;

    async fn list_for_video(&self, video_key: &str) -> StoreResult<Vec<JobRecord>>;

    /// Filtered listing, newest first.
    async fn list(&self, filter: &JobFilter) -> StoreResult<Page<JobRecord>>;

    /// Apply `mutation` if the stored version equals `expected_version`.
    ///
    /// Returns the record as written.
    async fn update(
        &self,
        id: &JobId,
        expected_version: u64,
        mutation: JobMutation<'_>,
    ) -> StoreResult<JobRecord>;

    async fn delete(&self, id: &JobId) -> StoreResult<()>;
}

/// Persistence for remote agent registrations.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert a new agent. Names are unique.
    async fn register(&self, agent: Agent) -> StoreResult<Agent>;

    async fn get_agent(&self, id: &AgentId) -> StoreResult<Agent>;

    async fn get_by_token(&self, token: &RunnerToken) -> StoreResult<Agent>;

    /// Set `last_seen_at`.
    async fn touch(&self, id: &AgentId, at: DateTime<Utc>) -> StoreResult<()>;

    async fn unregister(&self, id: &AgentId) -> StoreResult<()>;

    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
}

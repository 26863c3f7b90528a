//! In-memory store.
//!
//! Records live in `RwLock`-guarded maps. The whole store can be written to
//! and restored from a JSON snapshot so a single-node deployment survives
//! restarts.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use vrelay_models::{Agent, AgentId, JobId, JobRecord, JobState, JobType, RunnerToken};

use crate::error::{StoreError, StoreResult};
use crate::repository::{AgentRepository, JobFilter, JobMutation, JobRepository, Page};

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub jobs: Vec<JobRecord>,
    pub agents: Vec<Agent>,
}

/// In-memory job and agent store.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    agents: RwLock<HashMap<AgentId, Agent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let jobs = snapshot
            .jobs
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        let agents = snapshot
            .agents
            .into_iter()
            .map(|agent| (agent.id.clone(), agent))
            .collect();

        Self {
            jobs: RwLock::new(jobs),
            agents: RwLock::new(agents),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let mut jobs: Vec<JobRecord> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let agents = self.agents.read().await.values().cloned().collect();
        Snapshot { jobs, agents }
    }

    /// Load a store from `path`. A missing file yields an empty store.
    pub async fn load(path: &Path) -> StoreResult<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    jobs = snapshot.jobs.len(),
                    agents = snapshot.agents.len(),
                    "Loaded store snapshot"
                );
                Ok(Self::from_snapshot(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the store to `path`, replacing it atomically.
    pub async fn save(&self, path: &Path) -> StoreResult<()> {
        let snapshot = self.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(path = %path.display(), jobs = snapshot.jobs.len(), "Saved store snapshot");
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create(&self, record: JobRecord) -> StoreResult<JobId> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.id) {
            return Err(StoreError::already_exists(record.id.as_str()));
        }
        let id = record.id.clone();
        jobs.insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> StoreResult<JobRecord> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id.as_str()))
    }

    async fn list_pending(
        &self,
        types: Option<&[JobType]>,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        let mut pending: Vec<JobRecord> = jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .filter(|job| types.map_or(true, |t| t.contains(&job.job_type)))
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_stale(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.state == JobState::Processing)
            .filter(|job| job.last_lease_activity().is_some_and(|t| t < older_than))
            .cloned()
            .collect())
    }

    async fn list_children_of(&self, id: &JobId) -> StoreResult<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| job.depends_on_job_id.as_ref() == Some(id))
            .cloned()
            .collect())
    }

    async fn list_for_video(&self, video_key: &str) -> StoreResult<Vec<JobRecord>> {
        let jobs = self.jobs.read().await;
        let mut found: Vec<JobRecord> = jobs
            .values()
            .filter(|job| job.private_payload.video_key == video_key)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn list(&self, filter: &JobFilter) -> StoreResult<Page<JobRecord>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<JobRecord> =
            jobs.values().filter(|job| filter.matches(job)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(Page { items, total })
    }

    async fn update(
        &self,
        id: &JobId,
        expected_version: u64,
        mutation: JobMutation<'_>,
    ) -> StoreResult<JobRecord> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id.as_str()))?;

        if current.version != expected_version {
            debug!(
                job_id = %id,
                expected = expected_version,
                actual = current.version,
                "Job version conflict"
            );
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = current.clone();
        mutation(&mut next);
        next.id = id.clone();
        next.version = expected_version + 1;
        next.updated_at = Utc::now();

        *current = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: &JobId) -> StoreResult<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(id.as_str()))
    }
}

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn register(&self, agent: Agent) -> StoreResult<Agent> {
        let mut agents = self.agents.write().await;
        if agents.values().any(|a| a.name == agent.name) {
            return Err(StoreError::already_exists(agent.name));
        }
        agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: &AgentId) -> StoreResult<Agent> {
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id.as_str()))
    }

    async fn get_by_token(&self, token: &RunnerToken) -> StoreResult<Agent> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| &a.runner_token == token)
            .cloned()
            .ok_or_else(|| StoreError::not_found("runner token"))
    }

    async fn touch(&self, id: &AgentId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id.as_str()))?;
        agent.last_seen_at = at;
        Ok(())
    }

    async fn unregister(&self, id: &AgentId) -> StoreResult<()> {
        self.agents
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(id.as_str()))
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vrelay_models::PrivatePayload;

    fn job(priority: i32, video: &str) -> JobRecord {
        JobRecord::new(
            JobType::VodHls,
            serde_json::json!({}),
            PrivatePayload::for_video(video),
            priority,
            None,
        )
    }

    #[tokio::test]
    async fn test_list_pending_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        let mut older = job(100, "v1");
        older.created_at = Utc::now() - Duration::seconds(10);
        let newer = job(100, "v1");
        let urgent = job(50, "v1");

        let older_id = store.create(older).await.unwrap();
        let newer_id = store.create(newer).await.unwrap();
        let urgent_id = store.create(urgent).await.unwrap();

        let pending = store.list_pending(None, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec![urgent_id, older_id, newer_id]);

        let page = store.list_pending(None, 1).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_list_pending_filters_types() {
        let store = MemoryStore::new();
        store.create(job(100, "v1")).await.unwrap();

        let none = store
            .list_pending(Some(&[JobType::VodWebVideo]), 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        let some = store.list_pending(Some(&[JobType::VodHls]), 10).await.unwrap();
        assert_eq!(some.len(), 1);
    }

    #[tokio::test]
    async fn test_update_detects_version_conflict() {
        let store = MemoryStore::new();
        let id = store.create(job(100, "v1")).await.unwrap();

        let read = store.get(&id).await.unwrap();
        let written = store
            .update(&id, read.version, &|j: &mut JobRecord| j.priority = 10)
            .await
            .unwrap();
        assert_eq!(written.version, read.version + 1);
        assert_eq!(written.priority, 10);

        let err = store
            .update(&id, read.version, &|j: &mut JobRecord| j.priority = 20)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(&id).await.unwrap().priority, 10);
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = MemoryStore::new();
        let err = store
            .update(&JobId::new(), 0, &|_: &mut JobRecord| {})
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_stale_uses_last_activity() {
        let store = MemoryStore::new();
        let id = store.create(job(100, "v1")).await.unwrap();
        store
            .update(&id, 0, &|j: &mut JobRecord| {
                j.start_lease(AgentId::new());
            })
            .await
            .unwrap();

        let soon = Utc::now() + Duration::seconds(61);
        assert_eq!(store.list_stale(soon).await.unwrap().len(), 1);

        let earlier = Utc::now() - Duration::seconds(60);
        assert!(store.list_stale(earlier).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_children_and_filtered_listing() {
        let store = MemoryStore::new();
        let parent = job(100, "v1");
        let parent_id = parent.id.clone();
        store.create(parent).await.unwrap();

        let child = JobRecord::new(
            JobType::VodHls,
            serde_json::json!({}),
            PrivatePayload::for_video("v1"),
            100,
            Some(parent_id.clone()),
        );
        store.create(child).await.unwrap();
        store.create(job(100, "v2")).await.unwrap();

        assert_eq!(store.list_children_of(&parent_id).await.unwrap().len(), 1);
        assert_eq!(store.list_for_video("v1").await.unwrap().len(), 2);

        let filter = JobFilter {
            states: Some(vec![JobState::WaitingForParent]),
            ..Default::default()
        };
        let page = store.list(&filter).await.unwrap();
        assert_eq!(page.total, 1);

        let paged = store
            .list(&JobFilter {
                offset: 1,
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.total, 3);
        assert_eq!(paged.items.len(), 1);
    }

    #[tokio::test]
    async fn test_agent_names_are_unique() {
        let store = MemoryStore::new();
        let agent = store.register(Agent::new("runner", None, "reg")).await.unwrap();
        assert!(store.register(Agent::new("runner", None, "reg")).await.is_err());

        let found = store.get_by_token(&agent.runner_token).await.unwrap();
        assert_eq!(found.id, agent.id);

        store.unregister(&agent.id).await.unwrap();
        assert!(store.get_by_token(&agent.runner_token).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        let id = store.create(job(100, "v1")).await.unwrap();
        store.register(Agent::new("runner", None, "reg")).await.unwrap();
        store.save(&path).await.unwrap();

        let restored = MemoryStore::load(&path).await.unwrap();
        assert_eq!(restored.get(&id).await.unwrap().id, id);
        assert_eq!(restored.list_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::load(&dir.path().join("absent.json")).await.unwrap();
        assert!(store.list_pending(None, 10).await.unwrap().is_empty());
    }
}

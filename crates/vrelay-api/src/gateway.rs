//! Runner protocol gateway.
//!
//! Authenticates remote agents, validates their payloads against the job
//! type and forwards to the lease manager. Stale lease tokens are answered
//! as success so that retried network calls stay idempotent.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use validator::Validate;

use vrelay_models::{
    Agent, FailureReport, JobId, JobRecord, JobType, LeaseToken, LiveChunkUpdate, RunnerJobView,
    RunnerToken, SuccessPayload,
};
use vrelay_scheduler::{metrics::record_lease_rejection, LeaseManager, SchedulerError, SchedulerResult};
use vrelay_store::AgentRepository;

use crate::error::{ApiError, ApiResult};

/// Maximum length of an agent name.
pub const MAX_AGENT_NAME_LENGTH: usize = 64;

/// Boundary between remote agents and the scheduler.
pub struct RunnerGateway {
    agents: Arc<dyn AgentRepository>,
    leases: Arc<LeaseManager>,
    registration_tokens: Vec<String>,
}

impl RunnerGateway {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        leases: Arc<LeaseManager>,
        registration_tokens: Vec<String>,
    ) -> Self {
        Self {
            agents,
            leases,
            registration_tokens,
        }
    }

    /// Register a new agent. The registration token must be one of the
    /// configured tokens and the name must not be taken.
    pub async fn register(
        &self,
        registration_token: &str,
        name: &str,
        description: Option<String>,
    ) -> ApiResult<Agent> {
        if !self.registration_tokens.iter().any(|t| t == registration_token) {
            warn!(agent = name, "Runner registration with unknown token");
            return Err(ApiError::unauthorized("Invalid registration token"));
        }

        let name = name.trim();
        if name.is_empty() || name.len() > MAX_AGENT_NAME_LENGTH {
            return Err(ApiError::Validation(format!(
                "name must be between 1 and {} characters",
                MAX_AGENT_NAME_LENGTH
            )));
        }

        let agent = self
            .agents
            .register(Agent::new(name, description, registration_token))
            .await?;

        info!(agent = %agent.name, agent_id = %agent.id, "Runner registered");
        Ok(agent)
    }

    pub async fn unregister(&self, runner_token: &str) -> ApiResult<()> {
        let agent = self.authenticate(runner_token).await?;
        self.agents.unregister(&agent.id).await?;
        info!(agent = %agent.name, agent_id = %agent.id, "Runner unregistered");
        Ok(())
    }

    /// Resolve the agent presenting `runner_token` and refresh its
    /// `last_seen_at`, writing at most once per contact interval.
    pub async fn authenticate(&self, runner_token: &str) -> ApiResult<Agent> {
        let agent = match self.agents.get_by_token(&RunnerToken::from(runner_token)).await {
            Ok(agent) => agent,
            Err(e) if e.is_not_found() => return Err(ApiError::unauthorized("Unknown runner token")),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let interval = chrono::Duration::from_std(self.leases.config().last_contact_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        if now - agent.last_seen_at >= interval {
            self.agents.touch(&agent.id, now).await?;
        }

        Ok(agent)
    }

    /// Job types remote agents may currently claim.
    pub fn list_job_types(&self) -> &[JobType] {
        &self.leases.config().remote_job_types
    }

    /// Lease a job for `agent`. `accepted` is narrowed to the remotely
    /// enabled types.
    pub async fn claim(
        &self,
        agent: &Agent,
        accepted: Option<&[JobType]>,
    ) -> ApiResult<Option<RunnerJobView>> {
        let enabled = self.list_job_types();
        let types: Vec<JobType> = match accepted {
            Some(types) => types.iter().copied().filter(|t| enabled.contains(t)).collect(),
            None => enabled.to_vec(),
        };
        if types.is_empty() {
            return Ok(None);
        }

        let Some(job) = self.leases.claim(&agent.id, Some(&types)).await? else {
            return Ok(None);
        };
        let view = RunnerJobView::from_leased(&job)
            .ok_or_else(|| ApiError::internal("claimed job has no lease"))?;

        match self.leases.resolve_input(&job).await {
            Ok(payload) => Ok(Some(view.with_payload(payload))),
            Err(e) => {
                // The agent never saw the job; hand it back through the retry budget.
                warn!(job_id = %job.id, error = %e, "Cannot resolve job input");
                self.leases
                    .fail(&job.id, &view.lease_token, &e.to_string())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Progress report or live chunk operation.
    pub async fn update(
        &self,
        agent: &Agent,
        job_id: &JobId,
        lease_token: &LeaseToken,
        progress: Option<u8>,
        payload: Option<serde_json::Value>,
    ) -> ApiResult<()> {
        let chunk = payload.map(LiveChunkUpdate::parse).transpose()?;

        if !self.owns(agent, job_id, "update").await? {
            return Ok(());
        }

        let result = self
            .leases
            .update(job_id, lease_token, progress, chunk.as_ref())
            .await;
        accept_stale(result, job_id, "update")
    }

    /// Validate a result for the job's type and complete the job.
    pub async fn success(
        &self,
        agent: &Agent,
        job_id: &JobId,
        lease_token: &LeaseToken,
        payload: serde_json::Value,
    ) -> ApiResult<()> {
        let job = self.leases.get(job_id).await?;
        let result = SuccessPayload::parse(job.job_type, payload)?;

        if !self.check_owner(agent, &job, "complete") {
            return Ok(());
        }

        let outcome = self.leases.complete(job_id, lease_token, &result).await;
        accept_stale(outcome, job_id, "complete")
    }

    pub async fn error(
        &self,
        agent: &Agent,
        job_id: &JobId,
        lease_token: &LeaseToken,
        report: &FailureReport,
    ) -> ApiResult<()> {
        report.validate()?;

        if !self.owns(agent, job_id, "fail").await? {
            return Ok(());
        }

        let outcome = self.leases.fail(job_id, lease_token, &report.reason).await;
        accept_stale(outcome, job_id, "fail")
    }

    pub async fn abort(
        &self,
        agent: &Agent,
        job_id: &JobId,
        lease_token: &LeaseToken,
        report: &FailureReport,
    ) -> ApiResult<()> {
        report.validate()?;

        if !self.owns(agent, job_id, "abort").await? {
            return Ok(());
        }

        let outcome = self.leases.abort(job_id, lease_token, &report.reason).await;
        accept_stale(outcome, job_id, "abort")
    }

    async fn owns(&self, agent: &Agent, job_id: &JobId, op: &'static str) -> ApiResult<bool> {
        let job = self.leases.get(job_id).await?;
        Ok(self.check_owner(agent, &job, op))
    }

    /// A job leased to another agent is treated like a stale lease. Jobs
    /// without an owner are left to the lease check.
    fn check_owner(&self, agent: &Agent, job: &JobRecord, op: &'static str) -> bool {
        match &job.owner_agent_id {
            Some(owner) if owner != &agent.id => {}
            _ => return true,
        }

        record_lease_rejection(op);
        warn!(
            job_id = %job.id,
            agent = %agent.name,
            state = %job.state,
            op,
            "Runner call for a job it does not hold, ignoring"
        );
        false
    }
}

/// Map `InvalidLease` to success; everything else passes through.
fn accept_stale<T>(result: SchedulerResult<T>, job_id: &JobId, op: &'static str) -> ApiResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(SchedulerError::InvalidLease(_)) => {
            info!(job_id = %job_id, op, "Stale lease acknowledged without effect");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vrelay_models::{JobState, PrivatePayload};
    use vrelay_scheduler::{EventBus, LoggingResultHandler, SchedulerConfig};
    use vrelay_store::{JobRepository, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: RunnerGateway,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            Arc::new(config),
            EventBus::new(16),
            Arc::new(LoggingResultHandler),
        ));
        let gateway = RunnerGateway::new(store.clone(), leases, vec!["reg-secret".to_string()]);
        Fixture { store, gateway }
    }

    async fn pending(store: &MemoryStore, job_type: JobType) -> JobId {
        let payload = json!({ "input": { "url": "https://cdn/in.mp4" }, "output": { "resolution": 720, "fps": 30 } });
        let job = JobRecord::new(job_type, payload, PrivatePayload::for_video("video-1"), 100, None);
        store.create(job).await.unwrap()
    }

    fn hls_result() -> serde_json::Value {
        json!({
            "videoFile": { "filename": "720-fragmented.mp4", "location": "s3://out/720-fragmented.mp4" },
            "resolutionPlaylistFile": { "filename": "720.m3u8", "location": "s3://out/720.m3u8" },
        })
    }

    #[tokio::test]
    async fn test_register_requires_known_token() {
        let f = fixture(SchedulerConfig::default());

        let err = f.gateway.register("nope", "runner-1", None).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let agent = f.gateway.register("reg-secret", "runner-1", None).await.unwrap();
        let again = f.gateway.authenticate(agent.runner_token.as_str()).await.unwrap();
        assert_eq!(again.id, agent.id);

        let dup = f.gateway.register("reg-secret", "runner-1", None).await.unwrap_err();
        assert!(matches!(dup, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_remote_agent_claims_child_after_parent_succeeded() {
        use vrelay_models::ProbeResult;
        use vrelay_scheduler::{DependencyBuilder, OptimizeRequest, PriorityWeight};

        let config = SchedulerConfig {
            enabled_resolutions: vec![1080, 720],
            hls_enabled: false,
            web_video_enabled: true,
            ..Default::default()
        };
        let f = fixture(config.clone());
        let builder = DependencyBuilder::new(f.store.clone(), Arc::new(config), EventBus::new(16));
        let built = builder
            .create_optimize_jobs(&OptimizeRequest {
                video_key: "video-1".to_string(),
                source_url: "https://cdn/in.mp4".to_string(),
                preview_url: None,
                probe: ProbeResult::video(1080, 30.0, true),
                priority: PriorityWeight::Normal,
                is_new_video: true,
            })
            .await
            .unwrap();
        assert_eq!((built.mains.len(), built.children.len()), (1, 1));
        let main_id = built.mains[0].id.clone();

        let agent = f.gateway.register("reg-secret", "runner-1", None).await.unwrap();
        let main = f.gateway.claim(&agent, None).await.unwrap().unwrap();
        assert_eq!(main.id, main_id);
        f.gateway
            .success(
                &agent,
                &main.id,
                &main.lease_token,
                json!({ "videoFile": { "filename": "1080.mp4", "location": "https://storage.example/out/1080.mp4" } }),
            )
            .await
            .unwrap();

        let child = f.gateway.claim(&agent, None).await.unwrap().unwrap();
        assert_eq!(
            child.payload["input"],
            json!({ "kind": "source", "url": "https://storage.example/out/1080.mp4" })
        );
        assert_eq!(child.payload["output"]["resolution"], 720);
        assert!(!child.payload.to_string().contains(main_id.as_str()));
    }

    #[tokio::test]
    async fn test_claim_only_remote_enabled_types() {
        let f = fixture(SchedulerConfig {
            remote_job_types: vec![JobType::VodHls],
            ..Default::default()
        });
        pending(&f.store, JobType::VodWebVideo).await;
        let agent = f.gateway.register("reg-secret", "runner-1", None).await.unwrap();

        assert_eq!(f.gateway.list_job_types(), &[JobType::VodHls]);
        assert!(f.gateway.claim(&agent, None).await.unwrap().is_none());
        assert!(f
            .gateway
            .claim(&agent, Some(&[JobType::VodWebVideo]))
            .await
            .unwrap()
            .is_none());

        let hls = pending(&f.store, JobType::VodHls).await;
        let view = f.gateway.claim(&agent, None).await.unwrap().unwrap();
        assert_eq!(view.id, hls);
    }

    #[tokio::test]
    async fn test_success_validates_before_mutation() {
        let f = fixture(SchedulerConfig::default());
        let id = pending(&f.store, JobType::VodHls).await;
        let agent = f.gateway.register("reg-secret", "runner-1", None).await.unwrap();
        let view = f.gateway.claim(&agent, None).await.unwrap().unwrap();

        let bad = json!({ "videoFile": { "filename": "../720.mp4", "location": "x" } });
        let err = f.gateway.success(&agent, &id, &view.lease_token, bad).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(f.store.get(&id).await.unwrap().state, JobState::Processing);

        f.gateway.success(&agent, &id, &view.lease_token, hls_result()).await.unwrap();
        assert_eq!(f.store.get(&id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_stale_token_is_acknowledged_without_effect() {
        let f = fixture(SchedulerConfig::default());
        let id = pending(&f.store, JobType::VodHls).await;
        let agent = f.gateway.register("reg-secret", "runner-1", None).await.unwrap();
        let first = f.gateway.claim(&agent, None).await.unwrap().unwrap();

        f.gateway
            .abort(&agent, &id, &first.lease_token, &FailureReport::new("restarting"))
            .await
            .unwrap();
        let second = f.gateway.claim(&agent, None).await.unwrap().unwrap();
        assert_ne!(first.lease_token, second.lease_token);

        f.gateway
            .error(&agent, &id, &first.lease_token, &FailureReport::new("late"))
            .await
            .unwrap();
        let job = f.store.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.failure_count, 0);
    }

    #[tokio::test]
    async fn test_calls_for_foreign_jobs_are_ignored() {
        let f = fixture(SchedulerConfig::default());
        let id = pending(&f.store, JobType::VodHls).await;
        let owner = f.gateway.register("reg-secret", "runner-1", None).await.unwrap();
        let other = f.gateway.register("reg-secret", "runner-2", None).await.unwrap();
        let view = f.gateway.claim(&owner, None).await.unwrap().unwrap();

        f.gateway
            .error(&other, &id, &view.lease_token, &FailureReport::new("not mine"))
            .await
            .unwrap();
        assert_eq!(f.store.get(&id).await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_empty_failure_reason_rejected() {
        let f = fixture(SchedulerConfig::default());
        let id = pending(&f.store, JobType::VodHls).await;
        let agent = f.gateway.register("reg-secret", "runner-1", None).await.unwrap();
        let view = f.gateway.claim(&agent, None).await.unwrap().unwrap();

        let err = f
            .gateway
            .error(&agent, &id, &view.lease_token, &FailureReport::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_runner_token() {
        let f = fixture(SchedulerConfig::default());
        let err = f.gateway.authenticate("vrt-unknown").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}

//! Background service reclaiming abandoned leases.
//!
//! A lease is abandoned when its holder has not written to the job within
//! the threshold for the job's type, or when the owning agent is gone
//! (unregistered or not seen within the agent expiry).
//!
//! Jobs that stayed in `Completing` past the VOD threshold never had their
//! result recorded; they are ended as errored so their children unblock.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use vrelay_models::{JobId, JobRecord, JobState};
use vrelay_store::{AgentRepository, JobFilter, JobRepository};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lease::LeaseManager;
use crate::metrics::record_stale_lease;

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// Stale lease reaper.
pub struct StaleLeaseReaper {
    leases: Arc<LeaseManager>,
    jobs: Arc<dyn JobRepository>,
    agents: Arc<dyn AgentRepository>,
    config: Arc<SchedulerConfig>,
}

impl StaleLeaseReaper {
    pub fn new(
        leases: Arc<LeaseManager>,
        jobs: Arc<dyn JobRepository>,
        agents: Arc<dyn AgentRepository>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        Self {
            leases,
            jobs,
            agents,
            config,
        }
    }

    /// Run the detection loop until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting stale lease reaper (interval: {:?})",
            self.config.reaper_interval
        );

        let mut ticker = interval(self.config.reaper_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("Stale lease detection error: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stale lease reaper stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single check. Returns `(stale, recovered)`.
    pub async fn check_once(&self) -> SchedulerResult<(u32, u32)> {
        self.check_at(Utc::now()).await
    }

    /// Run a single check as of `now`.
    pub async fn check_at(&self, now: DateTime<Utc>) -> SchedulerResult<(u32, u32)> {
        let shortest = self
            .config
            .vod_stale_threshold
            .min(self.config.live_stale_threshold);
        let idle = self.jobs.list_stale(now - chrono_duration(shortest)).await?;

        let processing = self
            .jobs
            .list(&JobFilter {
                states: Some(vec![JobState::Processing]),
                ..Default::default()
            })
            .await?
            .items;

        let mut seen: HashSet<JobId> = HashSet::new();
        let mut stale_count = 0u32;
        let mut recovered_count = 0u32;

        for job in idle.into_iter().chain(processing) {
            if !seen.insert(job.id.clone()) {
                continue;
            }
            let Some(cause) = self.stale_cause(&job, now).await? else {
                continue;
            };

            stale_count += 1;
            record_stale_lease(job.job_type);
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                owner = ?job.owner_agent_id,
                last_activity = ?job.last_lease_activity(),
                cause,
                error = %SchedulerError::LeaseExpired(job.id.clone()),
                "Detected stale lease"
            );

            match self.leases.expire_lease(&job).await {
                Ok(Some(outcome)) => {
                    recovered_count += 1;
                    info!(job_id = %job.id, outcome = ?outcome, "Recovered stale lease");
                }
                Ok(None) => {
                    debug!(job_id = %job.id, "Lease changed before it could be reclaimed");
                }
                Err(e) => {
                    error!(job_id = %job.id, "Failed to recover stale lease: {}", e);
                }
            }
        }

        let (stuck, errored) = self.check_completing(now).await?;
        stale_count += stuck;
        recovered_count += errored;

        if stale_count > 0 {
            info!(
                "Stale lease detection complete: {} stale, {} recovered",
                stale_count, recovered_count
            );
        }

        Ok((stale_count, recovered_count))
    }

    /// Error out jobs left in `Completing` longer than the VOD threshold.
    async fn check_completing(&self, now: DateTime<Utc>) -> SchedulerResult<(u32, u32)> {
        let cutoff = now - chrono_duration(self.config.vod_stale_threshold);
        let completing = self
            .jobs
            .list(&JobFilter {
                states: Some(vec![JobState::Completing]),
                ..Default::default()
            })
            .await?
            .items;

        let mut stuck = 0u32;
        let mut errored = 0u32;
        for job in completing.iter().filter(|j| j.updated_at < cutoff) {
            stuck += 1;
            record_stale_lease(job.job_type);
            match self.leases.expire_completing(job).await {
                Ok(true) => errored += 1,
                Ok(false) => debug!(job_id = %job.id, "Job left completing before it could be expired"),
                Err(e) => error!(job_id = %job.id, "Failed to expire completing job: {}", e),
            }
        }

        Ok((stuck, errored))
    }

    async fn stale_cause(
        &self,
        job: &JobRecord,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<&'static str>> {
        if job.state != JobState::Processing {
            return Ok(None);
        }
        let Some(activity) = job.last_lease_activity() else {
            return Ok(None);
        };

        let threshold = chrono_duration(self.config.stale_threshold(job.job_type));
        if now - activity > threshold {
            return Ok(Some("no-activity"));
        }

        let Some(owner) = &job.owner_agent_id else {
            return Ok(None);
        };
        match self.agents.get_agent(owner).await {
            Ok(agent) if agent.is_expired(chrono_duration(self.config.agent_expiry), now) => {
                Ok(Some("agent-expired"))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(Some("agent-gone")),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use vrelay_models::{Agent, JobType, PrivatePayload};
    use vrelay_store::MemoryStore;

    use crate::events::EventBus;
    use crate::lease::{LEASE_EXPIRED_REASON, RESULT_NOT_RECORDED_REASON};
    use crate::result::LoggingResultHandler;

    struct Harness {
        store: Arc<MemoryStore>,
        leases: Arc<LeaseManager>,
        reaper: StaleLeaseReaper,
        agent: Agent,
    }

    async fn harness() -> Harness {
        harness_with(5).await
    }

    async fn harness_with(max_failures: u32) -> Harness {
        let config = Arc::new(SchedulerConfig {
            vod_stale_threshold: Duration::from_secs(60),
            live_stale_threshold: Duration::from_secs(30),
            max_failures,
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            Arc::clone(&config),
            EventBus::default(),
            Arc::new(LoggingResultHandler),
        ));
        let reaper = StaleLeaseReaper::new(
            Arc::clone(&leases),
            store.clone(),
            store.clone(),
            config,
        );
        let agent = store
            .register(Agent::new("runner-1", None, "reg-token"))
            .await
            .unwrap();

        Harness {
            store,
            leases,
            reaper,
            agent,
        }
    }

    async fn insert_and_claim(h: &Harness, job_type: JobType) -> JobRecord {
        let job = JobRecord::new(
            job_type,
            json!({}),
            PrivatePayload::for_video("video-1"),
            100,
            None,
        );
        h.store.create(job).await.unwrap();
        h.leases.claim(&h.agent.id, None).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_idle_vod_lease_returns_to_pending() {
        let h = harness().await;
        let leased = insert_and_claim(&h, JobType::VodHls).await;
        let t0 = leased.lease_started_at.unwrap();

        assert_eq!(h.reaper.check_at(t0 + chrono::Duration::seconds(10)).await.unwrap(), (0, 0));
        assert_eq!(h.reaper.check_at(t0 + chrono::Duration::seconds(61)).await.unwrap(), (1, 1));

        let job = h.store.get(&leased.id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.failure_count, 1);
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_REASON));

        let again = h.leases.claim(&h.agent.id, None).await.unwrap().unwrap();
        assert_ne!(again.lease_token, leased.lease_token);

        // The old holder is locked out.
        let old = leased.lease_token.unwrap();
        assert!(h.leases.update(&leased.id, &old, Some(10), None).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_vod_lease_errors_once_budget_spent() {
        let h = harness_with(1).await;
        let leased = insert_and_claim(&h, JobType::VodWebVideo).await;
        let child = JobRecord::new(
            JobType::VodWebVideo,
            json!({}),
            PrivatePayload::for_video("video-1"),
            100,
            Some(leased.id.clone()),
        );
        let child = h.store.create(child).await.unwrap();
        assert_eq!(h.store.get(&child).await.unwrap().state, JobState::WaitingForParent);

        let t0 = leased.lease_started_at.unwrap();
        assert_eq!(h.reaper.check_at(t0 + chrono::Duration::seconds(61)).await.unwrap(), (1, 1));

        let parent = h.store.get(&leased.id).await.unwrap();
        assert_eq!(parent.state, JobState::Errored);
        assert_eq!(parent.failure_count, 1);
        assert_eq!(parent.last_error.as_deref(), Some(LEASE_EXPIRED_REASON));
        assert_eq!(h.store.get(&child).await.unwrap().state, JobState::ParentErrored);
    }

    #[tokio::test]
    async fn test_stuck_completing_job_errors_and_unblocks_children() {
        let h = harness().await;
        let mut parent = JobRecord::new(
            JobType::VodHls,
            json!({}),
            PrivatePayload::for_video("video-1"),
            100,
            None,
        );
        parent.state = JobState::Completing;
        let parent = h.store.create(parent).await.unwrap();
        let child = JobRecord::new(
            JobType::VodHls,
            json!({}),
            PrivatePayload::for_video("video-1"),
            100,
            Some(parent.clone()),
        );
        let child = h.store.create(child).await.unwrap();

        let t0 = h.store.get(&parent).await.unwrap().updated_at;
        assert_eq!(h.reaper.check_at(t0 + chrono::Duration::seconds(30)).await.unwrap(), (0, 0));
        assert_eq!(h.reaper.check_at(t0 + chrono::Duration::seconds(61)).await.unwrap(), (1, 1));

        let stuck = h.store.get(&parent).await.unwrap();
        assert_eq!(stuck.state, JobState::Errored);
        assert_eq!(stuck.last_error.as_deref(), Some(RESULT_NOT_RECORDED_REASON));
        assert_eq!(h.store.get(&child).await.unwrap().state, JobState::ParentErrored);
    }

    #[tokio::test]
    async fn test_idle_live_lease_errors() {
        let h = harness().await;
        let leased = insert_and_claim(&h, JobType::LiveRtmpHls).await;
        let t0 = leased.lease_started_at.unwrap();

        assert_eq!(h.reaper.check_at(t0 + chrono::Duration::seconds(31)).await.unwrap(), (1, 1));
        assert_eq!(h.store.get(&leased.id).await.unwrap().state, JobState::Errored);
    }

    #[tokio::test]
    async fn test_updates_keep_lease_alive() {
        let h = harness().await;
        let leased = insert_and_claim(&h, JobType::VodHls).await;
        let token = leased.lease_token.clone().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.leases.update(&leased.id, &token, Some(50), None).await.unwrap();
        let updated = h.store.get(&leased.id).await.unwrap();

        let t0 = leased.lease_started_at.unwrap();
        let activity = updated.last_lease_activity().unwrap();
        assert!(activity > t0);
        assert_eq!(h.reaper.check_at(activity + chrono::Duration::seconds(59)).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_unregistered_owner_releases_lease() {
        let h = harness().await;
        let leased = insert_and_claim(&h, JobType::VodWebVideo).await;

        h.store.unregister(&h.agent.id).await.unwrap();
        assert_eq!(h.reaper.check_once().await.unwrap(), (1, 1));
        assert_eq!(h.store.get(&leased.id).await.unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness().await;
        let (tx, rx) = watch::channel(false);

        let reaper = h.reaper;
        let handle = tokio::spawn(async move { reaper.run(rx).await });
        tx.send(true).unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(finished.is_ok());
    }
}

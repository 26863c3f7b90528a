//! In-process worker.
//!
//! Claims jobs through the same [`LeaseManager`] calls a remote agent uses,
//! holds the per-video lock while it reads or writes the video's files, and
//! heartbeats its lease while the encoder runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use vrelay_models::{
    Agent, AgentId, AudioMergePayload, InputRef, JobId, JobRecord, JobType, LeaseToken,
    SuccessPayload, VodTranscodingPayload,
};
use vrelay_scheduler::{LeaseManager, SchedulerError, VideoLock};
use vrelay_store::AgentRepository;

use crate::command::EncodeProgress;
use crate::config::WorkerConfig;
use crate::encoder::{EncodeRequest, Encoder};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics::record_local_encode;

/// Registration token recorded on the worker's own agent entry.
const LOCAL_REGISTRATION: &str = "local";

/// Abort reason recorded when shutdown interrupts a local job.
const SHUTDOWN_REASON: &str = "local worker shutting down";

/// Shared state of running jobs.
struct WorkerContext {
    config: WorkerConfig,
    leases: Arc<LeaseManager>,
    locks: VideoLock,
    encoder: Arc<dyn Encoder>,
    shutdown: watch::Receiver<bool>,
}

/// In-process worker.
pub struct LocalWorker {
    ctx: Arc<WorkerContext>,
    agents: Arc<dyn AgentRepository>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl LocalWorker {
    pub fn new(
        config: WorkerConfig,
        leases: Arc<LeaseManager>,
        agents: Arc<dyn AgentRepository>,
        locks: VideoLock,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            ctx: Arc::new(WorkerContext {
                config,
                leases,
                locks,
                encoder,
                shutdown: shutdown_rx,
            }),
            agents,
            job_semaphore,
            shutdown,
        }
    }

    /// Poll for jobs until [`LocalWorker::shutdown`] is called.
    pub async fn run(&self) -> WorkerResult<()> {
        let config = &self.ctx.config;
        if !config.enabled {
            info!("Local worker is disabled");
            return Ok(());
        }

        let agent_id = self.ensure_agent().await?;
        info!(
            agent_id = %agent_id,
            "Starting local worker with {} max concurrent jobs", config.max_concurrent_jobs
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(config.poll_interval);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping local worker");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&agent_id).await {
                        error!("Local worker poll failed: {}", e);
                    }
                }
            }
        }

        info!("Waiting for in-flight jobs to complete...");
        let _ = tokio::time::timeout(config.shutdown_timeout, self.wait_for_jobs()).await;

        info!("Local worker stopped");
        Ok(())
    }

    /// Signal shutdown. Running jobs are handed back with `abort`.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Find or create the worker's own agent entry.
    pub async fn ensure_agent(&self) -> WorkerResult<AgentId> {
        let name = &self.ctx.config.agent_name;
        if let Some(agent) = self
            .agents
            .list_agents()
            .await?
            .into_iter()
            .find(|a| &a.name == name)
        {
            return Ok(agent.id);
        }

        let agent = Agent::new(
            name.clone(),
            Some("In-process worker".to_string()),
            LOCAL_REGISTRATION,
        );
        let agent = self.agents.register(agent).await?;
        info!(agent_id = %agent.id, name = %agent.name, "Registered local worker agent");
        Ok(agent.id)
    }

    /// True when some other agent was seen within the agent expiry.
    pub async fn remote_capacity(&self, own: &AgentId) -> WorkerResult<bool> {
        let expiry = self.ctx.leases.config().agent_expiry;
        let expiry = chrono::Duration::seconds(expiry.as_secs() as i64);
        let now = Utc::now();

        Ok(self
            .agents
            .list_agents()
            .await?
            .iter()
            .any(|a| &a.id != own && !a.is_expired(expiry, now)))
    }

    /// Claim and start as many jobs as there are free slots.
    ///
    /// Remote agents take precedence: nothing is claimed while one is alive.
    /// Returns the number of jobs started.
    pub async fn poll_once(&self, agent_id: &AgentId) -> WorkerResult<usize> {
        self.agents.touch(agent_id, Utc::now()).await?;

        if self.remote_capacity(agent_id).await? {
            debug!("Remote agents available, local worker idle");
            return Ok(0);
        }

        let slots = self.job_semaphore.available_permits();
        let mut started = 0;
        for _ in 0..slots {
            let Some(job) = self
                .ctx
                .leases
                .claim(agent_id, Some(self.ctx.config.job_types.as_slice()))
                .await?
            else {
                break;
            };

            let permit = self
                .job_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::encode_failed("Semaphore closed"))?;
            let ctx = Arc::clone(&self.ctx);

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(ctx, job).await;
            });
            started += 1;
        }

        Ok(started)
    }

    /// Number of jobs currently running.
    pub fn running_jobs(&self) -> usize {
        self.ctx.config.max_concurrent_jobs.max(1) - self.job_semaphore.available_permits()
    }

    async fn wait_for_jobs(&self) {
        while self.running_jobs() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Run one leased job and report the outcome.
    async fn execute_job(ctx: Arc<WorkerContext>, job: JobRecord) {
        let logger = JobLogger::new(&job);
        let Some(token) = job.lease_token.clone() else {
            logger.failed(&"claimed job carries no lease token");
            return;
        };

        let span = logger.span();
        async {
            logger.claimed();
            let started = Instant::now();

            let outcome = Self::process_job(&ctx, &job, &token, &logger).await;
            record_local_encode(job.job_type, started.elapsed().as_secs_f64());

            let report = match outcome {
                Ok(result) => ctx
                    .leases
                    .complete(&job.id, &token, &result)
                    .await
                    .map(|_| logger.completed(started.elapsed())),
                Err(WorkerError::LeaseLost) => {
                    logger.lease_lost();
                    Ok(())
                }
                Err(e) if e.is_abort() => {
                    logger.handed_back(SHUTDOWN_REASON);
                    ctx.leases
                        .abort(&job.id, &token, SHUTDOWN_REASON)
                        .await
                        .map(|_| ())
                }
                Err(e) => {
                    logger.failed(&e);
                    ctx.leases
                        .fail(&job.id, &token, &e.to_string())
                        .await
                        .map(|outcome| debug!(outcome = ?outcome, "Failure reported"))
                }
            };

            if let Err(e) = report {
                logger.report_failed(&e);
            }
        }
        .instrument(span)
        .await
    }

    /// Encode under the video lock while heartbeating the lease.
    async fn process_job(
        ctx: &WorkerContext,
        job: &JobRecord,
        token: &LeaseToken,
        logger: &JobLogger,
    ) -> WorkerResult<SuccessPayload> {
        let request = Self::prepare(ctx, job).await?;
        let (progress_tx, progress_rx) = watch::channel(EncodeProgress::default());

        let work = async {
            let _guard = ctx.locks.acquire(&job.private_payload.video_key).await;
            ctx.encoder.encode(&request, progress_tx).await
        };
        tokio::pin!(work);

        let mut shutdown = ctx.shutdown.clone();
        let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(WorkerError::Cancelled);
                    }
                }
                _ = heartbeat.tick() => {
                    logger.progress(&progress_rx.borrow());

                    match ctx.leases.update(&job.id, token, None, None).await {
                        Ok(_) => {}
                        Err(SchedulerError::InvalidLease(_)) | Err(SchedulerError::NotFound(_)) => {
                            return Err(WorkerError::LeaseLost);
                        }
                        Err(e) => warn!(job_id = %job.id, "Heartbeat failed: {}", e),
                    }
                }
            }
        }
    }

    /// Resolve the job's payload into an encode request.
    async fn prepare(ctx: &WorkerContext, job: &JobRecord) -> WorkerResult<EncodeRequest> {
        let public = ctx.leases.resolve_input(job).await?;
        let (input, preview, output) = match job.job_type {
            JobType::VodWebVideo | JobType::VodHls => {
                let payload: VodTranscodingPayload = serde_json::from_value(public)?;
                (payload.input, None, payload.output)
            }
            JobType::VodAudioMerge => {
                let payload: AudioMergePayload = serde_json::from_value(public)?;
                (payload.input, payload.preview_url, payload.output)
            }
            other => return Err(WorkerError::Unsupported(other)),
        };

        let input = match input {
            InputRef::Source { url } => url,
            InputRef::ParentOutput { job_id } => {
                return Err(WorkerError::encode_failed(format!(
                    "output of parent job {} is unresolved",
                    job_id
                )))
            }
        };
        let video_key = &job.private_payload.video_key;
        let output_dir = job_dir(&ctx.config, video_key, &job.id);
        tokio::fs::create_dir_all(&output_dir).await?;

        Ok(EncodeRequest {
            job_id: job.id.clone(),
            job_type: job.job_type,
            input,
            preview,
            output,
            output_dir,
        })
    }
}

/// Output directory of one job.
pub fn job_dir(config: &WorkerConfig, video_key: &str, job_id: &JobId) -> PathBuf {
    PathBuf::from(&config.work_dir).join(video_key).join(job_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use vrelay_models::{JobState, OutputSpec, PrivatePayload};

    use crate::encoder::output_filenames;
    use vrelay_scheduler::{EventBus, LoggingResultHandler, SchedulerConfig};
    use vrelay_store::{JobRepository, MemoryStore};

    /// Writes the expected output files instead of encoding.
    struct FakeEncoder {
        fail: bool,
        calls: AtomicUsize,
        inputs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn encode(
            &self,
            request: &EncodeRequest,
            _progress: watch::Sender<EncodeProgress>,
        ) -> WorkerResult<SuccessPayload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(request.input.clone());
            if self.fail {
                return Err(WorkerError::encode_failed("corrupt input"));
            }

            let (video, _) = output_filenames(request.job_type, request.output.resolution);
            let path = request.output_dir.join(&video);
            tokio::fs::write(&path, b"video").await?;
            Ok(SuccessPayload::WebVideo {
                video_file: vrelay_models::Artifact {
                    filename: video,
                    location: path.to_string_lossy().to_string(),
                },
            })
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        worker: LocalWorker,
        encoder: Arc<FakeEncoder>,
        _dir: tempfile::TempDir,
    }

    fn harness(fail: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            Arc::new(SchedulerConfig::default()),
            EventBus::default(),
            Arc::new(LoggingResultHandler),
        ));
        let encoder = Arc::new(FakeEncoder {
            fail,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        });
        let config = WorkerConfig {
            work_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let worker = LocalWorker::new(config, leases, store.clone(), VideoLock::new(), encoder.clone());

        Harness {
            store,
            worker,
            encoder,
            _dir: dir,
        }
    }

    async fn insert_web_job(h: &Harness, input: InputRef, parent: Option<JobId>) -> JobId {
        let payload = VodTranscodingPayload {
            input,
            output: OutputSpec {
                resolution: 720,
                fps: 30,
            },
        };
        let job = JobRecord::new(
            JobType::VodWebVideo,
            serde_json::to_value(&payload).unwrap(),
            PrivatePayload::for_video("video-1"),
            100,
            parent,
        );
        h.store.create(job).await.unwrap()
    }

    async fn wait_for_state(store: &MemoryStore, id: &JobId, state: JobState) -> JobRecord {
        for _ in 0..100 {
            let job = store.get(id).await.unwrap();
            if job.state == state {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_local_job_completes_and_releases_child() {
        let h = harness(false);
        let source = InputRef::Source {
            url: "file:///uploads/video-1.mp4".to_string(),
        };
        let parent = insert_web_job(&h, source, None).await;
        let child = insert_web_job(
            &h,
            InputRef::ParentOutput {
                job_id: parent.clone(),
            },
            Some(parent.clone()),
        )
        .await;

        let agent = h.worker.ensure_agent().await.unwrap();
        assert_eq!(h.worker.poll_once(&agent).await.unwrap(), 1);
        wait_for_state(&h.store, &parent, JobState::Completed).await;

        // The child reads the location the parent's result was stored at.
        assert_eq!(h.worker.poll_once(&agent).await.unwrap(), 1);
        let done = wait_for_state(&h.store, &child, JobState::Completed).await;
        assert_eq!(done.failure_count, 0);
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 2);
        let stored = h.store.get(&parent).await.unwrap().private_payload.output_location;
        assert_eq!(h.encoder.inputs.lock().unwrap()[1], stored.unwrap());
    }

    #[tokio::test]
    async fn test_encode_failure_spends_retry_budget() {
        let h = harness(true);
        let id = insert_web_job(&h, InputRef::Source { url: "in.mp4".into() }, None).await;

        let agent = h.worker.ensure_agent().await.unwrap();
        h.worker.poll_once(&agent).await.unwrap();

        let mut job = h.store.get(&id).await.unwrap();
        for _ in 0..100 {
            if job.failure_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            job = h.store.get(&id).await.unwrap();
        }
        assert_eq!(job.failure_count, 1);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.last_error.as_deref(), Some("Encode failed: corrupt input"));
    }

    #[tokio::test]
    async fn test_idle_while_remote_agent_alive() {
        let h = harness(false);
        insert_web_job(&h, InputRef::Source { url: "in.mp4".into() }, None).await;
        h.store
            .register(Agent::new("remote-1", None, "reg"))
            .await
            .unwrap();

        let agent = h.worker.ensure_agent().await.unwrap();
        assert_eq!(h.worker.poll_once(&agent).await.unwrap(), 0);
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_agent_is_stable() {
        let h = harness(false);
        let first = h.worker.ensure_agent().await.unwrap();
        let second = h.worker.ensure_agent().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_parent_output_fails_job() {
        let h = harness(false);
        let ghost = JobId::new();
        let ghost_payload = json!({
            "input": { "kind": "source", "url": "in.mp4" },
            "output": { "resolution": 1080, "fps": 30 }
        });
        let parent = JobRecord::new(
            JobType::VodWebVideo,
            ghost_payload,
            PrivatePayload::for_video("video-1"),
            100,
            None,
        );
        let mut parent = parent;
        parent.id = ghost.clone();
        parent.state = JobState::Completed;
        h.store.create(parent).await.unwrap();
        let id = insert_web_job(&h, InputRef::ParentOutput { job_id: ghost }, None).await;

        let agent = h.worker.ensure_agent().await.unwrap();
        h.worker.poll_once(&agent).await.unwrap();

        let mut job = h.store.get(&id).await.unwrap();
        for _ in 0..100 {
            if job.failure_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            job = h.store.get(&id).await.unwrap();
        }
        assert_eq!(job.failure_count, 1);
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_child_of_remote_parent_reads_stored_location() {
        let h = harness(false);
        let mut parent = JobRecord::new(
            JobType::VodWebVideo,
            json!({
                "input": { "kind": "source", "url": "in.mp4" },
                "output": { "resolution": 1080, "fps": 30 }
            }),
            PrivatePayload::for_video("video-1"),
            100,
            None,
        );
        parent.state = JobState::Completed;
        parent.private_payload.output_location = Some("https://storage.example/out/1080.mp4".to_string());
        let parent = h.store.create(parent).await.unwrap();
        let id = insert_web_job(&h, InputRef::ParentOutput { job_id: parent }, None).await;

        let agent = h.worker.ensure_agent().await.unwrap();
        h.worker.poll_once(&agent).await.unwrap();
        wait_for_state(&h.store, &id, JobState::Completed).await;

        assert_eq!(
            *h.encoder.inputs.lock().unwrap(),
            vec!["https://storage.example/out/1080.mp4".to_string()]
        );
    }
}

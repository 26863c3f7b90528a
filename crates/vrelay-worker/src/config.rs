//! Worker configuration.

use std::time::Duration;

use vrelay_models::JobType;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Run the in-process worker at all
    pub enabled: bool,
    /// Name the worker registers under in the agent registry
    pub agent_name: String,
    /// Job types executed locally
    pub job_types: Vec<JobType>,
    /// How often to look for claimable jobs
    pub poll_interval: Duration,
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Interval between lease heartbeats while a job runs
    pub heartbeat_interval: Duration,
    /// Work directory for job outputs
    pub work_dir: String,
    /// Encoder executable
    pub encoder_program: String,
    /// Per-job encode timeout
    pub encode_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent_name: "local-worker".to_string(),
            job_types: vec![JobType::VodWebVideo, JobType::VodHls, JobType::VodAudioMerge],
            poll_interval: Duration::from_secs(5),
            max_concurrent_jobs: 1,
            heartbeat_interval: Duration::from_secs(30),
            work_dir: "/tmp/vrelay".to_string(),
            encoder_program: "ffmpeg".to_string(),
            encode_timeout: Duration::from_secs(6 * 3600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            enabled: std::env::var("WORKER_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enabled),
            agent_name: std::env::var("WORKER_AGENT_NAME").unwrap_or(defaults.agent_name),
            job_types: std::env::var("WORKER_JOB_TYPES")
                .ok()
                .map(|s| {
                    s.split(',')
                        .filter_map(|t| t.trim().parse().ok())
                        .collect::<Vec<JobType>>()
                })
                .filter(|types| !types.is_empty())
                .unwrap_or(defaults.job_types),
            poll_interval: Duration::from_secs(
                std::env::var("WORKER_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            heartbeat_interval: Duration::from_secs(
                std::env::var("WORKER_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(defaults.work_dir),
            encoder_program: std::env::var("WORKER_ENCODER").unwrap_or(defaults.encoder_program),
            encode_timeout: Duration::from_secs(
                std::env::var("WORKER_ENCODE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(6 * 3600),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

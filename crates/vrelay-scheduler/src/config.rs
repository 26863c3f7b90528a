//! Scheduler configuration.

use std::time::Duration;

use vrelay_models::JobType;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Output resolutions enabled for VOD transcoding
    pub enabled_resolutions: Vec<u32>,
    /// Produce a segmented (HLS) representation
    pub hls_enabled: bool,
    /// Produce a muxed (web video) representation
    pub web_video_enabled: bool,
    pub max_fps: u32,
    /// Lower bound applied to the anchor rendition only
    pub min_fps: u32,
    /// Pseudo-resolution used as anchor for audio-only sources
    pub audio_resolution: u32,
    pub audio_merge_fps: u32,
    /// Failures after which a VOD job becomes terminal
    pub max_failures: u32,
    /// Maximum segments kept in a live rendition window
    pub live_window_size: usize,
    pub vod_stale_threshold: Duration,
    pub live_stale_threshold: Duration,
    pub reaper_interval: Duration,
    /// Attempts for a read-modify-write that keeps hitting version conflicts
    pub claim_attempts: u32,
    /// Candidates fetched per claim attempt
    pub pending_page_size: usize,
    /// Agents not seen for this long are considered gone
    pub agent_expiry: Duration,
    /// Minimum interval between two `last_seen_at` writes for one agent
    pub last_contact_interval: Duration,
    /// Job types remote agents may execute
    pub remote_job_types: Vec<JobType>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled_resolutions: vec![1080, 720, 480, 360, 240],
            hls_enabled: true,
            web_video_enabled: false,
            max_fps: 60,
            min_fps: 1,
            audio_resolution: 480,
            audio_merge_fps: 25,
            max_failures: 5,
            live_window_size: 15,
            vod_stale_threshold: Duration::from_secs(120),
            live_stale_threshold: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(15),
            claim_attempts: 5,
            pending_page_size: 10,
            agent_expiry: Duration::from_secs(300),
            last_contact_interval: Duration::from_secs(30),
            remote_job_types: JobType::ALL.to_vec(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key).unwrap_or(default))
}

impl SchedulerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled_resolutions = std::env::var("TRANSCODING_RESOLUTIONS")
            .ok()
            .map(|s| {
                s.split(',')
                    .filter_map(|r| r.trim().parse().ok())
                    .collect::<Vec<u32>>()
            })
            .unwrap_or(defaults.enabled_resolutions);

        let remote_job_types = std::env::var("REMOTE_JOB_TYPES")
            .ok()
            .map(|s| {
                s.split(',')
                    .filter_map(|t| t.trim().parse().ok())
                    .collect::<Vec<JobType>>()
            })
            .unwrap_or(defaults.remote_job_types);

        Self {
            enabled_resolutions,
            hls_enabled: env_bool("TRANSCODING_HLS_ENABLED", defaults.hls_enabled),
            web_video_enabled: env_bool("TRANSCODING_WEB_VIDEO_ENABLED", defaults.web_video_enabled),
            max_fps: env_parse("TRANSCODING_MAX_FPS").unwrap_or(defaults.max_fps),
            min_fps: env_parse("TRANSCODING_MIN_FPS").unwrap_or(defaults.min_fps),
            audio_resolution: defaults.audio_resolution,
            audio_merge_fps: defaults.audio_merge_fps,
            max_failures: env_parse("JOB_MAX_FAILURES").unwrap_or(defaults.max_failures),
            live_window_size: env_parse("LIVE_SEGMENT_WINDOW").unwrap_or(defaults.live_window_size),
            vod_stale_threshold: env_secs("VOD_STALE_THRESHOLD_SECS", 120),
            live_stale_threshold: env_secs("LIVE_STALE_THRESHOLD_SECS", 30),
            reaper_interval: env_secs("REAPER_INTERVAL_SECS", 15),
            claim_attempts: env_parse("CLAIM_ATTEMPTS").unwrap_or(defaults.claim_attempts),
            pending_page_size: env_parse("PENDING_PAGE_SIZE").unwrap_or(defaults.pending_page_size),
            agent_expiry: env_secs("AGENT_EXPIRY_SECS", 300),
            last_contact_interval: env_secs("AGENT_CONTACT_INTERVAL_SECS", 30),
            remote_job_types,
        }
    }

    /// Staleness threshold for a job type.
    pub fn stale_threshold(&self, job_type: JobType) -> Duration {
        if job_type.is_live() {
            self.live_stale_threshold
        } else {
            self.vod_stale_threshold
        }
    }
}

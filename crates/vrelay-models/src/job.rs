//! Job records and the runner job state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::agent::AgentId;
use crate::payload::PrivatePayload;

/// Maximum stored length of `last_error`, in characters.
pub const MAX_ERROR_LENGTH: usize = 5000;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Single-use token proving ownership of the current lease on a job.
///
/// A new token is generated on every claim, so a token from an earlier lease
/// never matches again.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    /// Generate a fresh lease token.
    pub fn generate() -> Self {
        Self(format!("vrjt-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LeaseToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LeaseToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// Tokens are secrets; keep them out of logs.
impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LeaseToken(..)")
    }
}

/// Kind of work a job represents.
///
/// The serialized names are the identifiers agents use on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum JobType {
    #[serde(rename = "vod-web-video-transcoding")]
    VodWebVideo,
    #[serde(rename = "vod-hls-transcoding")]
    VodHls,
    #[serde(rename = "vod-audio-merge-transcoding")]
    VodAudioMerge,
    #[serde(rename = "live-rtmp-hls-transcoding")]
    LiveRtmpHls,
    #[serde(rename = "video-studio-transcoding")]
    VideoStudio,
    #[serde(rename = "generate-video-storyboard")]
    GenerateStoryboard,
    #[serde(rename = "video-transcription")]
    Transcription,
}

impl JobType {
    /// Every job type, in a stable order.
    pub const ALL: [JobType; 7] = [
        JobType::VodWebVideo,
        JobType::VodHls,
        JobType::VodAudioMerge,
        JobType::LiveRtmpHls,
        JobType::VideoStudio,
        JobType::GenerateStoryboard,
        JobType::Transcription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::VodWebVideo => "vod-web-video-transcoding",
            JobType::VodHls => "vod-hls-transcoding",
            JobType::VodAudioMerge => "vod-audio-merge-transcoding",
            JobType::LiveRtmpHls => "live-rtmp-hls-transcoding",
            JobType::VideoStudio => "video-studio-transcoding",
            JobType::GenerateStoryboard => "generate-video-storyboard",
            JobType::Transcription => "video-transcription",
        }
    }

    /// Live jobs consume an input that disappears once the stream ends,
    /// so they are never retried.
    pub fn is_live(&self) -> bool {
        matches!(self, JobType::LiveRtmpHls)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown job type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job type: {0}")]
pub struct UnknownJobType(pub String);

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownJobType(s.to_string()))
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Claimable by any agent accepting its type
    #[default]
    Pending,
    /// Leased to an agent
    Processing,
    /// Success reported, result being applied
    Completing,
    Completed,
    Errored,
    Cancelled,
    /// Child job blocked until its parent completes
    WaitingForParent,
    ParentErrored,
    ParentCancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completing => "completing",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
            JobState::Cancelled => "cancelled",
            JobState::WaitingForParent => "waiting_for_parent",
            JobState::ParentErrored => "parent_errored",
            JobState::ParentCancelled => "parent_cancelled",
        }
    }

    /// Check if this is a terminal state (no more transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Errored
                | JobState::Cancelled
                | JobState::ParentErrored
                | JobState::ParentCancelled
        )
    }

    /// States from which an explicit cancel is accepted.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Processing | JobState::WaitingForParent
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Unique job ID, stable across retries
    pub id: JobId,

    /// Job type
    pub job_type: JobType,

    /// Payload sent to the executing agent
    pub public_payload: serde_json::Value,

    /// Payload that never leaves this process
    pub private_payload: PrivatePayload,

    pub state: JobState,

    /// Lower values are claimed first
    pub priority: i32,

    #[serde(default)]
    pub failure_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Present only while the job is leased
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<LeaseToken>,

    /// Advisory progress (0-100)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Parent job; the graph is a forest of one-level fan-outs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on_job_id: Option<JobId>,

    /// Agent currently holding the lease
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_agent_id: Option<AgentId>,

    /// Optimistic concurrency version, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl JobRecord {
    /// Create a new job. Jobs with a parent start in `WaitingForParent`.
    pub fn new(
        job_type: JobType,
        public_payload: serde_json::Value,
        private_payload: PrivatePayload,
        priority: i32,
        depends_on_job_id: Option<JobId>,
    ) -> Self {
        let now = Utc::now();
        let state = if depends_on_job_id.is_some() {
            JobState::WaitingForParent
        } else {
            JobState::Pending
        };

        Self {
            id: JobId::new(),
            job_type,
            public_payload,
            private_payload,
            state,
            priority,
            failure_count: 0,
            last_error: None,
            lease_token: None,
            progress: None,
            created_at: now,
            updated_at: now,
            lease_started_at: None,
            finished_at: None,
            depends_on_job_id,
            owner_agent_id: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// True when the job is leased and `token` is the current lease token.
    pub fn holds_lease(&self, token: &LeaseToken) -> bool {
        self.state == JobState::Processing && self.lease_token.as_ref() == Some(token)
    }

    /// Latest sign of life from the lease holder: the claim or any later write.
    pub fn last_lease_activity(&self) -> Option<DateTime<Utc>> {
        self.lease_started_at.map(|started| started.max(self.updated_at))
    }

    /// Start a new lease for `agent_id`, returning the fresh token.
    pub fn start_lease(&mut self, agent_id: AgentId) -> LeaseToken {
        let token = LeaseToken::generate();
        let now = Utc::now();

        self.state = JobState::Processing;
        self.lease_token = Some(token.clone());
        self.lease_started_at = Some(now);
        self.owner_agent_id = Some(agent_id);
        self.progress = None;
        self.updated_at = now;

        token
    }

    /// Drop the current lease without changing state.
    pub fn clear_lease(&mut self) {
        self.lease_token = None;
        self.owner_agent_id = None;
        self.updated_at = Utc::now();
    }

    /// Return the job to the claimable pool, keeping its identity.
    pub fn reset_to_pending(&mut self) {
        self.clear_lease();
        self.state = JobState::Pending;
        self.lease_started_at = None;
        self.progress = None;
    }

    /// Move to a terminal state and stamp `finished_at`.
    pub fn finish(&mut self, state: JobState) {
        debug_assert!(state.is_terminal());
        self.clear_lease();
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    /// Record a diagnostic, truncated to [`MAX_ERROR_LENGTH`] characters.
    pub fn set_last_error(&mut self, message: &str) {
        let truncated: String = message.chars().take(MAX_ERROR_LENGTH).collect();
        self.last_error = Some(truncated);
    }
}

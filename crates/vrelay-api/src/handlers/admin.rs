//! Administrator endpoints: job creation, inspection and cancellation.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use vrelay_models::{Agent, JobId, JobRecord, JobState, JobType, ProbeResult};
use vrelay_scheduler::{BuildResult, OptimizeRequest, PriorityWeight, TranscodingKind};
use vrelay_store::JobFilter;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Caller authenticated with the administrator bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let expected = state
            .config
            .admin_token
            .as_deref()
            .ok_or_else(|| ApiError::unauthorized("Administrator access is not configured"))?;

        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))?;

        if token != expected {
            return Err(ApiError::unauthorized("Invalid administrator token"));
        }

        Ok(AdminAuth)
    }
}

/// Human-readable label for a job state.
pub fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "Pending",
        JobState::Processing => "Processing",
        JobState::Completing => "Completing",
        JobState::Completed => "Completed",
        JobState::Errored => "Errored",
        JobState::Cancelled => "Cancelled",
        JobState::WaitingForParent => "Waiting for parent job to finish",
        JobState::ParentErrored => "Parent job failed",
        JobState::ParentCancelled => "Parent job cancelled",
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStateView {
    pub id: JobState,
    pub label: &'static str,
}

/// Administrator view of a job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobStateView,
    pub video_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub priority: i32,
    pub progress: Option<u8>,
    pub failures: u32,
    pub error: Option<String>,
    pub parent: Option<JobId>,
    pub runner: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobSummary {
    fn from(job: JobRecord) -> Self {
        Self {
            state: JobStateView {
                id: job.state,
                label: state_label(job.state),
            },
            video_key: job.private_payload.video_key,
            batch_id: job.private_payload.batch_id,
            runner: job.owner_agent_id.map(|a| a.to_string()),
            id: job.id,
            job_type: job.job_type,
            priority: job.priority,
            progress: job.progress,
            failures: job.failure_count,
            error: job.last_error,
            parent: job.depends_on_job_id,
            payload: job.public_payload,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.lease_started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_id: String,
    pub jobs: Vec<JobSummary>,
}

impl From<BuildResult> for BatchResponse {
    fn from(result: BuildResult) -> Self {
        Self {
            batch_id: result.batch_id,
            jobs: result
                .mains
                .into_iter()
                .chain(result.children)
                .map(JobSummary::from)
                .collect(),
        }
    }
}

fn parse_priority(priority: Option<&str>) -> ApiResult<PriorityWeight> {
    match priority {
        None => Ok(PriorityWeight::default()),
        Some(p) => PriorityWeight::parse(p)
            .ok_or_else(|| ApiError::Validation(format!("invalid priority: {}", p))),
    }
}

fn parse_types(names: &[String]) -> ApiResult<Vec<JobType>> {
    names
        .iter()
        .map(|n| n.parse::<JobType>().map_err(|e| ApiError::Validation(e.to_string())))
        .collect()
}

/// Build the transcoding jobs of a video.
///
/// Without `resolutions` the full ladder is derived from the probe result;
/// with them a manual re-encode of one representation is created.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeRequest {
    #[validate(length(min = 1, max = 2048))]
    pub source_url: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 2048))]
    pub preview_url: Option<String>,
    pub probe: ProbeResult,
    #[serde(default = "default_true")]
    pub is_new_video: bool,
    #[serde(default)]
    pub priority: Option<String>,
    /// `hls` or `web-video`, manual re-encodes only
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1))]
    pub resolutions: Option<Vec<u32>>,
}

fn default_true() -> bool {
    true
}

pub async fn create_transcoding_jobs(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(video_key): Path<String>,
    Json(request): Json<TranscodeRequest>,
) -> ApiResult<(StatusCode, Json<BatchResponse>)> {
    request.validate()?;
    let priority = parse_priority(request.priority.as_deref())?;

    let result = match &request.resolutions {
        Some(resolutions) => {
            let kind = match request.kind.as_deref() {
                None => TranscodingKind::Hls,
                Some(k) => TranscodingKind::parse(k)
                    .ok_or_else(|| ApiError::Validation(format!("invalid kind: {}", k)))?,
            };
            state
                .builder
                .create_transcoding_jobs(
                    &video_key,
                    &request.source_url,
                    request.probe.input_fps,
                    kind,
                    resolutions,
                    priority,
                )
                .await?
        }
        None => {
            state
                .builder
                .create_optimize_jobs(&OptimizeRequest {
                    video_key: video_key.clone(),
                    source_url: request.source_url,
                    preview_url: request.preview_url,
                    probe: request.probe,
                    priority,
                    is_new_video: request.is_new_video,
                })
                .await?
        }
    };

    info!(video_key = %video_key, jobs = result.len(), "Transcoding requested");
    Ok((StatusCode::CREATED, Json(result.into())))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LiveRequest {
    #[validate(length(min = 1, max = 2048))]
    pub rtmp_url: String,
    pub probe: ProbeResult,
    #[serde(default = "default_segment_duration")]
    #[validate(range(min = 1, max = 60))]
    pub segment_duration: u32,
    #[serde(default)]
    pub priority: Option<String>,
}

fn default_segment_duration() -> u32 {
    4
}

pub async fn create_live_job(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(video_key): Path<String>,
    Json(request): Json<LiveRequest>,
) -> ApiResult<(StatusCode, Json<JobSummary>)> {
    request.validate()?;
    let priority = parse_priority(request.priority.as_deref())?;

    let job = state
        .builder
        .create_live_job(
            &video_key,
            &request.rtmp_url,
            &request.probe,
            request.segment_duration,
            priority,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(job.into())))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SingleJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[validate(length(min = 1, max = 2048))]
    pub input_url: String,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub priority: Option<String>,
}

/// Create a studio edit, storyboard or transcription job.
pub async fn create_single_job(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(video_key): Path<String>,
    Json(request): Json<SingleJobRequest>,
) -> ApiResult<(StatusCode, Json<JobSummary>)> {
    request.validate()?;
    let job_type: JobType = request
        .job_type
        .parse()
        .map_err(|e: vrelay_models::UnknownJobType| ApiError::Validation(e.to_string()))?;
    let priority = parse_priority(request.priority.as_deref())?;

    let job = state
        .builder
        .create_single_job(&video_key, job_type, &request.input_url, request.options, priority)
        .await?;

    Ok((StatusCode::CREATED, Json(job.into())))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelVideoRequest {
    #[serde(default)]
    pub types: Option<Vec<String>>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelVideoResponse {
    pub cancelled: Vec<JobId>,
}

/// Cancel every unfinished job of a video.
pub async fn cancel_video_jobs(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(video_key): Path<String>,
    request: Option<Json<CancelVideoRequest>>,
) -> ApiResult<Json<CancelVideoResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let types = request.types.as_deref().map(parse_types).transpose()?;
    let reason = request.reason.as_deref().unwrap_or("cancelled by administrator");

    let cancelled = state
        .leases
        .cancel_batch(&video_key, types.as_deref(), reason)
        .await?;

    Ok(Json(CancelVideoResponse { cancelled }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    /// Comma-separated states
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, rename = "type")]
    pub job_type: Option<String>,
    #[serde(default)]
    pub video_key: Option<String>,
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub total: usize,
    pub data: Vec<JobSummary>,
}

fn parse_state(s: &str) -> ApiResult<JobState> {
    serde_json::from_value(serde_json::Value::String(s.trim().to_string()))
        .map_err(|_| ApiError::Validation(format!("invalid state: {}", s)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<JobList>> {
    let states = query
        .state
        .as_deref()
        .map(|s| s.split(',').map(parse_state).collect::<ApiResult<Vec<_>>>())
        .transpose()?;
    let job_type = query
        .job_type
        .as_deref()
        .map(|t| t.parse::<JobType>().map_err(|e| ApiError::Validation(e.to_string())))
        .transpose()?;

    let filter = JobFilter {
        states,
        job_type,
        video_key: query.video_key,
        offset: query.start.unwrap_or(0),
        limit: Some(query.count.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE)),
    };

    let page = state.leases.list(&filter).await?;
    Ok(Json(JobList {
        total: page.total,
        data: page.items.into_iter().map(JobSummary::from).collect(),
    }))
}

pub async fn get_job(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSummary>> {
    let job = state.leases.get(&JobId::from_string(job_id)).await?;
    Ok(Json(job.into()))
}

/// Cancel one job. Already finished jobs are returned unchanged.
pub async fn cancel_job(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSummary>> {
    let job_id = JobId::from_string(job_id);
    let job = match state.leases.cancel(&job_id, "cancelled by administrator").await? {
        Some(job) => job,
        None => state.leases.get(&job_id).await?,
    };
    Ok(Json(job.into()))
}

pub async fn delete_job(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(job_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.leases.delete(&JobId::from_string(job_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Administrator view of a runner. The runner token is never exposed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub alive: bool,
}

impl RunnerSummary {
    fn new(agent: Agent, expiry: chrono::Duration, now: DateTime<Utc>) -> Self {
        Self {
            alive: !agent.is_expired(expiry, now),
            id: agent.id.to_string(),
            name: agent.name,
            description: agent.description,
            last_seen_at: agent.last_seen_at,
            created_at: agent.created_at,
        }
    }
}

pub async fn list_runners(
    State(state): State<AppState>,
    _admin: AdminAuth,
) -> ApiResult<Json<Vec<RunnerSummary>>> {
    let expiry = chrono::Duration::from_std(state.scheduler.agent_expiry)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let now = Utc::now();

    let runners = state
        .agents
        .list_agents()
        .await?
        .into_iter()
        .map(|agent| RunnerSummary::new(agent, expiry, now))
        .collect();

    Ok(Json(runners))
}

//! Runner protocol endpoints.
//!
//! Every request body carries the agent's `runnerToken`; job-scoped calls
//! also carry the `leaseToken` handed out at claim time.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use vrelay_models::{FailureReport, JobId, JobType, LeaseToken, RunnerJobView};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub registration_token: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub id: String,
    pub runner_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRequest {
    pub runner_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTypesResponse {
    pub job_types: Vec<JobType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub runner_token: String,
    #[serde(default)]
    pub job_types: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub job: Option<RunnerJobView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub runner_token: String,
    pub lease_token: String,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessRequest {
    pub runner_token: String,
    pub lease_token: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRequest {
    pub runner_token: String,
    pub lease_token: String,
    pub payload: FailureReport,
}

fn parse_job_types(names: &[String]) -> ApiResult<Vec<JobType>> {
    names
        .iter()
        .map(|n| n.parse::<JobType>().map_err(|e| ApiError::Validation(e.to_string())))
        .collect()
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    let agent = state
        .gateway
        .register(&request.registration_token, &request.name, request.description)
        .await?;

    Ok(Json(RegisterResponse {
        id: agent.id.to_string(),
        runner_token: agent.runner_token.as_str().to_string(),
    }))
}

pub async fn unregister(
    State(state): State<AppState>,
    Json(request): Json<RunnerRequest>,
) -> ApiResult<StatusCode> {
    state.gateway.unregister(&request.runner_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_job_types(
    State(state): State<AppState>,
    Json(request): Json<RunnerRequest>,
) -> ApiResult<Json<JobTypesResponse>> {
    state.gateway.authenticate(&request.runner_token).await?;
    Ok(Json(JobTypesResponse {
        job_types: state.gateway.list_job_types().to_vec(),
    }))
}

/// Claim a job. Answers `{"job": null}` when nothing is available.
pub async fn request_job(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult<Json<ClaimResponse>> {
    let agent = state.gateway.authenticate(&request.runner_token).await?;
    let accepted = request.job_types.as_deref().map(parse_job_types).transpose()?;

    let job = state.gateway.claim(&agent, accepted.as_deref()).await?;
    Ok(Json(ClaimResponse { job }))
}

pub async fn update_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> ApiResult<StatusCode> {
    let agent = state.gateway.authenticate(&request.runner_token).await?;
    state
        .gateway
        .update(
            &agent,
            &JobId::from_string(job_id),
            &LeaseToken::from(request.lease_token.as_str()),
            request.progress,
            request.payload,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn job_success(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<SuccessRequest>,
) -> ApiResult<StatusCode> {
    let agent = state.gateway.authenticate(&request.runner_token).await?;
    state
        .gateway
        .success(
            &agent,
            &JobId::from_string(job_id),
            &LeaseToken::from(request.lease_token.as_str()),
            request.payload,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn job_error(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<FailureRequest>,
) -> ApiResult<StatusCode> {
    let agent = state.gateway.authenticate(&request.runner_token).await?;
    state
        .gateway
        .error(
            &agent,
            &JobId::from_string(job_id),
            &LeaseToken::from(request.lease_token.as_str()),
            &request.payload,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn job_abort(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<FailureRequest>,
) -> ApiResult<StatusCode> {
    let agent = state.gateway.authenticate(&request.runner_token).await?;
    state
        .gateway
        .abort(
            &agent,
            &JobId::from_string(job_id),
            &LeaseToken::from(request.lease_token.as_str()),
            &request.payload,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_types() {
        let types = parse_job_types(&["vod-hls-transcoding".to_string()]).unwrap();
        assert_eq!(types, vec![JobType::VodHls]);

        let err = parse_job_types(&["ffmpeg-anything".to_string()]).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}

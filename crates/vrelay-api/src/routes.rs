//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::admin::{
    cancel_job, cancel_video_jobs, create_live_job, create_single_job, create_transcoding_jobs,
    delete_job, get_job, list_jobs, list_runners,
};
use crate::handlers::health;
use crate::handlers::runner::{
    job_abort, job_error, job_success, list_job_types, register, request_job, unregister,
    update_job,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, propagate_request_id_layer, rate_limit_middleware, request_logging,
    set_request_id_layer, ClientRateLimiter,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let runner_routes = Router::new()
        .route("/runners/register", post(register))
        .route("/runners/unregister", post(unregister))
        .route("/runners/jobs/types", post(list_job_types))
        .route("/runners/jobs/request", post(request_job))
        .route("/runners/jobs/:job_id/update", post(update_job))
        .route("/runners/jobs/:job_id/success", post(job_success))
        .route("/runners/jobs/:job_id/error", post(job_error))
        .route("/runners/jobs/:job_id/abort", post(job_abort));

    let admin_routes = Router::new()
        .route("/videos/:video_key/transcode", post(create_transcoding_jobs))
        .route("/videos/:video_key/live", post(create_live_job))
        .route("/videos/:video_key/jobs", post(create_single_job))
        .route("/videos/:video_key/cancel", post(cancel_video_jobs))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/jobs/:job_id/cancel", post(cancel_job))
        .route("/runners", get(list_runners));

    let rate_limiter = ClientRateLimiter::new(state.config.rate_limit_rps);

    let api_routes = Router::new()
        .merge(runner_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(rate_limiter, rate_limit_middleware));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health))
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(propagate_request_id_layer())
        .layer(middleware::from_fn(request_logging))
        .layer(set_request_id_layer())
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}

//! Prometheus metrics for the API server.
//!
//! Scheduler counters (claims, completions, lease rejections) are recorded by
//! `vrelay-scheduler` into the same global recorder and rendered here too.

use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use regex::Regex;

/// Latency buckets in seconds. Runner calls are short; admin fan-out writes
/// take longer.
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Install the global Prometheus recorder.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            LATENCY_BUCKETS,
        )?
        .install_recorder()
}

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "vrelay_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "vrelay_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "vrelay_http_requests_in_flight";
    pub const RATE_LIMIT_HITS_TOTAL: &str = "vrelay_rate_limit_hits_total";
}

static JOB_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/jobs/[a-zA-Z0-9_-]{8,}").expect("valid job path regex"));

static VIDEO_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/videos/[a-zA-Z0-9_.-]+").expect("valid video path regex"));

/// Which caller population a path serves.
fn route_group(path: &str) -> &'static str {
    const RUNNER_PREFIXES: &[&str] = &[
        "/api/v1/runners/jobs",
        "/api/v1/runners/register",
        "/api/v1/runners/unregister",
    ];

    if RUNNER_PREFIXES.iter().any(|p| path.starts_with(p)) {
        "runner"
    } else if path.starts_with("/api/v1/") {
        "admin"
    } else {
        "system"
    }
}

/// Replace job ids and video keys with placeholders to bound label cardinality.
fn sanitize_path(path: &str) -> String {
    let path = JOB_SEGMENT.replace_all(path, "/jobs/:job_id");
    VIDEO_SEGMENT
        .replace_all(&path, "/videos/:video_key")
        .into_owned()
}

pub fn record_http_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("group", route_group(route).to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_rate_limit_hit(path: &str) {
    let labels = [("group", route_group(path))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Per-request counter, latency histogram and in-flight gauge.
///
/// Labels use the matched route template; unmatched paths are sanitized.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let route = match request.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => sanitize_path(request.uri().path()),
    };
    let start = Instant::now();

    let in_flight = gauge!(names::HTTP_REQUESTS_IN_FLIGHT);
    in_flight.increment(1.0);
    let response = next.run(request).await;
    in_flight.decrement(1.0);

    record_http_request(
        &method,
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    response
}

//! Scheduler metrics.

use metrics::counter;

use vrelay_models::JobType;

/// Metric name constants for consistency.
pub mod names {
    /// Jobs written by the dependency builder, by type.
    pub const JOBS_CREATED_TOTAL: &str = "vrelay_jobs_created_total";

    /// Successful claims, by type.
    pub const JOBS_CLAIMED_TOTAL: &str = "vrelay_jobs_claimed_total";

    pub const JOBS_COMPLETED_TOTAL: &str = "vrelay_jobs_completed_total";

    /// Reported failures, by type and outcome (`retry` or `errored`).
    pub const JOBS_FAILED_TOTAL: &str = "vrelay_jobs_failed_total";

    pub const JOBS_CANCELLED_TOTAL: &str = "vrelay_jobs_cancelled_total";

    /// Calls rejected because of a stale or wrong lease token.
    pub const LEASE_REJECTIONS_TOTAL: &str = "vrelay_lease_rejections_total";

    /// Leases and stuck completions reclaimed by the reaper.
    pub const STALE_LEASES_TOTAL: &str = "vrelay_stale_leases_total";
}

pub fn record_created(job_type: JobType) {
    counter!(names::JOBS_CREATED_TOTAL, "job_type" => job_type.as_str()).increment(1);
}

pub fn record_claimed(job_type: JobType) {
    counter!(names::JOBS_CLAIMED_TOTAL, "job_type" => job_type.as_str()).increment(1);
}

pub fn record_completed(job_type: JobType) {
    counter!(names::JOBS_COMPLETED_TOTAL, "job_type" => job_type.as_str()).increment(1);
}

pub fn record_failed(job_type: JobType, terminal: bool) {
    let outcome = if terminal { "errored" } else { "retry" };
    counter!(
        names::JOBS_FAILED_TOTAL,
        "job_type" => job_type.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_cancelled(job_type: JobType) {
    counter!(names::JOBS_CANCELLED_TOTAL, "job_type" => job_type.as_str()).increment(1);
}

pub fn record_lease_rejection(operation: &'static str) {
    counter!(names::LEASE_REJECTIONS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_stale_lease(job_type: JobType) {
    counter!(names::STALE_LEASES_TOTAL, "job_type" => job_type.as_str()).increment(1);
}

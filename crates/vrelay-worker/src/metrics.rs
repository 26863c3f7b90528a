//! Local worker metrics.

use metrics::histogram;

use vrelay_models::JobType;

pub mod names {
    /// Wall time of one local job, lock wait included.
    pub const LOCAL_ENCODE_DURATION_SECONDS: &str = "vrelay_local_encode_duration_seconds";
}

pub fn record_local_encode(job_type: JobType, duration_secs: f64) {
    histogram!(names::LOCAL_ENCODE_DURATION_SECONDS, "job_type" => job_type.as_str())
        .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_without_recorder_is_noop() {
        assert!(names::LOCAL_ENCODE_DURATION_SECONDS.starts_with("vrelay_"));
        assert!(names::LOCAL_ENCODE_DURATION_SECONDS.ends_with("_seconds"));
        record_local_encode(JobType::VodHls, 1.5);
    }
}

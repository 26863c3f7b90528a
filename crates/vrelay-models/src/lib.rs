//! Shared data models for the vrelay transcoding scheduler.
//!
//! This crate provides Serde-serializable types for:
//! - Job records, job types and the lease state machine
//! - Remote agent registrations
//! - Public and private job payloads
//! - Runner request payloads and their validation

pub mod agent;
pub mod job;
pub mod payload;
pub mod probe;
pub mod runner;

// Re-export common types
pub use agent::{Agent, AgentId, RunnerToken};
pub use job::{JobId, JobRecord, JobState, JobType, LeaseToken, UnknownJobType, MAX_ERROR_LENGTH};
pub use payload::{
    parent_input, resolve_parent_input, AudioMergePayload, InputRef, LivePayload, OutputSpec,
    PrivatePayload, SingleJobPayload, VodTranscodingPayload,
};
pub use probe::ProbeResult;
pub use runner::{
    validate_filename, Artifact, ArtifactKind, FailureReport, LiveChunkUpdate, PayloadError,
    PayloadResult, RunnerJobView, SuccessPayload,
};

//! Lease-based job scheduling.
//!
//! This crate provides:
//! - Job graph construction for uploads, live streams and single jobs
//! - The claim protocol and job state machine with optimistic concurrency
//! - Stale lease reclamation
//! - Live segment windows, per-video locks and lifecycle events

pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod ladder;
pub mod lease;
pub mod live;
pub mod lock;
pub mod metrics;
pub mod reaper;
pub mod result;

pub use builder::{BuildResult, DependencyBuilder, OptimizeRequest, TranscodingKind};
pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use events::{EventBus, JobEvent};
pub use ladder::{base_priority, PriorityWeight};
pub use lease::{
    FailOutcome, LeaseManager, UpdateAck, LEASE_EXPIRED_REASON, RESULT_NOT_RECORDED_REASON,
};
pub use live::{rendition_of, ChunkChange, LiveChunkController};
pub use lock::{VideoLock, VideoLockGuard};
pub use reaper::StaleLeaseReaper;
pub use result::{JobResultHandler, LoggingResultHandler};

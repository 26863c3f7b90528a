//! In-process transcoding worker.
//!
//! This crate provides:
//! - `LocalWorker`, claiming jobs through the lease manager like a remote agent
//! - The `Encoder` trait and an FFmpeg-backed `ProcessEncoder`
//! - Graceful shutdown that hands running jobs back

pub mod command;
pub mod config;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod worker;

pub use command::{EncodeCommand, EncodeProgress, EncodeRunner};
pub use config::WorkerConfig;
pub use encoder::{output_filenames, EncodeRequest, Encoder, ProcessEncoder};
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use worker::{job_dir, LocalWorker};

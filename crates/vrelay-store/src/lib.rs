//! Job and agent record storage.
//!
//! Provides:
//! - `JobRepository` / `AgentRepository` traits with optimistic concurrency
//! - `MemoryStore`, an in-process implementation with JSON snapshots

pub mod error;
pub mod memory;
pub mod repository;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, Snapshot};
pub use repository::{AgentRepository, JobFilter, JobMutation, JobRepository, Page};

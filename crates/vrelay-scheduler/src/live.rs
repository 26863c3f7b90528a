//! Rolling segment windows for live transcoding jobs.
//!
//! Each (job, rendition) pair keeps the names of its most recent segments.
//! Operations are idempotent so a retried network call cannot shift the
//! window twice.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use vrelay_models::{JobId, LiveChunkUpdate};

const DEFAULT_RENDITION: &str = "default";

/// Effect of one chunk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkChange {
    pub rendition: String,
    /// Window after the operation, oldest first
    pub window: Vec<String>,
    /// Segments pushed out by this operation
    pub evicted: Vec<String>,
    /// First segment ever received for this job
    pub first_chunk: bool,
}

#[derive(Default)]
struct JobWindows {
    renditions: HashMap<String, VecDeque<String>>,
    received_any: bool,
}

/// Live segment window bookkeeping.
pub struct LiveChunkController {
    max_window: usize,
    jobs: Mutex<HashMap<JobId, JobWindows>>,
}

/// Rendition a segment belongs to: the part of the name before the last `-`.
pub fn rendition_of(filename: &str) -> &str {
    let stem = filename.rsplit_once('.').map_or(filename, |(stem, _)| stem);
    match stem.rsplit_once('-') {
        Some((rendition, _)) if !rendition.is_empty() => rendition,
        _ => DEFAULT_RENDITION,
    }
}

impl LiveChunkController {
    pub fn new(max_window: usize) -> Self {
        Self {
            max_window: max_window.max(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn apply(&self, job_id: &JobId, update: &LiveChunkUpdate) -> ChunkChange {
        let filename = update.chunk_filename();
        let rendition = rendition_of(filename).to_string();

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let windows = jobs.entry(job_id.clone()).or_default();
        let first_chunk = !windows.received_any && matches!(update, LiveChunkUpdate::AddChunk { .. });
        let window = windows.renditions.entry(rendition.clone()).or_default();

        let mut evicted = Vec::new();
        match update {
            LiveChunkUpdate::AddChunk { .. } => {
                if !window.iter().any(|s| s == filename) {
                    window.push_back(filename.to_string());
                    while window.len() > self.max_window {
                        if let Some(old) = window.pop_front() {
                            evicted.push(old);
                        }
                    }
                }
            }
            LiveChunkUpdate::RemoveChunk { .. } => {
                window.retain(|s| s != filename);
            }
        }

        let window: Vec<String> = window.iter().cloned().collect();
        if first_chunk {
            windows.received_any = true;
        }

        ChunkChange {
            rendition,
            window,
            evicted,
            first_chunk,
        }
    }

    /// Current window of one rendition, oldest first.
    pub fn window(&self, job_id: &JobId, rendition: &str) -> Vec<String> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id)
            .and_then(|w| w.renditions.get(rendition))
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every window of a job that ended.
    pub fn remove_job(&self, job_id: &JobId) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(job_id);
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

//! Job lifecycle notifications.
//!
//! Published on a broadcast channel for the notification collaborator.
//! Publishing never waits and never fails; events sent while nobody listens
//! are dropped.

use tokio::sync::broadcast;
use tracing::trace;

use vrelay_models::{JobId, JobState, JobType};

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A job was written by the dependency builder.
    Created {
        job_id: JobId,
        job_type: JobType,
        video_key: String,
        parent: Option<JobId>,
    },
    StateChanged {
        job_id: JobId,
        job_type: JobType,
        video_key: String,
        state: JobState,
    },
    /// The original upload of a video is no longer needed by any job.
    InputReleasable { job_id: JobId, video_key: String },
}

/// Broadcast sender for [`JobEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

//! Job dependency builder.
//!
//! Turns a probed source video into one main job per enabled representation
//! plus lower-resolution child jobs that read the main job's output.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use vrelay_models::{
    AudioMergePayload, InputRef, JobId, JobRecord, JobType, LivePayload, OutputSpec,
    PrivatePayload, ProbeResult, SingleJobPayload, VodTranscodingPayload,
};
use vrelay_store::JobRepository;

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventBus, JobEvent};
use crate::ladder::{
    anchor_resolution, base_priority, lower_resolutions, output_fps, PriorityWeight,
    TRANSCODING_PRIORITY,
};
use crate::metrics::record_created;

/// Representation produced by VOD transcoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodingKind {
    Hls,
    WebVideo,
}

impl TranscodingKind {
    pub fn job_type(&self) -> JobType {
        match self {
            TranscodingKind::Hls => JobType::VodHls,
            TranscodingKind::WebVideo => JobType::VodWebVideo,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hls" => Some(Self::Hls),
            "web-video" => Some(Self::WebVideo),
            _ => None,
        }
    }
}

/// Input for building the full ladder of a new or replaced upload.
#[derive(Debug, Clone)]
pub struct OptimizeRequest {
    pub video_key: String,
    /// Location of the original upload
    pub source_url: String,
    /// Still image used when merging an audio-only upload
    pub preview_url: Option<String>,
    pub probe: ProbeResult,
    pub priority: PriorityWeight,
    pub is_new_video: bool,
}

/// Jobs written by one builder call.
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub batch_id: String,
    pub mains: Vec<JobRecord>,
    pub children: Vec<JobRecord>,
}

impl BuildResult {
    pub fn is_empty(&self) -> bool {
        self.mains.is_empty() && self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mains.len() + self.children.len()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.mains.iter().chain(self.children.iter())
    }
}

fn to_value<T: Serialize>(payload: &T) -> SchedulerResult<serde_json::Value> {
    serde_json::to_value(payload).map_err(|e| SchedulerError::validation(e.to_string()))
}

/// Builds and writes job fan-outs.
pub struct DependencyBuilder {
    jobs: Arc<dyn JobRepository>,
    config: Arc<SchedulerConfig>,
    events: EventBus,
}

impl DependencyBuilder {
    pub fn new(jobs: Arc<dyn JobRepository>, config: Arc<SchedulerConfig>, events: EventBus) -> Self {
        Self { jobs, config, events }
    }

    /// Build the main and child jobs for a probed upload.
    ///
    /// Writes nothing and returns an empty result when no representation is
    /// enabled.
    pub async fn create_optimize_jobs(&self, request: &OptimizeRequest) -> SchedulerResult<BuildResult> {
        let plan = self.plan_optimize(request)?;
        self.write(plan).await
    }

    /// Compute the fan-out for an upload without writing it.
    pub fn plan_optimize(&self, request: &OptimizeRequest) -> SchedulerResult<BuildResult> {
        let cfg = &self.config;
        let batch_id = Uuid::new_v4().to_string();

        if !cfg.hls_enabled && !cfg.web_video_enabled {
            debug!(video_key = %request.video_key, "No representation enabled, nothing to build");
            return Ok(BuildResult {
                batch_id,
                ..Default::default()
            });
        }

        let priority = request.priority.resolve(TRANSCODING_PRIORITY);
        let anchor = anchor_resolution(&request.probe, cfg);
        let source = InputRef::Source {
            url: request.source_url.clone(),
        };

        let private = |delete_input_file: bool| PrivatePayload {
            video_key: request.video_key.clone(),
            batch_id: Some(batch_id.clone()),
            is_new_video: request.is_new_video,
            delete_input_file,
            input_released: false,
            output_location: None,
        };

        // The HLS main owns input deletion when enabled; otherwise the muxed main does.
        let hls_owns_input = cfg.hls_enabled;

        if request.probe.is_audio_only {
            let output = OutputSpec {
                resolution: anchor,
                fps: cfg.audio_merge_fps.min(cfg.max_fps),
            };

            let mut mains = Vec::new();
            if cfg.web_video_enabled {
                let payload = AudioMergePayload {
                    input: source.clone(),
                    preview_url: request.preview_url.clone(),
                    output,
                };
                mains.push(JobRecord::new(
                    JobType::VodAudioMerge,
                    to_value(&payload)?,
                    private(!hls_owns_input),
                    priority,
                    None,
                ));
            }
            if cfg.hls_enabled {
                let payload = VodTranscodingPayload {
                    input: source.clone(),
                    output,
                };
                mains.push(JobRecord::new(
                    JobType::VodHls,
                    to_value(&payload)?,
                    private(hls_owns_input),
                    priority,
                    None,
                ));
            }

            return Ok(BuildResult {
                batch_id,
                mains,
                children: Vec::new(),
            });
        }

        let anchor_fps = output_fps(request.probe.input_fps, anchor, true, cfg);
        let kinds: Vec<TranscodingKind> = [
            (cfg.web_video_enabled, TranscodingKind::WebVideo),
            (cfg.hls_enabled, TranscodingKind::Hls),
        ]
        .into_iter()
        .filter_map(|(enabled, kind)| enabled.then_some(kind))
        .collect();

        let lower = lower_resolutions(anchor, cfg);
        let mut mains = Vec::with_capacity(kinds.len());
        let mut children = Vec::new();

        for kind in kinds {
            let owns_input = match kind {
                TranscodingKind::Hls => hls_owns_input,
                TranscodingKind::WebVideo => !hls_owns_input,
            };
            let main_payload = VodTranscodingPayload {
                input: source.clone(),
                output: OutputSpec {
                    resolution: anchor,
                    fps: anchor_fps,
                },
            };
            let main = JobRecord::new(
                kind.job_type(),
                to_value(&main_payload)?,
                private(owns_input),
                priority,
                None,
            );

            for resolution in &lower {
                let payload = VodTranscodingPayload {
                    input: InputRef::ParentOutput {
                        job_id: main.id.clone(),
                    },
                    output: OutputSpec {
                        resolution: *resolution,
                        fps: output_fps(anchor_fps as f64, *resolution, false, cfg),
                    },
                };
                children.push(JobRecord::new(
                    kind.job_type(),
                    to_value(&payload)?,
                    private(false),
                    priority,
                    Some(main.id.clone()),
                ));
            }

            mains.push(main);
        }

        Ok(BuildResult {
            batch_id,
            mains,
            children,
        })
    }

    /// Manual re-encode of one representation.
    ///
    /// The highest listed resolution becomes the main job; the others depend on it.
    pub async fn create_transcoding_jobs(
        &self,
        video_key: &str,
        source_url: &str,
        input_fps: f64,
        kind: TranscodingKind,
        resolutions: &[u32],
        priority: PriorityWeight,
    ) -> SchedulerResult<BuildResult> {
        let Some(max_resolution) = resolutions.iter().copied().max() else {
            return Err(SchedulerError::validation("at least one resolution is required"));
        };

        let batch_id = Uuid::new_v4().to_string();
        let private = PrivatePayload::for_video(video_key).with_batch(batch_id.clone());
        let priority = priority.resolve(TRANSCODING_PRIORITY);
        let anchor_fps = output_fps(input_fps, max_resolution, true, &self.config);

        let main_payload = VodTranscodingPayload {
            input: InputRef::Source {
                url: source_url.to_string(),
            },
            output: OutputSpec {
                resolution: max_resolution,
                fps: anchor_fps,
            },
        };
        let main = JobRecord::new(kind.job_type(), to_value(&main_payload)?, private.clone(), priority, None);

        let mut children_resolutions: Vec<u32> = resolutions
            .iter()
            .copied()
            .filter(|r| *r != max_resolution)
            .collect();
        children_resolutions.sort_unstable_by(|a, b| b.cmp(a));
        children_resolutions.dedup();

        let mut children = Vec::with_capacity(children_resolutions.len());
        for resolution in children_resolutions {
            let payload = VodTranscodingPayload {
                input: InputRef::ParentOutput {
                    job_id: main.id.clone(),
                },
                output: OutputSpec {
                    resolution,
                    fps: output_fps(input_fps, resolution, false, &self.config),
                },
            };
            children.push(JobRecord::new(
                kind.job_type(),
                to_value(&payload)?,
                private.clone(),
                priority,
                Some(main.id.clone()),
            ));
        }

        info!(
            video_key,
            kind = ?kind,
            max_resolution,
            children = children.len(),
            "Creating manual transcoding jobs"
        );

        self.write(BuildResult {
            batch_id,
            mains: vec![main],
            children,
        })
        .await
    }

    /// A single live transcoding job with no children.
    pub async fn create_live_job(
        &self,
        video_key: &str,
        rtmp_url: &str,
        input: &ProbeResult,
        segment_duration: u32,
        priority: PriorityWeight,
    ) -> SchedulerResult<JobRecord> {
        let cfg = &self.config;
        let anchor = anchor_resolution(input, cfg);

        let mut resolutions = vec![anchor];
        resolutions.extend(lower_resolutions(anchor, cfg));

        let to_transcode = resolutions
            .into_iter()
            .map(|resolution| OutputSpec {
                resolution,
                fps: output_fps(input.input_fps, resolution, resolution == anchor, cfg),
            })
            .collect();

        let payload = LivePayload {
            rtmp_url: rtmp_url.to_string(),
            to_transcode,
            segment_duration,
            segment_list_size: cfg.live_window_size,
        };

        let batch_id = Uuid::new_v4().to_string();
        let job = JobRecord::new(
            JobType::LiveRtmpHls,
            to_value(&payload)?,
            PrivatePayload::for_video(video_key).with_batch(batch_id.clone()),
            priority.resolve(base_priority(JobType::LiveRtmpHls)),
            None,
        );

        let mut written = self
            .write(BuildResult {
                batch_id,
                mains: vec![job],
                children: Vec::new(),
            })
            .await?;

        written
            .mains
            .pop()
            .ok_or_else(|| SchedulerError::validation("live job was not written"))
    }

    /// A standalone studio edit, storyboard or transcription job.
    pub async fn create_single_job(
        &self,
        video_key: &str,
        job_type: JobType,
        input_url: &str,
        options: serde_json::Value,
        priority: PriorityWeight,
    ) -> SchedulerResult<JobRecord> {
        if !matches!(
            job_type,
            JobType::VideoStudio | JobType::GenerateStoryboard | JobType::Transcription
        ) {
            return Err(SchedulerError::validation(format!(
                "{} is not a standalone job type",
                job_type
            )));
        }

        let payload = SingleJobPayload {
            input: InputRef::Source {
                url: input_url.to_string(),
            },
            options,
        };
        let job = JobRecord::new(
            job_type,
            to_value(&payload)?,
            PrivatePayload::for_video(video_key),
            priority.resolve(base_priority(job_type)),
            None,
        );

        let id = self.jobs.create(job.clone()).await?;
        self.announce(&job);
        info!(job_id = %id, job_type = %job_type, video_key, "Created job");
        Ok(job)
    }

    /// Mains are written before children so a child never references a
    /// missing parent.
    async fn write(&self, plan: BuildResult) -> SchedulerResult<BuildResult> {
        if plan.is_empty() {
            return Ok(plan);
        }

        for job in plan.jobs() {
            self.jobs.create(job.clone()).await?;
            self.announce(job);
        }

        let main_ids: Vec<&JobId> = plan.mains.iter().map(|j| &j.id).collect();
        info!(
            batch_id = %plan.batch_id,
            mains = ?main_ids,
            children = plan.children.len(),
            "Created transcoding jobs"
        );

        Ok(plan)
    }

    fn announce(&self, job: &JobRecord) {
        record_created(job.job_type);
        self.events.publish(JobEvent::Created {
            job_id: job.id.clone(),
            job_type: job.job_type,
            video_key: job.private_payload.video_key.clone(),
            parent: job.depends_on_job_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrelay_models::JobState;
    use vrelay_store::MemoryStore;

    fn builder(config: SchedulerConfig) -> (DependencyBuilder, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let builder = DependencyBuilder::new(store.clone(), Arc::new(config), events.clone());
        (builder, store, events)
    }

    fn both_enabled(resolutions: &[u32]) -> SchedulerConfig {
        SchedulerConfig {
            enabled_resolutions: resolutions.to_vec(),
            hls_enabled: true,
            web_video_enabled: true,
            ..Default::default()
        }
    }

    fn request(probe: ProbeResult) -> OptimizeRequest {
        OptimizeRequest {
            video_key: "video-1".to_string(),
            source_url: "file:///uploads/video-1.mp4".to_string(),
            preview_url: None,
            probe,
            priority: PriorityWeight::Normal,
            is_new_video: true,
        }
    }

    fn output(job: &JobRecord) -> OutputSpec {
        serde_json::from_value(job.public_payload["output"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_full_ladder_two_mains_six_children() {
        let (builder, store, _) = builder(both_enabled(&[1080, 720, 480, 240]));
        let result = builder
            .create_optimize_jobs(&request(ProbeResult::video(1080, 60.0, true)))
            .await
            .unwrap();

        assert_eq!(result.mains.len(), 2);
        assert_eq!(result.children.len(), 6);

        let types: Vec<JobType> = result.mains.iter().map(|j| j.job_type).collect();
        assert!(types.contains(&JobType::VodHls));
        assert!(types.contains(&JobType::VodWebVideo));

        for main in &result.mains {
            assert!(main.depends_on_job_id.is_none());
            assert_eq!(main.state, JobState::Pending);
            assert_eq!(output(main), OutputSpec { resolution: 1080, fps: 60 });
        }

        for child in &result.children {
            let parent_id = child.depends_on_job_id.as_ref().unwrap();
            let parent = result.mains.iter().find(|m| &m.id == parent_id).unwrap();
            assert_eq!(parent.job_type, child.job_type);
            assert_eq!(child.state, JobState::WaitingForParent);
            assert_eq!(child.priority, parent.priority);
        }

        let low = result
            .children
            .iter()
            .find(|c| output(c).resolution == 240)
            .unwrap();
        assert_eq!(output(low).fps, 30);

        assert_eq!(store.list_for_video("video-1").await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_single_input_owner() {
        let (builder, _, _) = builder(both_enabled(&[1080, 720]));
        let result = builder
            .create_optimize_jobs(&request(ProbeResult::video(1080, 30.0, true)))
            .await
            .unwrap();

        let owners: Vec<&JobRecord> = result
            .jobs()
            .filter(|j| j.private_payload.delete_input_file)
            .collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].job_type, JobType::VodHls);
        assert!(owners[0].depends_on_job_id.is_none());
    }

    #[tokio::test]
    async fn test_no_lower_resolutions_means_no_children() {
        let (builder, _, _) = builder(both_enabled(&[720, 1080]));
        let result = builder
            .create_optimize_jobs(&request(ProbeResult::video(720, 30.0, true)))
            .await
            .unwrap();
        assert_eq!(result.mains.len(), 2);
        assert!(result.children.is_empty());
    }

    #[tokio::test]
    async fn test_audio_only_has_no_children() {
        let (builder, _, _) = builder(both_enabled(&[1080, 720, 480, 240]));
        let result = builder
            .create_optimize_jobs(&request(ProbeResult::audio_only()))
            .await
            .unwrap();

        assert!(result.children.is_empty());
        let types: Vec<JobType> = result.mains.iter().map(|j| j.job_type).collect();
        assert_eq!(types, vec![JobType::VodAudioMerge, JobType::VodHls]);
        assert_eq!(output(&result.mains[0]), OutputSpec { resolution: 480, fps: 25 });
    }

    #[tokio::test]
    async fn test_nothing_enabled_writes_nothing() {
        let config = SchedulerConfig {
            hls_enabled: false,
            web_video_enabled: false,
            ..Default::default()
        };
        let (builder, store, _) = builder(config);
        let result = builder
            .create_optimize_jobs(&request(ProbeResult::video(1080, 30.0, true)))
            .await
            .unwrap();

        assert!(result.is_empty());
        assert!(store.list_for_video("video-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_priority_weight_applies_to_whole_fan_out() {
        let (builder, _, _) = builder(both_enabled(&[1080, 720]));
        let mut req = request(ProbeResult::video(1080, 30.0, true));
        req.priority = PriorityWeight::Interactive;
        let result = builder.create_optimize_jobs(&req).await.unwrap();
        assert!(result.jobs().all(|j| j.priority == 50));
    }

    #[tokio::test]
    async fn test_creation_events_published() {
        let (builder, _, events) = builder(both_enabled(&[1080, 720]));
        let mut rx = events.subscribe();
        let result = builder
            .create_optimize_jobs(&request(ProbeResult::video(1080, 30.0, true)))
            .await
            .unwrap();

        let mut created = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, JobEvent::Created { .. }));
            created += 1;
        }
        assert_eq!(created, result.len());
    }

    #[tokio::test]
    async fn test_manual_transcoding_jobs() {
        let (builder, _, _) = builder(SchedulerConfig::default());
        let result = builder
            .create_transcoding_jobs(
                "video-1",
                "file:///v.mp4",
                60.0,
                TranscodingKind::WebVideo,
                &[480, 1080, 720],
                PriorityWeight::Background,
            )
            .await
            .unwrap();

        assert_eq!(result.mains.len(), 1);
        assert_eq!(output(&result.mains[0]).resolution, 1080);
        assert_eq!(result.children.len(), 2);
        assert!(result.jobs().all(|j| j.job_type == JobType::VodWebVideo));
        assert!(result.jobs().all(|j| j.priority == 150));

        let err = builder
            .create_transcoding_jobs("video-1", "u", 30.0, TranscodingKind::Hls, &[], PriorityWeight::Normal)
            .await;
        assert!(matches!(err, Err(SchedulerError::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_live_and_single_jobs() {
        let (builder, _, _) = builder(both_enabled(&[1080, 720, 480]));
        let live = builder
            .create_live_job(
                "video-2",
                "rtmp://localhost/live/abc",
                &ProbeResult::video(720, 30.0, true),
                2,
                PriorityWeight::Normal,
            )
            .await
            .unwrap();
        assert_eq!(live.job_type, JobType::LiveRtmpHls);
        assert_eq!(live.public_payload["toTranscode"].as_array().unwrap().len(), 2);
        assert_eq!(live.public_payload["segmentListSize"], 15);

        let transcription = builder
            .create_single_job(
                "video-2",
                JobType::Transcription,
                "file:///v.mp4",
                serde_json::Value::Null,
                PriorityWeight::Normal,
            )
            .await
            .unwrap();
        assert_eq!(transcription.priority, 200);

        let bad = builder
            .create_single_job("video-2", JobType::VodHls, "u", serde_json::Value::Null, PriorityWeight::Normal)
            .await;
        assert!(bad.is_err());
    }
}

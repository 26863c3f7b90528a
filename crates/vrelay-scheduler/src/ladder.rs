//! Resolution ladder, frame rate capping and priorities.

use vrelay_models::{JobType, ProbeResult};

use crate::config::SchedulerConfig;

/// Renditions at or above this height keep the source frame rate.
const KEEP_ORIGIN_FPS_RESOLUTION_MIN: u32 = 720;

/// Frame rate cap for lower renditions.
const LOW_RESOLUTION_MAX_FPS: u32 = 30;

pub const TRANSCODING_PRIORITY: i32 = 100;
pub const VIDEO_STUDIO_PRIORITY: i32 = 150;
pub const STORYBOARD_PRIORITY: i32 = 150;
pub const TRANSCRIPTION_PRIORITY: i32 = 200;

/// Offset applied by the non-default weights.
const PRIORITY_STEP: i32 = 50;

/// Base priority for a job type.
pub fn base_priority(job_type: JobType) -> i32 {
    match job_type {
        JobType::VodWebVideo
        | JobType::VodHls
        | JobType::VodAudioMerge
        | JobType::LiveRtmpHls => TRANSCODING_PRIORITY,
        JobType::VideoStudio => VIDEO_STUDIO_PRIORITY,
        JobType::GenerateStoryboard => STORYBOARD_PRIORITY,
        JobType::Transcription => TRANSCRIPTION_PRIORITY,
    }
}

/// Caller-supplied urgency. Lower resolved values are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityWeight {
    /// A user is waiting on the result
    Interactive,
    #[default]
    Normal,
    /// Bulk or maintenance work
    Background,
    Explicit(i32),
}

impl PriorityWeight {
    pub fn resolve(self, base: i32) -> i32 {
        match self {
            PriorityWeight::Interactive => base - PRIORITY_STEP,
            PriorityWeight::Normal => base,
            PriorityWeight::Background => base + PRIORITY_STEP,
            PriorityWeight::Explicit(value) => value,
        }
    }

    /// Parse `interactive`, `normal`, `background` or an integer.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Some(Self::Interactive),
            "normal" => Some(Self::Normal),
            "background" => Some(Self::Background),
            other => other.parse().ok().map(Self::Explicit),
        }
    }
}

/// Largest enabled resolution not above the source, or the source itself
/// when every enabled resolution is larger. Audio-only sources use the
/// configured audio pseudo-resolution.
pub fn anchor_resolution(probe: &ProbeResult, config: &SchedulerConfig) -> u32 {
    if probe.is_audio_only {
        return config.audio_resolution;
    }

    config
        .enabled_resolutions
        .iter()
        .copied()
        .filter(|r| *r <= probe.max_resolution)
        .max()
        .unwrap_or(probe.max_resolution)
}

/// Enabled resolutions strictly below `anchor`, highest first.
pub fn lower_resolutions(anchor: u32, config: &SchedulerConfig) -> Vec<u32> {
    let mut lower: Vec<u32> = config
        .enabled_resolutions
        .iter()
        .copied()
        .filter(|r| *r < anchor)
        .collect();
    lower.sort_unstable_by(|a, b| b.cmp(a));
    lower.dedup();
    lower
}

/// Output frame rate for one rendition.
pub fn output_fps(input_fps: f64, resolution: u32, is_anchor: bool, config: &SchedulerConfig) -> u32 {
    let input = if input_fps.is_finite() && input_fps > 0.0 {
        input_fps.round() as u32
    } else {
        0
    };

    let mut fps = input.min(config.max_fps);

    if !is_anchor && resolution < KEEP_ORIGIN_FPS_RESOLUTION_MIN {
        fps = fps.min(LOW_RESOLUTION_MAX_FPS);
    }
    if is_anchor {
        fps = fps.max(config.min_fps);
    }

    fps
}

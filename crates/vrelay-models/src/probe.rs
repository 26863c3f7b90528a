//! Probe results supplied by the media-probing collaborator.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Properties of a source video relevant to ladder construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// Height of the largest video stream, in pixels
    pub max_resolution: u32,
    pub input_fps: f64,
    pub has_audio: bool,
    #[serde(default)]
    pub is_audio_only: bool,
}

impl ProbeResult {
    pub fn video(max_resolution: u32, input_fps: f64, has_audio: bool) -> Self {
        Self {
            max_resolution,
            input_fps,
            has_audio,
            is_audio_only: false,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            max_resolution: 0,
            input_fps: 0.0,
            has_audio: true,
            is_audio_only: true,
        }
    }
}

//! Job payloads.
//!
//! Public payloads are what an executing agent receives; they are stored as
//! opaque JSON on the record and built from the typed structs below.
//! [`PrivatePayload`] never leaves the scheduler process.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Where an agent reads its input from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InputRef {
    /// The original upload.
    Source { url: String },
    /// The output produced by the parent job.
    ParentOutput {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

/// Target rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputSpec {
    pub resolution: u32,
    pub fps: u32,
}

/// Payload for `vod-web-video-transcoding` and `vod-hls-transcoding`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VodTranscodingPayload {
    pub input: InputRef,
    pub output: OutputSpec,
}

/// Payload for `vod-audio-merge-transcoding`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AudioMergePayload {
    pub input: InputRef,
    /// Still image rendered under the audio track
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    pub output: OutputSpec,
}

/// Payload for `live-rtmp-hls-transcoding`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LivePayload {
    pub rtmp_url: String,
    pub to_transcode: Vec<OutputSpec>,
    /// Segment duration in seconds
    pub segment_duration: u32,
    /// Number of segments kept in each rendition playlist
    pub segment_list_size: usize,
}

/// Payload shared by studio edits, storyboards and transcriptions.
///
/// `options` is forwarded to the agent untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SingleJobPayload {
    pub input: InputRef,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

/// Scheduler-side data attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrivatePayload {
    /// Internal key of the video this job belongs to
    pub video_key: String,

    /// Groups the jobs created by one builder call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    #[serde(default)]
    pub is_new_video: bool,

    /// This job owns the right to release the original upload
    #[serde(default)]
    pub delete_input_file: bool,

    /// Set once the release has been signalled
    #[serde(default)]
    pub input_released: bool,

    /// Where the agent that completed this job put its main artifact.
    /// Children read their input from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
}

impl PrivatePayload {
    pub fn for_video(video_key: impl Into<String>) -> Self {
        Self {
            video_key: video_key.into(),
            ..Default::default()
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Rewrite a public payload's `input` from the parent's output to the
/// location that output was stored at. Payloads without a parent input are
/// returned unchanged.
pub fn resolve_parent_input(payload: &serde_json::Value, location: &str) -> serde_json::Value {
    let mut resolved = payload.clone();
    let is_parent = serde_json::from_value::<InputRef>(payload["input"].clone())
        .map(|input| matches!(input, InputRef::ParentOutput { .. }))
        .unwrap_or(false);

    if is_parent {
        if let Ok(source) = serde_json::to_value(InputRef::Source {
            url: location.to_string(),
        }) {
            resolved["input"] = source;
        }
    }
    resolved
}

/// The parent job a payload reads its input from, if any.
pub fn parent_input(payload: &serde_json::Value) -> Option<JobId> {
    match serde_json::from_value::<InputRef>(payload.get("input")?.clone()) {
        Ok(InputRef::ParentOutput { job_id }) => Some(job_id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_ref_wire_shape() {
        let input = InputRef::ParentOutput {
            job_id: JobId::from_string("abc"),
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["kind"], "parent-output");
        assert_eq!(json["jobId"], "abc");
    }

    #[test]
    fn test_parent_input_resolves_to_source() {
        let payload = serde_json::json!({
            "input": { "kind": "parent-output", "jobId": "parent-1" },
            "output": { "resolution": 720, "fps": 30 },
        });
        assert_eq!(parent_input(&payload), Some(JobId::from_string("parent-1")));

        let resolved = resolve_parent_input(&payload, "https://storage.example/1080.mp4");
        assert_eq!(resolved["input"]["kind"], "source");
        assert_eq!(resolved["input"]["url"], "https://storage.example/1080.mp4");
        assert_eq!(resolved["output"]["resolution"], 720);
        assert!(!resolved.to_string().contains("parent-1"));

        let source = serde_json::json!({ "input": { "kind": "source", "url": "/in.mp4" } });
        assert_eq!(parent_input(&source), None);
        assert_eq!(resolve_parent_input(&source, "elsewhere"), source);
    }

    #[test]
    fn test_live_payload_camel_case() {
        let payload = LivePayload {
            rtmp_url: "rtmp://localhost/live/key".to_string(),
            to_transcode: vec![OutputSpec { resolution: 720, fps: 30 }],
            segment_duration: 2,
            segment_list_size: 15,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["rtmpUrl"], "rtmp://localhost/live/key");
        assert_eq!(json["segmentListSize"], 15);
    }
}

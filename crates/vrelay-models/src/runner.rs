//! Payloads exchanged with remote runners.
//!
//! Everything here is parsed from untrusted input. Artifact filenames are
//! later joined onto filesystem paths, so they must pass [`validate_filename`]
//! before any state changes.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::job::{JobId, JobRecord, JobType, LeaseToken};

static SAFE_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]+\.([a-zA-Z0-9]+)$").expect("valid filename regex")
});

/// Errors raised while validating runner payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("Invalid filename for {field}: {filename}")]
    InvalidFilename { field: &'static str, filename: String },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unexpected field: {0}")]
    UnexpectedField(&'static str),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

pub type PayloadResult<T> = Result<T, PayloadError>;

/// Expected content of an artifact, which fixes its allowed extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Video,
    Playlist,
    Caption,
    Image,
    Segment,
}

impl ArtifactKind {
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ArtifactKind::Video => &["mp4", "webm", "mkv", "m4a"],
            ArtifactKind::Playlist => &["m3u8"],
            ArtifactKind::Caption => &["vtt"],
            ArtifactKind::Image => &["jpg", "jpeg", "png"],
            ArtifactKind::Segment => &["ts", "m4s", "mp4"],
        }
    }
}

/// Check a filename against the safe charset and the kind's extensions.
pub fn validate_filename(
    field: &'static str,
    filename: &str,
    kind: ArtifactKind,
) -> PayloadResult<()> {
    let invalid = || PayloadError::InvalidFilename {
        field,
        filename: filename.to_string(),
    };

    let caps = SAFE_FILENAME.captures(filename).ok_or_else(invalid)?;
    let ext = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());

    match ext {
        Some(ext) if kind.extensions().contains(&ext.as_str()) => Ok(()),
        _ => Err(invalid()),
    }
}

/// A file produced by an agent: its name and where the agent put it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    pub filename: String,
    pub location: String,
}

impl Artifact {
    fn validate_as(&self, field: &'static str, kind: ArtifactKind) -> PayloadResult<()> {
        validate_filename(field, &self.filename, kind)?;
        if self.location.trim().is_empty() {
            return Err(PayloadError::MissingField(field));
        }
        Ok(())
    }
}

/// Validated result of a successful job, by job type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SuccessPayload {
    WebVideo {
        video_file: Artifact,
    },
    Hls {
        video_file: Artifact,
        resolution_playlist_file: Artifact,
    },
    AudioMerge {
        video_file: Artifact,
    },
    Studio {
        video_file: Artifact,
    },
    Storyboard {
        storyboard_file: Artifact,
    },
    Transcription {
        vtt_file: Artifact,
        input_language: String,
    },
    /// Live output was already streamed through chunk updates.
    Live,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSuccess {
    video_file: Option<Artifact>,
    resolution_playlist_file: Option<Artifact>,
    storyboard_file: Option<Artifact>,
    vtt_file: Option<Artifact>,
    input_language: Option<String>,
}

fn required(value: Option<Artifact>, field: &'static str, kind: ArtifactKind) -> PayloadResult<Artifact> {
    let artifact = value.ok_or(PayloadError::MissingField(field))?;
    artifact.validate_as(field, kind)?;
    Ok(artifact)
}

impl SuccessPayload {
    /// Parse and validate a success payload for `job_type`.
    pub fn parse(job_type: JobType, value: serde_json::Value) -> PayloadResult<Self> {
        if job_type == JobType::LiveRtmpHls {
            let empty = match &value {
                serde_json::Value::Null => true,
                serde_json::Value::Object(map) => map.is_empty(),
                _ => false,
            };
            return if empty {
                Ok(SuccessPayload::Live)
            } else {
                Err(PayloadError::Malformed(
                    "live success payload must be empty".to_string(),
                ))
            };
        }

        let raw: RawSuccess =
            serde_json::from_value(value).map_err(|e| PayloadError::Malformed(e.to_string()))?;

        let payload = match job_type {
            JobType::VodWebVideo => SuccessPayload::WebVideo {
                video_file: required(raw.video_file, "videoFile", ArtifactKind::Video)?,
            },
            JobType::VodHls => SuccessPayload::Hls {
                video_file: required(raw.video_file, "videoFile", ArtifactKind::Video)?,
                resolution_playlist_file: required(
                    raw.resolution_playlist_file,
                    "resolutionPlaylistFile",
                    ArtifactKind::Playlist,
                )?,
            },
            JobType::VodAudioMerge => SuccessPayload::AudioMerge {
                video_file: required(raw.video_file, "videoFile", ArtifactKind::Video)?,
            },
            JobType::VideoStudio => SuccessPayload::Studio {
                video_file: required(raw.video_file, "videoFile", ArtifactKind::Video)?,
            },
            JobType::GenerateStoryboard => SuccessPayload::Storyboard {
                storyboard_file: required(raw.storyboard_file, "storyboardFile", ArtifactKind::Image)?,
            },
            JobType::Transcription => {
                let input_language = raw
                    .input_language
                    .filter(|l| !l.trim().is_empty())
                    .ok_or(PayloadError::MissingField("inputLanguage"))?;
                SuccessPayload::Transcription {
                    vtt_file: required(raw.vtt_file, "vttFile", ArtifactKind::Caption)?,
                    input_language,
                }
            }
            JobType::LiveRtmpHls => SuccessPayload::Live,
        };

        Ok(payload)
    }

    /// Location of the artifact later jobs read as their input.
    pub fn output_location(&self) -> Option<&str> {
        match self {
            SuccessPayload::WebVideo { video_file }
            | SuccessPayload::Hls { video_file, .. }
            | SuccessPayload::AudioMerge { video_file }
            | SuccessPayload::Studio { video_file } => Some(&video_file.location),
            SuccessPayload::Storyboard { .. }
            | SuccessPayload::Transcription { .. }
            | SuccessPayload::Live => None,
        }
    }

    /// True if this result is the shape expected for `job_type`.
    pub fn fits(&self, job_type: JobType) -> bool {
        matches!(
            (self, job_type),
            (SuccessPayload::WebVideo { .. }, JobType::VodWebVideo)
                | (SuccessPayload::Hls { .. }, JobType::VodHls)
                | (SuccessPayload::AudioMerge { .. }, JobType::VodAudioMerge)
                | (SuccessPayload::Studio { .. }, JobType::VideoStudio)
                | (SuccessPayload::Storyboard { .. }, JobType::GenerateStoryboard)
                | (SuccessPayload::Transcription { .. }, JobType::Transcription)
                | (SuccessPayload::Live, JobType::LiveRtmpHls)
        )
    }
}

/// One chunk operation reported by a live transcoding agent.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveChunkUpdate {
    AddChunk {
        video_chunk_filename: String,
        video_chunk_artifact: Artifact,
        resolution_playlist_filename: Option<String>,
        resolution_playlist_artifact: Option<Artifact>,
        master_playlist_artifact: Option<Artifact>,
    },
    RemoveChunk {
        video_chunk_filename: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChunkUpdate {
    #[serde(rename = "type")]
    kind: String,
    video_chunk_filename: Option<String>,
    video_chunk_artifact: Option<Artifact>,
    resolution_playlist_filename: Option<String>,
    resolution_playlist_artifact: Option<Artifact>,
    master_playlist_artifact: Option<Artifact>,
}

impl LiveChunkUpdate {
    /// Parse and validate a live update payload.
    pub fn parse(value: serde_json::Value) -> PayloadResult<Self> {
        let raw: RawChunkUpdate =
            serde_json::from_value(value).map_err(|e| PayloadError::Malformed(e.to_string()))?;

        let filename = raw
            .video_chunk_filename
            .ok_or(PayloadError::MissingField("videoChunkFilename"))?;
        validate_filename("videoChunkFilename", &filename, ArtifactKind::Segment)?;

        match raw.kind.as_str() {
            "add-chunk" => {
                let chunk = required(
                    raw.video_chunk_artifact,
                    "videoChunkArtifact",
                    ArtifactKind::Segment,
                )?;
                if chunk.filename != filename {
                    return Err(PayloadError::InvalidFilename {
                        field: "videoChunkArtifact",
                        filename: chunk.filename,
                    });
                }

                if let Some(name) = &raw.resolution_playlist_filename {
                    validate_filename("resolutionPlaylistFilename", name, ArtifactKind::Playlist)?;
                }
                if let Some(artifact) = &raw.resolution_playlist_artifact {
                    artifact.validate_as("resolutionPlaylistArtifact", ArtifactKind::Playlist)?;
                }
                if let Some(artifact) = &raw.master_playlist_artifact {
                    artifact.validate_as("masterPlaylistArtifact", ArtifactKind::Playlist)?;
                }

                Ok(LiveChunkUpdate::AddChunk {
                    video_chunk_filename: filename,
                    video_chunk_artifact: chunk,
                    resolution_playlist_filename: raw.resolution_playlist_filename,
                    resolution_playlist_artifact: raw.resolution_playlist_artifact,
                    master_playlist_artifact: raw.master_playlist_artifact,
                })
            }
            "remove-chunk" => {
                if raw.video_chunk_artifact.is_some() {
                    return Err(PayloadError::UnexpectedField("videoChunkArtifact"));
                }
                if raw.resolution_playlist_artifact.is_some() || raw.master_playlist_artifact.is_some() {
                    return Err(PayloadError::UnexpectedField("playlistArtifact"));
                }
                Ok(LiveChunkUpdate::RemoveChunk {
                    video_chunk_filename: filename,
                })
            }
            other => Err(PayloadError::Malformed(format!("unknown update type: {}", other))),
        }
    }

    pub fn chunk_filename(&self) -> &str {
        match self {
            LiveChunkUpdate::AddChunk { video_chunk_filename, .. } => video_chunk_filename,
            LiveChunkUpdate::RemoveChunk { video_chunk_filename } => video_chunk_filename,
        }
    }
}

/// Failure or abort report from an agent.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct FailureReport {
    #[validate(length(min = 1, max = 5000))]
    pub reason: String,
}

impl FailureReport {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The view of a job handed to the agent that claimed it.
///
/// Built from a [`JobRecord`]; the private payload is never included.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerJobView {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub lease_token: LeaseToken,
}

impl RunnerJobView {
    /// Build the view for a freshly leased job. Returns `None` when the
    /// record holds no lease.
    pub fn from_leased(job: &JobRecord) -> Option<Self> {
        let lease_token = job.lease_token.clone()?;
        Some(Self {
            id: job.id.clone(),
            job_type: job.job_type,
            payload: job.public_payload.clone(),
            lease_token,
        })
    }

    /// Replace the payload, e.g. once a parent's output has been resolved.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentId;
    use crate::payload::PrivatePayload;
    use serde_json::json;

    fn artifact(name: &str) -> serde_json::Value {
        json!({ "filename": name, "location": format!("uploads/{}", name) })
    }

    #[test]
    fn test_filename_rejects_traversal_and_bad_extensions() {
        assert!(validate_filename("f", "720.mp4", ArtifactKind::Video).is_ok());
        assert!(validate_filename("f", "seg_0-1.ts", ArtifactKind::Segment).is_ok());
        assert!(validate_filename("f", "../720.mp4", ArtifactKind::Video).is_err());
        assert!(validate_filename("f", "a/720.mp4", ArtifactKind::Video).is_err());
        assert!(validate_filename("f", "720..mp4", ArtifactKind::Video).is_err());
        assert!(validate_filename("f", "720.exe", ArtifactKind::Video).is_err());
        assert!(validate_filename("f", "720.mp4", ArtifactKind::Playlist).is_err());
        assert!(validate_filename("f", "", ArtifactKind::Video).is_err());
    }

    #[test]
    fn test_hls_success_requires_playlist() {
        let missing = SuccessPayload::parse(JobType::VodHls, json!({ "videoFile": artifact("720.mp4") }));
        assert_eq!(missing, Err(PayloadError::MissingField("resolutionPlaylistFile")));

        let ok = SuccessPayload::parse(
            JobType::VodHls,
            json!({
                "videoFile": artifact("720-fragmented.mp4"),
                "resolutionPlaylistFile": artifact("720.m3u8"),
            }),
        );
        assert!(matches!(ok, Ok(SuccessPayload::Hls { .. })));
    }

    #[test]
    fn test_web_video_success_rejects_unsafe_name() {
        let result = SuccessPayload::parse(
            JobType::VodWebVideo,
            json!({ "videoFile": artifact("../../etc/passwd.mp4") }),
        );
        assert!(matches!(result, Err(PayloadError::InvalidFilename { .. })));
    }

    #[test]
    fn test_live_success_must_be_empty() {
        assert_eq!(SuccessPayload::parse(JobType::LiveRtmpHls, json!({})), Ok(SuccessPayload::Live));
        assert!(SuccessPayload::parse(JobType::LiveRtmpHls, json!({ "videoFile": artifact("a.mp4") })).is_err());
    }

    #[test]
    fn test_transcription_requires_language() {
        let result = SuccessPayload::parse(JobType::Transcription, json!({ "vttFile": artifact("en.vtt") }));
        assert_eq!(result, Err(PayloadError::MissingField("inputLanguage")));
    }

    #[test]
    fn test_add_chunk_parse() {
        let update = LiveChunkUpdate::parse(json!({
            "type": "add-chunk",
            "videoChunkFilename": "720-000001.ts",
            "videoChunkArtifact": artifact("720-000001.ts"),
            "masterPlaylistArtifact": artifact("master.m3u8"),
        }))
        .unwrap();
        assert_eq!(update.chunk_filename(), "720-000001.ts");
    }

    #[test]
    fn test_remove_chunk_with_artifact_rejected() {
        let result = LiveChunkUpdate::parse(json!({
            "type": "remove-chunk",
            "videoChunkFilename": "720-000001.ts",
            "videoChunkArtifact": artifact("720-000001.ts"),
        }));
        assert_eq!(result, Err(PayloadError::UnexpectedField("videoChunkArtifact")));
    }

    #[test]
    fn test_add_chunk_without_artifact_rejected() {
        let result = LiveChunkUpdate::parse(json!({
            "type": "add-chunk",
            "videoChunkFilename": "720-000001.ts",
        }));
        assert_eq!(result, Err(PayloadError::MissingField("videoChunkArtifact")));
    }

    #[test]
    fn test_failure_report_bounds() {
        assert!(FailureReport::new("boom").validate().is_ok());
        assert!(FailureReport::new("").validate().is_err());
        assert!(FailureReport::new("x".repeat(5001)).validate().is_err());
    }

    #[test]
    fn test_runner_view_hides_private_payload() {
        let mut job = JobRecord::new(
            JobType::VodWebVideo,
            json!({ "output": { "resolution": 720, "fps": 30 } }),
            PrivatePayload::for_video("internal-video-42"),
            100,
            None,
        );
        assert!(RunnerJobView::from_leased(&job).is_none());

        job.start_lease(AgentId::new());
        let view = RunnerJobView::from_leased(&job).unwrap();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("internal-video-42"));
        assert!(json.contains("leaseToken"));
    }
}

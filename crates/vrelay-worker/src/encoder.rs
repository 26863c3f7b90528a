//! Encoders executed by the local worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use vrelay_models::{Artifact, JobId, JobType, OutputSpec, SuccessPayload};

use crate::command::{EncodeCommand, EncodeProgress, EncodeRunner};
use crate::error::{WorkerError, WorkerResult};

/// HLS segment length in seconds.
const HLS_SEGMENT_SECONDS: u32 = 4;

const X264_PRESET: &str = "veryfast";
const X264_CRF: u8 = 23;

/// A resolved encode: inputs are local paths or URLs the encoder can read.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub job_id: JobId,
    pub job_type: JobType,
    pub input: String,
    /// Still image for audio merges
    pub preview: Option<String>,
    pub output: OutputSpec,
    pub output_dir: PathBuf,
}

/// Names of the files a job type produces for `resolution`: the video file
/// and, for HLS, the rendition playlist.
pub fn output_filenames(job_type: JobType, resolution: u32) -> (String, Option<String>) {
    match job_type {
        JobType::VodHls => (
            format!("{}-fragmented.mp4", resolution),
            Some(format!("{}.m3u8", resolution)),
        ),
        _ => (format!("{}.mp4", resolution), None),
    }
}

fn artifact(dir: &Path, filename: &str) -> Artifact {
    Artifact {
        filename: filename.to_string(),
        location: dir.join(filename).to_string_lossy().to_string(),
    }
}

/// Produces the result of one job.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: watch::Sender<EncodeProgress>,
    ) -> WorkerResult<SuccessPayload>;
}

/// Encoder driving an external FFmpeg-compatible process.
#[derive(Debug, Clone)]
pub struct ProcessEncoder {
    runner: EncodeRunner,
}

impl ProcessEncoder {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner: EncodeRunner::new(program).with_timeout(timeout),
        }
    }

    pub fn build_command(&self, request: &EncodeRequest) -> WorkerResult<EncodeCommand> {
        let OutputSpec { resolution, fps } = request.output;
        let dir = &request.output_dir;
        let (video_file, playlist_file) = output_filenames(request.job_type, resolution);

        let cmd = match request.job_type {
            JobType::VodWebVideo => EncodeCommand::new(dir.join(&video_file))
                .input(&request.input)
                .scale_to(resolution)
                .frame_rate(fps)
                .h264(X264_PRESET, X264_CRF)
                .aac()
                .output_args(["-movflags", "+faststart"]),
            JobType::VodHls => {
                let playlist = playlist_file.unwrap_or_else(|| format!("{}.m3u8", resolution));
                EncodeCommand::new(dir.join(playlist))
                    .input(&request.input)
                    .scale_to(resolution)
                    .frame_rate(fps)
                    .h264(X264_PRESET, X264_CRF)
                    .aac()
                    .output_args(["-f", "hls", "-hls_playlist_type", "vod"])
                    .output_args(["-hls_time".to_string(), HLS_SEGMENT_SECONDS.to_string()])
                    .output_args(["-hls_segment_type", "fmp4", "-hls_flags", "single_file"])
                    .output_arg("-hls_segment_filename")
                    .output_arg(dir.join(&video_file).to_string_lossy().to_string())
            }
            JobType::VodAudioMerge => {
                let cmd = EncodeCommand::new(dir.join(&video_file));
                let cmd = match &request.preview {
                    Some(preview) => cmd.input_with(preview, ["-loop", "1"]),
                    None => cmd.input_with(
                        format!("color=c=black:s=16x{}:r={}", resolution, fps),
                        ["-f", "lavfi"],
                    ),
                };
                cmd.input(&request.input)
                    .output_args(["-map", "0:v", "-map", "1:a"])
                    .scale_to(resolution)
                    .frame_rate(fps)
                    .output_args(["-c:v", "libx264", "-tune", "stillimage"])
                    .aac()
                    .output_arg("-shortest")
            }
            other => return Err(WorkerError::Unsupported(other)),
        };

        Ok(cmd)
    }
}

#[async_trait]
impl Encoder for ProcessEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: watch::Sender<EncodeProgress>,
    ) -> WorkerResult<SuccessPayload> {
        let cmd = self.build_command(request)?;
        self.runner
            .run(&cmd, move |p| {
                progress.send_replace(p);
            })
            .await?;

        let dir = &request.output_dir;
        let (video_file, playlist_file) = output_filenames(request.job_type, request.output.resolution);
        let mut produced = vec![video_file.clone()];
        produced.extend(playlist_file.clone());
        for file in &produced {
            if tokio::fs::metadata(dir.join(file)).await.is_err() {
                return Err(WorkerError::encode_failed(format!("encoder did not produce {}", file)));
            }
        }

        let video_file = artifact(dir, &video_file);
        Ok(match (request.job_type, playlist_file) {
            (JobType::VodHls, Some(playlist)) => SuccessPayload::Hls {
                video_file,
                resolution_playlist_file: artifact(dir, &playlist),
            },
            (JobType::VodAudioMerge, _) => SuccessPayload::AudioMerge { video_file },
            _ => SuccessPayload::WebVideo { video_file },
        })
    }
}

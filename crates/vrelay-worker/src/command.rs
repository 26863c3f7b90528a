//! Encoder command builder and runner.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};

/// One `-i` input with the arguments that precede it.
#[derive(Debug, Clone)]
struct Input {
    args: Vec<String>,
    source: String,
}

/// Builder for FFmpeg-compatible command lines.
#[derive(Debug, Clone)]
pub struct EncodeCommand {
    inputs: Vec<Input>,
    output_args: Vec<String>,
    output: PathBuf,
}

impl EncodeCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output_args: Vec::new(),
            output: output.as_ref().to_path_buf(),
        }
    }

    /// Add an input.
    pub fn input(self, source: impl Into<String>) -> Self {
        self.input_with::<_, String>(source, [])
    }

    /// Add an input preceded by input options such as `-loop 1`.
    pub fn input_with<I, S>(mut self, source: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.push(Input {
            args: args.into_iter().map(Into::into).collect(),
            source: source.into(),
        });
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Scale to `height` lines, keeping the aspect ratio with an even width.
    pub fn scale_to(self, height: u32) -> Self {
        self.output_arg("-vf").output_arg(format!("scale=-2:{}", height))
    }

    pub fn frame_rate(self, fps: u32) -> Self {
        self.output_arg("-r").output_arg(fps.to_string())
    }

    /// H.264 video at the given x264 preset and constant rate factor.
    pub fn h264(self, preset: &str, crf: u8) -> Self {
        self.output_args(["-c:v", "libx264", "-preset", preset])
            .output_args(["-crf".to_string(), crf.to_string()])
    }

    pub fn aac(self) -> Self {
        self.output_args(["-c:a", "aac"])
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Full argument list; progress blocks are written to stderr.
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-v", "error", "-progress", "pipe:2"]
            .into_iter()
            .map(String::from)
            .collect();

        for input in &self.inputs {
            args.extend(input.args.iter().cloned());
            args.push("-i".to_string());
            args.push(input.source.clone());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Progress reported by the encoder on stderr.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeProgress {
    pub frame: u64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed relative to realtime
    pub speed: f64,
    pub is_complete: bool,
}

/// Runs an [`EncodeCommand`] with a given executable.
#[derive(Debug, Clone)]
pub struct EncodeRunner {
    program: String,
    timeout: Option<Duration>,
}

impl EncodeRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the command, feeding parsed progress blocks to `on_progress`.
    ///
    /// The child is killed if this future is dropped.
    pub async fn run<F>(&self, cmd: &EncodeCommand, on_progress: F) -> WorkerResult<()>
    where
        F: Fn(EncodeProgress) + Send + 'static,
    {
        let args = cmd.build_args();
        debug!("Running encoder: {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => WorkerError::EncoderNotFound(self.program.clone()),
                _ => WorkerError::Io(e),
            })?;

        let progress_handle = child.stderr.take().map(|stderr| {
            let mut reader = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                let mut current = EncodeProgress::default();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Some(progress) = parse_progress_line(&line, &mut current) {
                        on_progress(progress);
                    }
                }
            })
        });

        let status = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("Encoder timed out after {:?}, killing process", timeout);
                    let _ = child.kill().await;
                    return Err(WorkerError::Timeout(timeout.as_secs()));
                }
            },
            None => child.wait().await?,
        };

        if let Some(handle) = progress_handle {
            let _ = handle.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(WorkerError::encode_failed(format!(
                "{} exited with status {:?}",
                self.program,
                status.code()
            )))
        }
    }
}

/// Parse one line of `-progress` output. Returns a snapshot at the end of
/// each block.
fn parse_progress_line(line: &str, current: &mut EncodeProgress) -> Option<EncodeProgress> {
    let (key, value) = line.trim().split_once('=')?;

    match key {
        "out_time_us" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            current.is_complete = value == "end";
            return Some(current.clone());
        }
        _ => {}
    }

    None
}

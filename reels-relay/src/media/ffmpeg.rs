//! ffmpeg/ffprobe backed transcoder.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use super::progress::ProgressReporter;
use super::{EncodeSpec, MediaInfo, TranscodeError, Transcoder};

/// Number of trailing stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 8;

/// Transcoder that shells out to ffmpeg and ffprobe.
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[instrument(skip(self, spec, progress), fields(input = %input.display()))]
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        spec: &EncodeSpec,
        progress: &ProgressReporter,
    ) -> Result<(), TranscodeError> {
        // Without a known duration progress cannot be expressed as a percentage.
        let total_secs = match self.probe(input).await {
            Ok(info) => info.duration_secs.map(|d| spec.capped_duration(d)),
            Err(e) => {
                debug!(error = %e, "Probe before transcode failed; progress disabled");
                None
            }
        };

        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostats".to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
        ];
        args.extend(spec.to_args(input, output));

        info!(command = %format!("{} {}", self.ffmpeg_path.display(), args.join(" ")), "ffmpeg started");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_percent = -1i32;
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(out_secs) = parse_out_time(&line) else {
                    continue;
                };
                if let Some(total) = total_secs.filter(|t| *t > 0.0) {
                    let percent = ((out_secs / total) * 100.0).clamp(0.0, 100.0);
                    if percent as i32 != last_percent {
                        last_percent = percent as i32;
                        progress.report(percent as f32);
                    }
                }
            }
        }

        let status = child.wait().await.map_err(TranscodeError::Spawn)?;
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            error!(code = ?status.code(), "ffmpeg failed: {}", stderr_tail);
            return Err(TranscodeError::Failed {
                code: status.code(),
                stderr: stderr_tail,
            });
        }

        progress.report(100.0);
        info!(output = %output.display(), "ffmpeg finished");
        Ok(())
    }

    #[instrument(skip(self), fields(input = %input.display()))]
    async fn probe(&self, input: &Path) -> Result<MediaInfo, TranscodeError> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(TranscodeError::Spawn)?;

        if !output.status.success() {
            return Err(TranscodeError::Probe(format!(
                "ffprobe exited with code {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        parse_probe_output(&output.stdout)
    }
}

/// Parse an `out_time_us=`/`out_time_ms=` progress line into seconds.
///
/// ffmpeg reports both keys in microseconds.
fn parse_out_time(line: &str) -> Option<f64> {
    let value = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    value.trim().parse::<u64>().ok().map(|us| us as f64 / 1_000_000.0)
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

fn parse_probe_output(stdout: &[u8]) -> Result<MediaInfo, TranscodeError> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| TranscodeError::Probe(format!("invalid ffprobe output: {e}")))?;
    let format = probe
        .format
        .ok_or_else(|| TranscodeError::Probe("ffprobe reported no format".to_string()))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    Ok(MediaInfo {
        duration_secs: format.duration.as_deref().and_then(|d| d.parse().ok()),
        size_bytes: format
            .size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        format_name: format.format_name.unwrap_or_default(),
        has_video: video.is_some(),
        has_audio: probe
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio")),
        width: video.and_then(|v| v.width),
        height: video.and_then(|v| v.height),
        video_codec: video.and_then(|v| v.codec_name.clone()),
    })
}

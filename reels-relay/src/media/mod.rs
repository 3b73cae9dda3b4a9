//! Video transcoding: Reels conversion, upload compression and validation.
//!
//! The external transcoding tool sits behind the [`Transcoder`] trait; the
//! production implementation shells out to ffmpeg and ffprobe.

mod ffmpeg;
pub mod progress;
mod transform;

pub use ffmpeg::FfmpegTranscoder;
pub use progress::{ProgressReporter, TranscodeProgress};
pub use transform::{MediaConfig, MediaTransform, PreparedVideo, VideoValidation};

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the transcoding tool.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to run transcoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Transcoder exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upload compression failed; callers fall back to the original file.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Cannot read input file: {0}")]
    Metadata(#[source] std::io::Error),

    #[error("Compression failed: {0}")]
    Transcode(#[from] TranscodeError),
}

/// Probed container and stream information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    /// Comma-separated container names, as reported by ffprobe.
    pub format_name: String,
    pub has_video: bool,
    pub has_audio: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
}

/// Target encoding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeSpec {
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: Option<String>,
    pub audio_bitrate: Option<String>,
    pub audio_sample_rate: Option<u32>,
    /// Output frame size, e.g. `1280x720`.
    pub size: Option<String>,
    pub fps: Option<u32>,
    pub video_filters: Vec<String>,
    pub max_duration_secs: Option<f64>,
    pub extra_args: Vec<String>,
}

impl EncodeSpec {
    /// Balanced 720p re-encode applied to oversized uploads.
    pub fn upload_compression() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: Some("2000k".to_string()),
            audio_bitrate: Some("128k".to_string()),
            audio_sample_rate: None,
            size: Some("1280x720".to_string()),
            fps: Some(30),
            video_filters: Vec::new(),
            max_duration_secs: None,
            extra_args: ["-preset", "medium", "-crf", "21", "-movflags", "+faststart"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Vertical 1080x1920 H.264/AAC letterboxed to 9:16.
    pub fn reels(max_duration_secs: f64) -> Self {
        Self {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: None,
            audio_bitrate: Some("128k".to_string()),
            audio_sample_rate: Some(44_100),
            size: None,
            fps: None,
            video_filters: vec![
                "scale=1080:1920:force_original_aspect_ratio=decrease".to_string(),
                "pad=1080:1920:(ow-iw)/2:(oh-ih)/2:black".to_string(),
            ],
            max_duration_secs: Some(max_duration_secs),
            extra_args: [
                "-profile:v",
                "high",
                "-level",
                "4.1",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }

    /// Output duration for an input of `input_secs`.
    pub fn capped_duration(&self, input_secs: f64) -> f64 {
        match self.max_duration_secs {
            Some(max) => input_secs.min(max),
            None => input_secs,
        }
    }

    /// ffmpeg arguments from `-i` through the output path.
    pub fn to_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec!["-i".to_string(), input.display().to_string()];

        if !self.video_filters.is_empty() {
            args.push("-vf".to_string());
            args.push(self.video_filters.join(","));
        }
        args.push("-c:v".to_string());
        args.push(self.video_codec.clone());
        if let Some(bitrate) = &self.video_bitrate {
            args.push("-b:v".to_string());
            args.push(bitrate.clone());
        }
        if let Some(size) = &self.size {
            args.push("-s".to_string());
            args.push(size.clone());
        }
        if let Some(fps) = self.fps {
            args.push("-r".to_string());
            args.push(fps.to_string());
        }
        args.push("-c:a".to_string());
        args.push(self.audio_codec.clone());
        if let Some(bitrate) = &self.audio_bitrate {
            args.push("-b:a".to_string());
            args.push(bitrate.clone());
        }
        if let Some(rate) = self.audio_sample_rate {
            args.push("-ar".to_string());
            args.push(rate.to_string());
        }
        if let Some(max) = self.max_duration_secs {
            args.push("-t".to_string());
            args.push(max.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(output.display().to_string());
        args
    }
}

/// External transcoding tool.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encode `input` into `output` according to `spec`, reporting percent progress.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        spec: &EncodeSpec,
        progress: &ProgressReporter,
    ) -> Result<(), TranscodeError>;

    /// Read container and stream metadata.
    async fn probe(&self, input: &Path) -> Result<MediaInfo, TranscodeError>;
}

//! Media transform: upload compression, Reels conversion and validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::progress::ProgressReporter;
use super::{CompressionError, EncodeSpec, MediaInfo, TranscodeError, Transcoder};
use crate::transfer::MIB;

/// Configuration for media handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Path to the ffmpeg binary.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Path to the ffprobe binary.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Files larger than this are re-encoded before upload.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: u64,
    /// Reels duration cap in seconds.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: f64,
    /// Largest file accepted by validation.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Container names accepted by validation.
    #[serde(default = "default_allowed_formats")]
    pub allowed_formats: Vec<String>,
    /// When set, validation rejects files outside this directory.
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_compression_threshold() -> u64 {
    50 * MIB
}

fn default_max_duration() -> f64 {
    90.0
}

fn default_max_file_size() -> u64 {
    100 * MIB
}

fn default_allowed_formats() -> Vec<String> {
    vec!["mp4".to_string(), "mov".to_string(), "avi".to_string()]
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            compression_threshold_bytes: default_compression_threshold(),
            max_duration_secs: default_max_duration(),
            max_file_size_bytes: default_max_file_size(),
            allowed_formats: default_allowed_formats(),
            upload_dir: None,
        }
    }
}

/// File handed to the upload phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedVideo {
    pub path: PathBuf,
    /// True when `path` is a temporary compressed copy owned by the uploader.
    pub compressed: bool,
}

impl PreparedVideo {
    pub fn original(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compressed: false,
        }
    }

    /// Remove the temporary copy, leaving originals untouched.
    pub async fn cleanup(&self) {
        if !self.compressed {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => info!(path = %self.path.display(), "Compressed video file cleaned up"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to clean up compressed video"),
        }
    }
}

/// Outcome of checking a video against Reels constraints.
#[derive(Debug, Clone, Serialize)]
pub struct VideoValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub info: Option<MediaInfo>,
}

impl VideoValidation {
    fn evaluate(info: MediaInfo, path_allowed: bool, config: &MediaConfig) -> Self {
        let mut errors = Vec::new();

        if !path_allowed {
            errors.push("File path not allowed".to_string());
        }
        if !info.has_video {
            errors.push("No video stream found".to_string());
        }
        match info.duration_secs {
            Some(d) if d <= config.max_duration_secs => {}
            Some(d) => errors.push(format!(
                "Duration {:.1}s exceeds {:.0}s limit",
                d, config.max_duration_secs
            )),
            None => errors.push("Unknown duration".to_string()),
        }
        if info.size_bytes > config.max_file_size_bytes {
            errors.push(format!(
                "File size {} MB exceeds {} MB limit",
                info.size_bytes / MIB,
                config.max_file_size_bytes / MIB
            ));
        }
        let format_ok = config
            .allowed_formats
            .iter()
            .any(|f| info.format_name.contains(f.as_str()));
        if !format_ok {
            errors.push(format!("Unsupported container format: {}", info.format_name));
        }

        Self {
            is_valid: errors.is_empty(),
            errors,
            info: Some(info),
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
            info: None,
        }
    }
}

/// `bytes` in MiB, rounded half up.
fn rounded_mib(bytes: u64) -> u64 {
    bytes.saturating_add(MIB / 2) / MIB
}

/// `<stem>_compressed.<ext>` next to the input.
pub fn compressed_output_path(input: &Path) -> PathBuf {
    suffixed_path(input, "_compressed", input.extension().and_then(|e| e.to_str()))
}

/// `<stem>_reels.mp4` inside `output_dir`.
pub fn reels_output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    output_dir.join(format!("{stem}_reels.mp4"))
}

fn suffixed_path(input: &Path, suffix: &str, ext: Option<&str>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let name = match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    input.with_file_name(name)
}

/// Converts and compresses videos through a [`Transcoder`].
pub struct MediaTransform {
    config: MediaConfig,
    transcoder: Arc<dyn Transcoder>,
}

impl MediaTransform {
    pub fn new(config: MediaConfig, transcoder: Arc<dyn Transcoder>) -> Self {
        Self { config, transcoder }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Whether a file of `size_bytes` is re-encoded before upload.
    ///
    /// The size is rounded to the nearest whole MiB first, so a file a few
    /// KiB over the threshold still goes out untouched.
    pub fn needs_compression(&self, size_bytes: u64) -> bool {
        rounded_mib(size_bytes) * MIB > self.config.compression_threshold_bytes
    }

    /// Re-encode oversized inputs to a temporary `_compressed` copy.
    ///
    /// Inputs at or under the threshold are returned unchanged.
    pub async fn compress_for_upload(&self, input: &Path) -> Result<PreparedVideo, CompressionError> {
        let size = tokio::fs::metadata(input)
            .await
            .map_err(CompressionError::Metadata)?
            .len();

        if !self.needs_compression(size) {
            info!(
                size_mb = rounded_mib(size),
                "Video file is acceptable size, skipping compression"
            );
            return Ok(PreparedVideo::original(input));
        }

        let output = compressed_output_path(input);
        info!(size_mb = size / MIB, output = %output.display(), "Compressing video file");

        let progress = ProgressReporter::noop("compression");
        if let Err(e) = self
            .transcoder
            .transcode(input, &output, &EncodeSpec::upload_compression(), &progress)
            .await
        {
            // Partial output is useless.
            let _ = tokio::fs::remove_file(&output).await;
            return Err(e.into());
        }

        if let Ok(meta) = tokio::fs::metadata(&output).await {
            let reduction = if size > 0 {
                100 - (meta.len().saturating_mul(100) / size).min(100)
            } else {
                0
            };
            info!(
                original_mb = size / MIB,
                compressed_mb = meta.len() / MIB,
                reduction_percent = reduction,
                "Video compression completed"
            );
        }

        Ok(PreparedVideo {
            path: output,
            compressed: true,
        })
    }

    /// Convert to a vertical Reels-compliant MP4 in `output_dir`.
    pub async fn convert_to_reels(
        &self,
        input: &Path,
        output_dir: &Path,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, TranscodeError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let output = reels_output_path(input, output_dir);

        info!(input = %input.display(), output = %output.display(), "Starting Reels conversion");
        self.transcoder
            .transcode(
                input,
                &output,
                &EncodeSpec::reels(self.config.max_duration_secs),
                progress,
            )
            .await?;

        Ok(output)
    }

    /// Check a file against Reels constraints. Never errors; problems are reported.
    pub async fn validate_video(&self, path: &Path) -> VideoValidation {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return VideoValidation::rejected("File does not exist");
        }

        let path_allowed = match &self.config.upload_dir {
            Some(dir) => match (
                tokio::fs::canonicalize(path).await,
                tokio::fs::canonicalize(dir).await,
            ) {
                (Ok(file), Ok(dir)) => file.starts_with(dir),
                _ => false,
            },
            None => true,
        };

        let validation = match self.transcoder.probe(path).await {
            Ok(info) => VideoValidation::evaluate(info, path_allowed, &self.config),
            Err(e) => VideoValidation::rejected(e.to_string()),
        };

        info!(
            path = %path.display(),
            is_valid = validation.is_valid,
            errors = ?validation.errors,
            "Video validation result"
        );
        validation
    }
}

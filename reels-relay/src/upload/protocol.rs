//! Per-destination upload: compression, resumable transfer and fallback.
//!
//! The resumable protocol runs in three phases (start, transfer, finish). Any
//! failure in those phases is absorbed by the single-request fallback; only
//! when both paths fail does the caller see an [`UploadError`].

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};

use super::error::{TransferError, TransferPhase, UploadError};
use super::platform::{PlatformError, PublishingPlatform};
use crate::domain::Destination;
use crate::media::{MediaTransform, PreparedVideo};
use crate::transfer::{MIB, TransferSettings, TransferTracker, TransferTuner, UploadSample};

/// Caption used when a job carries no description.
pub const DEFAULT_CAPTION: &str = "New video posted automatically by the bot";

const PHASE_COMPRESSION: &str = "compression";
const PHASE_UPLOAD: &str = "upload";

/// Which path published the video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPath {
    Resumable,
    Fallback,
}

/// A successful post.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub post_id: String,
    pub path: UploadPath,
    /// Size of the file actually sent.
    pub bytes: u64,
    pub compressed: bool,
    pub duration: Duration,
}

/// Drives one video to one destination.
pub struct UploadProtocol {
    platform: Arc<dyn PublishingPlatform>,
    transform: Arc<MediaTransform>,
    tuner: Arc<TransferTuner>,
    tracker: Arc<TransferTracker>,
}

impl UploadProtocol {
    pub fn new(
        platform: Arc<dyn PublishingPlatform>,
        transform: Arc<MediaTransform>,
        tuner: Arc<TransferTuner>,
        tracker: Arc<TransferTracker>,
    ) -> Self {
        Self {
            platform,
            transform,
            tuner,
            tracker,
        }
    }

    pub fn tuner(&self) -> &Arc<TransferTuner> {
        &self.tuner
    }

    pub fn tracker(&self) -> &Arc<TransferTracker> {
        &self.tracker
    }

    /// Post `video_path` to `destination`.
    ///
    /// The original file is never deleted; a compressed copy, if made, always is.
    #[instrument(skip(self, destination, description), fields(destination = %destination.name, remote_id = %destination.remote_id))]
    pub async fn post_to_one(
        &self,
        job_id: &str,
        video_path: &Path,
        destination: &Destination,
        description: &str,
    ) -> Result<UploadOutcome, UploadError> {
        let key = destination.remote_id.as_str();
        let original_size = tokio::fs::metadata(video_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        self.tracker.begin(job_id, key, original_size);

        self.tracker.phase(job_id, key, PHASE_COMPRESSION);
        let prepared = match self.transform.compress_for_upload(video_path).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(error = %e, "Compression failed, uploading original file");
                PreparedVideo::original(video_path)
            }
        };
        self.tracker.end_phase(job_id, key, PHASE_COMPRESSION);

        let caption = if description.trim().is_empty() {
            DEFAULT_CAPTION
        } else {
            description
        };

        self.tracker.phase(job_id, key, PHASE_UPLOAD);
        let started = Instant::now();
        let result = self.upload(&prepared.path, destination, caption).await;
        self.tracker.end_phase(job_id, key, PHASE_UPLOAD);
        prepared.cleanup().await;

        match result {
            Ok((post_id, path, bytes)) => {
                let sample = match self.tracker.end(job_id, key, true) {
                    Some(summary) => UploadSample::success(
                        summary.speed_mbps,
                        summary.total_duration.as_secs_f64(),
                        summary.size_mb,
                    ),
                    None => UploadSample::success(0.0, 0.0, bytes as f64 / MIB as f64),
                };
                self.tuner.record(sample);

                info!(post_id = %post_id, ?path, "Posted to destination");
                Ok(UploadOutcome {
                    post_id,
                    path,
                    bytes,
                    compressed: prepared.compressed,
                    duration: started.elapsed(),
                })
            }
            Err(e) => {
                self.tracker.end(job_id, key, false);
                self.tuner.record(UploadSample::failure());
                warn!(error = %e, cause = %e.cause, "Upload to destination failed");
                Err(e)
            }
        }
    }

    async fn upload(
        &self,
        path: &Path,
        destination: &Destination,
        caption: &str,
    ) -> Result<(String, UploadPath, u64), UploadError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| UploadError::new(PlatformError::from(e), None))?
            .len();

        match self.try_resumable(path, size, destination, caption).await {
            Ok(post_id) => Ok((post_id, UploadPath::Resumable, size)),
            Err(transfer) => {
                warn!(
                    phase = %transfer.phase,
                    error = %transfer.source,
                    "Resumable upload failed, falling back to direct upload"
                );
                match self.try_fallback(path, destination, caption).await {
                    Ok(post_id) => Ok((post_id, UploadPath::Fallback, size)),
                    Err(cause) => Err(UploadError::new(cause, Some(transfer))),
                }
            }
        }
    }

    /// Start, stream chunks, finish.
    async fn try_resumable(
        &self,
        path: &Path,
        size: u64,
        destination: &Destination,
        caption: &str,
    ) -> Result<String, TransferError> {
        let settings = self.tuner.settings();
        info!(
            size_mb = size / MIB,
            chunk_mb = settings.chunk_size / MIB,
            quality = %self.tuner.quality(),
            "Starting resumable upload"
        );

        let session_id = self
            .platform
            .start_session(destination, size)
            .await
            .map_err(|e| TransferError::new(TransferPhase::Start, e))?;

        self.transfer_chunks(path, size, destination, &session_id, &settings)
            .await
            .map_err(|e| TransferError::new(TransferPhase::Transfer, e))?;

        self.platform
            .finish_session(destination, &session_id, caption)
            .await
            .map_err(|e| TransferError::new(TransferPhase::Finish, e))
    }

    async fn transfer_chunks(
        &self,
        path: &Path,
        size: u64,
        destination: &Destination,
        session_id: &str,
        settings: &TransferSettings,
    ) -> Result<(), PlatformError> {
        let mut file = tokio::fs::File::open(path).await?;
        let ranges = chunk_ranges(size, settings.chunk_size);
        let count = ranges.len();

        for (i, (offset, len)) in ranges.into_iter().enumerate() {
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf).await?;

            info!(
                offset,
                end = offset + len,
                total = size,
                "Uploading chunk {}/{}",
                i + 1,
                count
            );
            self.platform
                .transfer_chunk(
                    destination,
                    session_id,
                    offset,
                    Bytes::from(buf),
                    settings.chunk_timeout,
                )
                .await?;

            if i + 1 < count && !settings.chunk_delay.is_zero() {
                tokio::time::sleep(settings.chunk_delay).await;
            }
        }
        Ok(())
    }

    /// Whole-file upload followed by a feed post.
    async fn try_fallback(
        &self,
        path: &Path,
        destination: &Destination,
        caption: &str,
    ) -> Result<String, PlatformError> {
        let video_id = self.platform.direct_upload(destination, path).await?;
        info!(video_id = %video_id, "Video uploaded via fallback");
        self.platform
            .create_feed_post(destination, &video_id, caption)
            .await
    }
}

/// Split `size` bytes into `(offset, len)` ranges of at most `chunk_size`.
fn chunk_ranges(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = chunk_size.min(size - offset);
        ranges.push((offset, len));
        offset += len;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{
        EncodeSpec, MediaConfig, MediaInfo, ProgressReporter, TranscodeError, Transcoder,
    };
    use crate::transfer::TunerConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockPlatform {
        fail_start: bool,
        fail_chunk: bool,
        direct_status: Option<u16>,
        calls: Mutex<Vec<String>>,
        uploaded_paths: Mutex<Vec<PathBuf>>,
        chunk_bytes: Mutex<u64>,
        captions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PublishingPlatform for MockPlatform {
        async fn start_session(
            &self,
            _destination: &Destination,
            file_size: u64,
        ) -> Result<String, PlatformError> {
            self.calls.lock().push(format!("start:{file_size}"));
            if self.fail_start {
                return Err(PlatformError::from_body(
                    400,
                    r#"{"error":{"message":"Reels not supported"}}"#,
                ));
            }
            Ok("session-1".to_string())
        }

        async fn transfer_chunk(
            &self,
            _destination: &Destination,
            session_id: &str,
            start_offset: u64,
            chunk: Bytes,
            _timeout: Duration,
        ) -> Result<(), PlatformError> {
            self.calls
                .lock()
                .push(format!("chunk:{session_id}:{start_offset}"));
            if self.fail_chunk {
                return Err(PlatformError::ConnectionReset);
            }
            *self.chunk_bytes.lock() += chunk.len() as u64;
            Ok(())
        }

        async fn finish_session(
            &self,
            _destination: &Destination,
            session_id: &str,
            description: &str,
        ) -> Result<String, PlatformError> {
            self.calls.lock().push(format!("finish:{session_id}"));
            self.captions.lock().push(description.to_string());
            Ok("reel-1".to_string())
        }

        async fn direct_upload(
            &self,
            _destination: &Destination,
            path: &Path,
        ) -> Result<String, PlatformError> {
            self.calls.lock().push("direct".to_string());
            self.uploaded_paths.lock().push(path.to_path_buf());
            match self.direct_status {
                Some(status) => Err(PlatformError::from_body(status, "{}")),
                None => Ok("video-1".to_string()),
            }
        }

        async fn create_feed_post(
            &self,
            _destination: &Destination,
            video_id: &str,
            message: &str,
        ) -> Result<String, PlatformError> {
            self.calls.lock().push(format!("feed:{video_id}"));
            self.captions.lock().push(message.to_string());
            Ok("post-1".to_string())
        }
    }

    /// Writes a short output file, or fails when `fail` is set.
    struct MockTranscoder {
        fail: bool,
    }

    #[async_trait]
    impl Transcoder for MockTranscoder {
        async fn transcode(
            &self,
            _input: &Path,
            output: &Path,
            _spec: &EncodeSpec,
            _progress: &ProgressReporter,
        ) -> Result<(), TranscodeError> {
            if self.fail {
                return Err(TranscodeError::Failed {
                    code: Some(1),
                    stderr: "encoder error".to_string(),
                });
            }
            tokio::fs::write(output, vec![1u8; 300]).await?;
            Ok(())
        }

        async fn probe(&self, _input: &Path) -> Result<MediaInfo, TranscodeError> {
            Ok(MediaInfo::default())
        }
    }

    struct Fixture {
        _dir: TempDir,
        video: PathBuf,
        platform: Arc<MockPlatform>,
        protocol: UploadProtocol,
    }

    async fn fixture(platform: MockPlatform, threshold: u64, transcoder_fails: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let video = dir.path().join("clip.mp4");
        tokio::fs::write(&video, vec![0u8; 1200]).await.unwrap();

        let platform = Arc::new(platform);
        let transform = MediaTransform::new(
            MediaConfig {
                compression_threshold_bytes: threshold,
                ..Default::default()
            },
            Arc::new(MockTranscoder {
                fail: transcoder_fails,
            }),
        );
        let protocol = UploadProtocol::new(
            platform.clone(),
            Arc::new(transform),
            Arc::new(TransferTuner::new(TunerConfig::default())),
            Arc::new(TransferTracker::new()),
        );

        Fixture {
            _dir: dir,
            video,
            platform,
            protocol,
        }
    }

    fn destination() -> Destination {
        Destination::new(1, "page-1", "token-1", "app1", "Page One")
    }

    #[test]
    fn test_chunk_ranges() {
        assert_eq!(chunk_ranges(10, 4), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(chunk_ranges(8, 4), vec![(0, 4), (4, 4)]);
        assert_eq!(chunk_ranges(3, 8 * MIB), vec![(0, 3)]);
        assert!(chunk_ranges(0, 4).is_empty());
    }

    #[tokio::test]
    async fn test_resumable_upload() {
        let f = fixture(MockPlatform::default(), 50 * MIB, false).await;

        let outcome = f
            .protocol
            .post_to_one("job-1", &f.video, &destination(), "Hello")
            .await
            .unwrap();

        assert_eq!(outcome.post_id, "reel-1");
        assert_eq!(outcome.path, UploadPath::Resumable);
        assert_eq!(outcome.bytes, 1200);
        assert!(!outcome.compressed);
        assert_eq!(
            *f.platform.calls.lock(),
            vec!["start:1200", "chunk:session-1:0", "finish:session-1"]
        );
        assert_eq!(*f.platform.chunk_bytes.lock(), 1200);
        assert_eq!(*f.platform.captions.lock(), vec!["Hello"]);

        assert_eq!(f.protocol.tuner().profile().samples.len(), 1);
        let report = f.protocol.tracker().destination_report("page-1").unwrap();
        assert_eq!(report.stats.total_uploads, 1);
        assert_eq!(report.stats.successful_uploads, 1);
        assert_eq!(f.protocol.tracker().active_count(), 0);
        assert!(f.video.exists());
    }

    #[tokio::test]
    async fn test_start_failure_falls_back_with_default_caption() {
        let platform = MockPlatform {
            fail_start: true,
            ..Default::default()
        };
        let f = fixture(platform, 50 * MIB, false).await;

        let outcome = f
            .protocol
            .post_to_one("job-1", &f.video, &destination(), "  ")
            .await
            .unwrap();

        assert_eq!(outcome.post_id, "post-1");
        assert_eq!(outcome.path, UploadPath::Fallback);
        assert_eq!(
            *f.platform.calls.lock(),
            vec!["start:1200", "direct", "feed:video-1"]
        );
        assert_eq!(*f.platform.captions.lock(), vec![DEFAULT_CAPTION]);
    }

    #[tokio::test]
    async fn test_chunk_failure_falls_back() {
        let platform = MockPlatform {
            fail_chunk: true,
            ..Default::default()
        };
        let f = fixture(platform, 50 * MIB, false).await;

        let outcome = f
            .protocol
            .post_to_one("job-1", &f.video, &destination(), "Hi")
            .await
            .unwrap();

        assert_eq!(outcome.path, UploadPath::Fallback);
        let calls = f.platform.calls.lock().clone();
        assert!(!calls.iter().any(|c| c.starts_with("finish")));
        assert_eq!(calls.last().map(String::as_str), Some("feed:video-1"));
    }

    #[tokio::test]
    async fn test_both_paths_fail() {
        let platform = MockPlatform {
            fail_start: true,
            direct_status: Some(401),
            ..Default::default()
        };
        let f = fixture(platform, 50 * MIB, false).await;

        let err = f
            .protocol
            .post_to_one("job-1", &f.video, &destination(), "Hi")
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Facebook authentication failed. Please check access token."
        );
        assert_eq!(
            err.resumable.as_ref().map(|t| t.phase),
            Some(TransferPhase::Start)
        );
        assert!(!err.to_string().contains("token-1"));

        let profile = f.protocol.tuner().profile();
        assert_eq!(profile.samples.len(), 1);
        assert!(!profile.samples[0].success);
        let report = f.protocol.tracker().destination_report("page-1").unwrap();
        assert_eq!(report.stats.successful_uploads, 0);
    }

    #[tokio::test]
    async fn test_oversized_file_is_compressed_and_cleaned_up() {
        let platform = MockPlatform {
            fail_start: true,
            ..Default::default()
        };
        let f = fixture(platform, 1000, false).await;

        let outcome = f
            .protocol
            .post_to_one("job-1", &f.video, &destination(), "Hi")
            .await
            .unwrap();

        assert!(outcome.compressed);
        assert_eq!(outcome.bytes, 300);
        let uploaded = f.platform.uploaded_paths.lock()[0].clone();
        assert!(uploaded.ends_with("clip_compressed.mp4"));
        assert!(!uploaded.exists());
        assert!(f.video.exists());
    }

    #[tokio::test]
    async fn test_compression_failure_uses_original() {
        let platform = MockPlatform {
            fail_start: true,
            ..Default::default()
        };
        let f = fixture(platform, 1000, true).await;

        let outcome = f
            .protocol
            .post_to_one("job-1", &f.video, &destination(), "Hi")
            .await
            .unwrap();

        assert!(!outcome.compressed);
        assert_eq!(outcome.bytes, 1200);
        assert_eq!(f.platform.uploaded_paths.lock()[0], f.video);
    }
}

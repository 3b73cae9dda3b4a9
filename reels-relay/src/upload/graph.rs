//! Graph API publisher.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

use super::platform::{PlatformError, PublishingPlatform};
use crate::domain::Destination;
use crate::utils::graph::{GraphConfig, IdResponse, decode_json};

const REELS_PATH: &str = "me/video_reels";
const VIDEOS_PATH: &str = "me/videos";

const START_TIMEOUT: Duration = Duration::from_secs(30);
const FINISH_TIMEOUT: Duration = Duration::from_secs(120);
const DIRECT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(180);
const FEED_POST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    upload_session_id: String,
}

/// Publishes through the Facebook Graph API Reels endpoints.
pub struct GraphPublisher {
    client: Client,
    config: GraphConfig,
}

impl GraphPublisher {
    pub fn new(client: Client, config: GraphConfig) -> Self {
        Self { client, config }
    }

    /// Watch link used by feed posts.
    pub fn watch_link(video_id: &str) -> String {
        format!("https://www.facebook.com/watch/?v={video_id}")
    }
}

#[async_trait]
impl PublishingPlatform for GraphPublisher {
    #[instrument(skip(self, destination), fields(destination = %destination.remote_id))]
    async fn start_session(
        &self,
        destination: &Destination,
        file_size: u64,
    ) -> Result<String, PlatformError> {
        let file_size = file_size.to_string();
        let response = self
            .client
            .post(self.config.endpoint(REELS_PATH))
            .form(&[
                ("upload_phase", "start"),
                ("file_size", file_size.as_str()),
                ("access_token", destination.access_token.as_str()),
            ])
            .timeout(START_TIMEOUT)
            .send()
            .await?;

        let session: StartSessionResponse = decode_json(response).await?;
        info!(session_id = %session.upload_session_id, "Reels upload session started");
        Ok(session.upload_session_id)
    }

    #[instrument(skip(self, destination, chunk), fields(destination = %destination.remote_id, bytes = chunk.len()))]
    async fn transfer_chunk(
        &self,
        destination: &Destination,
        session_id: &str,
        start_offset: u64,
        chunk: Bytes,
        timeout: Duration,
    ) -> Result<(), PlatformError> {
        let part = Part::stream(chunk)
            .file_name(format!("chunk_{start_offset}.mp4"))
            .mime_str("video/mp4")?;
        let form = Form::new()
            .text("upload_phase", "transfer")
            .text("start_offset", start_offset.to_string())
            .text("upload_session_id", session_id.to_string())
            .text("access_token", destination.access_token.clone())
            .part("video_file_chunk", part);

        let response = self
            .client
            .post(self.config.endpoint(REELS_PATH))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await?;

        // The acknowledgement body carries nothing we use.
        let _: serde_json::Value = decode_json(response).await?;
        debug!("Chunk accepted");
        Ok(())
    }

    #[instrument(skip(self, destination, description), fields(destination = %destination.remote_id))]
    async fn finish_session(
        &self,
        destination: &Destination,
        session_id: &str,
        description: &str,
    ) -> Result<String, PlatformError> {
        let mut params = vec![
            ("upload_phase", "finish"),
            ("upload_session_id", session_id),
            ("access_token", destination.access_token.as_str()),
        ];
        let description = description.trim();
        if !description.is_empty() {
            params.push(("description", description));
        }

        let response = self
            .client
            .post(self.config.endpoint(REELS_PATH))
            .form(&params)
            .timeout(FINISH_TIMEOUT)
            .send()
            .await?;

        let post: IdResponse = decode_json(response).await?;
        info!(post_id = %post.id, "Reels upload finished");
        Ok(post.id)
    }

    #[instrument(skip(self, destination), fields(destination = %destination.remote_id, path = %path.display()))]
    async fn direct_upload(
        &self,
        destination: &Destination,
        path: &Path,
    ) -> Result<String, PlatformError> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, length)
            .file_name(file_name)
            .mime_str("video/mp4")?;
        let form = Form::new()
            .part("source", part)
            .text("access_token", destination.access_token.clone())
            .text("published", "true");

        let response = self
            .client
            .post(self.config.endpoint(VIDEOS_PATH))
            .multipart(form)
            .timeout(DIRECT_UPLOAD_TIMEOUT)
            .send()
            .await?;

        let video: IdResponse = decode_json(response).await?;
        info!(video_id = %video.id, "Video uploaded via direct upload");
        Ok(video.id)
    }

    #[instrument(skip(self, destination, message), fields(destination = %destination.remote_id))]
    async fn create_feed_post(
        &self,
        destination: &Destination,
        video_id: &str,
        message: &str,
    ) -> Result<String, PlatformError> {
        let link = Self::watch_link(video_id);
        let response = self
            .client
            .post(self.config.endpoint(&format!("{}/feed", destination.remote_id)))
            .form(&[
                ("message", message),
                ("link", link.as_str()),
                ("access_token", destination.access_token.as_str()),
            ])
            .timeout(FEED_POST_TIMEOUT)
            .send()
            .await?;

        let post: IdResponse = decode_json(response).await?;
        info!(post_id = %post.id, "Feed post created");
        Ok(post.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_link() {
        assert_eq!(
            GraphPublisher::watch_link("123"),
            "https://www.facebook.com/watch/?v=123"
        );
    }

    #[test]
    fn test_start_session_response() {
        let parsed: StartSessionResponse =
            serde_json::from_str(r#"{"upload_session_id":"sess-1","video_id":"v1"}"#).unwrap();
        assert_eq!(parsed.upload_session_id, "sess-1");
    }
}

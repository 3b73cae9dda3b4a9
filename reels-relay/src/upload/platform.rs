//! Remote publishing platform seam.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::Destination;

/// A single failed platform request.
pub type PlatformError = crate::utils::graph::GraphError;

/// Publishing endpoints used by the upload protocol.
///
/// Every call authenticates with the destination's own credential.
#[async_trait]
pub trait PublishingPlatform: Send + Sync {
    /// Open a resumable upload session; returns the session id.
    async fn start_session(
        &self,
        destination: &Destination,
        file_size: u64,
    ) -> Result<String, PlatformError>;

    /// Send one byte range of the file.
    async fn transfer_chunk(
        &self,
        destination: &Destination,
        session_id: &str,
        start_offset: u64,
        chunk: Bytes,
        timeout: Duration,
    ) -> Result<(), PlatformError>;

    /// Close the session and publish; returns the post id.
    async fn finish_session(
        &self,
        destination: &Destination,
        session_id: &str,
        description: &str,
    ) -> Result<String, PlatformError>;

    /// Upload the whole file in one request and publish it; returns the video id.
    async fn direct_upload(
        &self,
        destination: &Destination,
        path: &Path,
    ) -> Result<String, PlatformError>;

    /// Create a feed post linking to an uploaded video; returns the post id.
    async fn create_feed_post(
        &self,
        destination: &Destination,
        video_id: &str,
        message: &str,
    ) -> Result<String, PlatformError>;
}

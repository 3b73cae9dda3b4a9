//! Upload failure taxonomy.

use serde::Serialize;
use thiserror::Error;

use super::platform::PlatformError;
use crate::utils::graph::UNKNOWN_API_ERROR;

/// Step of the resumable protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    Start,
    Transfer,
    Finish,
}

impl TransferPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Transfer => "transfer",
            Self::Finish => "finish",
        }
    }
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resumable protocol failed in one of its phases.
#[derive(Debug, Error)]
#[error("Resumable upload failed in {phase} phase: {source}")]
pub struct TransferError {
    pub phase: TransferPhase,
    pub source: PlatformError,
}

impl TransferError {
    pub fn new(phase: TransferPhase, source: impl Into<PlatformError>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }
}

/// Both upload paths failed.
///
/// Display shows only the human-safe message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UploadError {
    message: String,
    /// Why the resumable path was abandoned, if it was attempted.
    pub resumable: Option<TransferError>,
    #[source]
    pub cause: PlatformError,
}

impl UploadError {
    pub fn new(cause: PlatformError, resumable: Option<TransferError>) -> Self {
        Self {
            message: safe_message(&cause),
            resumable,
            cause,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Map a platform failure to a message that is safe to show to users.
pub fn safe_message(error: &PlatformError) -> String {
    match error {
        PlatformError::Api { status: 401, .. } => {
            "Facebook authentication failed. Please check access token.".to_string()
        }
        PlatformError::Api { status: 413, .. } => {
            "Video file too large for Facebook upload.".to_string()
        }
        PlatformError::Timeout | PlatformError::ConnectionReset => {
            "Connection timeout. Please try with a smaller video file.".to_string()
        }
        PlatformError::Api {
            status: 400,
            message,
            ..
        } => {
            let detail = if message.is_empty() || message == UNKNOWN_API_ERROR {
                "Invalid video format"
            } else {
                message.as_str()
            };
            format!("Facebook API error: {detail}")
        }
        _ => "Failed to upload video to Facebook. Please try again.".to_string(),
    }
}

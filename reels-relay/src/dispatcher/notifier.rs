//! Progress notifications sent back to the originating conversation.

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;
use crate::domain::JobSummary;

/// Lifecycle notification for one job.
///
/// `index` values are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobNotification {
    UploadStarting {
        destination: String,
        index: usize,
        total: usize,
    },
    UploadComplete {
        destination: String,
        index: usize,
        total: usize,
        after_retry: bool,
    },
    /// Sent before waiting for the next destination.
    NextDestination { index: usize, total: usize },
    /// Every destination succeeded.
    JobCompleted { summary: JobSummary },
    /// Some destinations failed, or the job could not run at all.
    JobFailed {
        job_id: String,
        message: String,
        summary: Option<JobSummary>,
    },
}

impl JobNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UploadStarting { .. } => "upload_starting",
            Self::UploadComplete { .. } => "upload_complete",
            Self::NextDestination { .. } => "next_destination",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
        }
    }
}

/// Delivers notifications to a conversation.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: &str, notification: &JobNotification) -> Result<()>;
}

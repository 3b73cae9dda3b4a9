//! Posting job entity.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Destination;
use crate::Error;

/// Opaque, time-derived job identifier.
pub type JobId = String;

/// Maximum length of a sanitized description.
const MAX_DESCRIPTION_CHARS: usize = 1000;

/// Posting work handed over by the chat controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Video to publish. The caller owns the file.
    pub video_path: PathBuf,
    /// Caption for the post.
    pub description: String,
    /// Conversation that receives progress notifications.
    pub chat_id: String,
    /// Identity of the originating message, used to deduplicate submissions.
    pub message_id: String,
}

impl JobRequest {
    pub fn new(
        video_path: impl Into<PathBuf>,
        chat_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            video_path: video_path.into(),
            description: String::new(),
            chat_id: chat_id.into(),
            message_id: message_id.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Strip markup characters, trim and cap the length of user-supplied text.
pub fn sanitize_description(input: &str) -> String {
    input
        .replace(['<', '>'], "")
        .trim()
        .chars()
        .take(MAX_DESCRIPTION_CHARS)
        .collect()
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Check if the job has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Processing) | (Queued, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: JobStatus) -> Result<JobStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of posting to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// One entry per job and destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostResult {
    pub destination_id: u32,
    pub remote_id: String,
    pub destination_name: String,
    pub status: ResultStatus,
    pub post_id: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Number of retries it took to succeed, if any.
    pub retried: Option<u32>,
}

impl PostResult {
    pub fn success(destination: &Destination, post_id: impl Into<String>) -> Self {
        Self {
            destination_id: destination.id,
            remote_id: destination.remote_id.clone(),
            destination_name: destination.name.clone(),
            status: ResultStatus::Success,
            post_id: Some(post_id.into()),
            error: None,
            timestamp: Utc::now(),
            retried: None,
        }
    }

    pub fn failure(destination: &Destination, error: impl Into<String>) -> Self {
        Self {
            destination_id: destination.id,
            remote_id: destination.remote_id.clone(),
            destination_name: destination.name.clone(),
            status: ResultStatus::Failed,
            post_id: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            retried: None,
        }
    }

    pub fn with_retries(mut self, retried: u32) -> Self {
        self.retried = Some(retried);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Aggregate outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    /// Rounded percentage of successful destinations.
    pub success_rate: u32,
    pub duration_ms: i64,
}

/// A video being posted across a snapshot of destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub video_path: PathBuf,
    pub description: String,
    pub chat_id: String,
    pub message_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Destinations captured at submission time.
    pub destinations: Vec<Destination>,
    pub results: Vec<PostResult>,
    pub current_index: usize,
    pub is_processing: bool,
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, request: JobRequest, destinations: Vec<Destination>) -> Self {
        Self {
            id: id.into(),
            video_path: request.video_path,
            description: sanitize_description(&request.description),
            chat_id: request.chat_id,
            message_id: request.message_id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            destinations,
            results: Vec::new(),
            current_index: 0,
            is_processing: false,
            error: None,
        }
    }

    /// Mark the job as actively processing.
    pub fn start(&mut self) -> Result<(), Error> {
        self.status = self.status.transition_to(JobStatus::Processing)?;
        self.is_processing = true;
        Ok(())
    }

    pub fn record(&mut self, result: PostResult) {
        self.results.push(result);
    }

    /// Replace the trailing failed entry for the same destination, or append.
    pub fn replace_last_failed(&mut self, result: PostResult) {
        match self.results.last_mut() {
            Some(last)
                if last.status == ResultStatus::Failed
                    && last.destination_id == result.destination_id =>
            {
                *last = result;
            }
            _ => self.results.push(result),
        }
    }

    pub fn complete(&mut self) -> Result<(), Error> {
        self.status = self.status.transition_to(JobStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.is_processing = false;
        Ok(())
    }

    /// Mark the job failed, recording the error. Always succeeds from a non-terminal state.
    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = JobStatus::Failed;
        }
        self.completed_at = Some(Utc::now());
        self.is_processing = false;
        self.error = Some(error.into());
    }

    pub fn summary(&self) -> JobSummary {
        let successful = self.results.iter().filter(|r| r.is_success()).count();
        let failed = self.results.len() - successful;
        let total = self.results.len();
        let success_rate = if total == 0 {
            0
        } else {
            ((successful as f64 / total as f64) * 100.0).round() as u32
        };
        let end = self.completed_at.unwrap_or_else(Utc::now);

        JobSummary {
            job_id: self.id.clone(),
            successful,
            failed,
            total,
            success_rate,
            duration_ms: (end - self.created_at).num_milliseconds(),
        }
    }

    /// Time since the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination(id: u32) -> Destination {
        Destination::new(
            id,
            format!("page-{id}"),
            "token",
            "app1",
            format!("Page {id}"),
        )
    }

    fn job(destinations: Vec<Destination>) -> Job {
        Job::new("1", JobRequest::new("/tmp/v.mp4", "chat", "msg"), destinations)
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Queued.transition_to(JobStatus::Completed).is_err());
    }

    #[test]
    fn test_sanitize_description() {
        assert_eq!(sanitize_description("  <b>hi</b>  "), "bhi/b");
        let long = "a".repeat(1500);
        assert_eq!(sanitize_description(&long).chars().count(), 1000);
    }

    #[test]
    fn test_replace_last_failed_keeps_one_entry() {
        let a = destination(1);
        let mut job = job(vec![a.clone()]);
        job.start().unwrap();
        job.record(PostResult::failure(&a, "boom"));
        job.replace_last_failed(PostResult::success(&a, "post-1").with_retries(1));

        assert_eq!(job.results.len(), 1);
        assert!(job.results[0].is_success());
        assert_eq!(job.results[0].retried, Some(1));
    }

    #[test]
    fn test_summary_success_rate() {
        let (a, b, c) = (destination(1), destination(2), destination(3));
        let mut job = job(vec![a.clone(), b.clone(), c.clone()]);
        job.start().unwrap();
        job.record(PostResult::success(&a, "1"));
        job.record(PostResult::failure(&b, "x"));
        job.record(PostResult::success(&c, "3"));
        job.complete().unwrap();

        let summary = job.summary();
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.success_rate, 67);
        assert!(summary.duration_ms >= 0);
    }

    #[test]
    fn test_summary_empty_job() {
        let mut job = job(Vec::new());
        job.start().unwrap();
        job.complete().unwrap();
        assert_eq!(job.summary().success_rate, 0);
    }

    #[test]
    fn test_fail_from_queued() {
        let mut job = job(Vec::new());
        job.fail("no destinations");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("no destinations"));
        assert!(!job.is_processing);
    }
}

//! Job dispatcher.
//!
//! Owns the FIFO of posting jobs and runs at most one of them at a time. Each
//! job walks its destination snapshot in order; a destination that fails is
//! retried once and then skipped, so one bad destination never aborts a job.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::notifier::{JobNotification, Notifier};
use crate::domain::{Destination, Job, JobId, JobRequest, JobSummary, PostResult};
use crate::registry::{DestinationSource, IdentityProvider};
use crate::transfer::{TransferTracker, TransferTuner};
use crate::upload::{UploadError, UploadOutcome, UploadProtocol};
use crate::{Error, Result};

/// Pause between connection checks when many destinations are checked.
const CONNECTION_CHECK_DELAY: Duration = Duration::from_millis(100);

/// Destinations checked back to back before pacing kicks in.
const CONNECTION_CHECK_BURST: usize = 3;

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Retries after a failed destination.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Pause after a destination that only succeeded on retry.
    #[serde(default = "default_retry_success_delay_ms")]
    pub retry_success_delay_ms: u64,
    /// Pause between two jobs.
    #[serde(default = "default_job_cooldown_ms")]
    pub job_cooldown_ms: u64,
    /// Queued jobs older than this are dropped by maintenance.
    #[serde(default = "default_stale_job_max_age_secs")]
    pub stale_job_max_age_secs: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

fn default_retry_count() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_retry_success_delay_ms() -> u64 {
    500
}

fn default_job_cooldown_ms() -> u64 {
    2_000
}

fn default_stale_job_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_maintenance_interval_secs() -> u64 {
    60 * 60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_success_delay_ms: default_retry_success_delay_ms(),
            job_cooldown_ms: default_job_cooldown_ms(),
            stale_job_max_age_secs: default_stale_job_max_age_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_success_delay(&self) -> Duration {
        Duration::from_millis(self.retry_success_delay_ms)
    }

    pub fn job_cooldown(&self) -> Duration {
        Duration::from_millis(self.job_cooldown_ms)
    }

    pub fn stale_job_max_age(&self) -> Duration {
        Duration::from_secs(self.stale_job_max_age_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

/// Posts a video to a single destination.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn post_to_one(
        &self,
        job_id: &str,
        video_path: &Path,
        destination: &Destination,
        description: &str,
    ) -> std::result::Result<UploadOutcome, UploadError>;
}

#[async_trait]
impl Uploader for UploadProtocol {
    async fn post_to_one(
        &self,
        job_id: &str,
        video_path: &Path,
        destination: &Destination,
        description: &str,
    ) -> std::result::Result<UploadOutcome, UploadError> {
        UploadProtocol::post_to_one(self, job_id, video_path, destination, description).await
    }
}

/// Point-in-time queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub waiting: usize,
    /// 1 while a job is being processed, otherwise 0.
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub active_job: Option<JobId>,
}

/// Dispatcher lifecycle events.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    JobQueued { job_id: JobId },
    JobStarted { job_id: JobId },
    /// The job is dropped from memory after this event.
    JobFinished { job: Box<Job> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected { remote_name: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub destination_id: u32,
    pub name: String,
    pub remote_id: String,
    pub status: ConnectionStatus,
}

impl ConnectionCheck {
    pub fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected { .. })
    }
}

#[derive(Debug, Clone)]
struct ActiveJob {
    id: JobId,
    message_id: String,
}

impl From<&Job> for ActiveJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            message_id: job.message_id.clone(),
        }
    }
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<Job>,
    active: Option<ActiveJob>,
    /// A worker task owns the queue, including during the cooldown.
    running: bool,
    completed: u64,
    failed: u64,
}

impl DispatchState {
    fn find_by_message(&self, message_id: &str) -> Option<JobId> {
        if let Some(active) = &self.active {
            if active.message_id == message_id {
                return Some(active.id.clone());
            }
        }
        self.queue
            .iter()
            .find(|job| job.message_id == message_id)
            .map(|job| job.id.clone())
    }
}

/// Sequential multi-destination job dispatcher.
pub struct JobDispatcher {
    config: DispatchConfig,
    source: Arc<dyn DestinationSource>,
    uploader: Arc<dyn Uploader>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    tuner: Arc<TransferTuner>,
    tracker: Arc<TransferTracker>,
    state: Mutex<DispatchState>,
    last_job_id: AtomicI64,
    event_tx: broadcast::Sender<DispatchEvent>,
    idle_tx: watch::Sender<bool>,
    cancellation_token: CancellationToken,
}

impl JobDispatcher {
    pub fn new(
        config: DispatchConfig,
        source: Arc<dyn DestinationSource>,
        uploader: Arc<dyn Uploader>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
        tuner: Arc<TransferTuner>,
        tracker: Arc<TransferTracker>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let (idle_tx, _) = watch::channel(true);

        Self {
            config,
            source,
            uploader,
            identity,
            notifier,
            tuner,
            tracker,
            state: Mutex::new(DispatchState::default()),
            last_job_id: AtomicI64::new(0),
            event_tx,
            idle_tx,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    /// Queue a job, or return the id of the queued or active job for the same message.
    ///
    /// The destination set is captured here; later registry changes do not
    /// affect this job.
    #[instrument(skip(self, request), fields(message_id = %request.message_id))]
    pub async fn submit(self: &Arc<Self>, request: JobRequest) -> Result<JobId> {
        if let Some(existing) = self.state.lock().find_by_message(&request.message_id) {
            info!(job_id = %existing, "Job already queued for this message");
            return Ok(existing);
        }
        if self.cancellation_token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let destinations = self.source.enabled_destinations().await?;

        let (job_id, start) = {
            let mut state = self.state.lock();
            // Re-check: another submission may have won while the snapshot was taken.
            if let Some(existing) = state.find_by_message(&request.message_id) {
                return Ok(existing);
            }
            if self.cancellation_token.is_cancelled() {
                return Err(Error::ShuttingDown);
            }

            let job = Job::new(self.next_job_id(), request, destinations);
            let job_id = job.id.clone();
            info!(
                job_id = %job_id,
                destinations = job.destinations.len(),
                waiting = state.queue.len(),
                "Job queued"
            );

            if state.running {
                state.queue.push_back(job);
                (job_id, None)
            } else {
                state.running = true;
                state.active = Some(ActiveJob::from(&job));
                self.idle_tx.send_replace(false);
                (job_id, Some(job))
            }
        };

        let _ = self.event_tx.send(DispatchEvent::JobQueued {
            job_id: job_id.clone(),
        });

        if let Some(job) = start {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move { dispatcher.run(job).await });
        }
        Ok(job_id)
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.state.lock();
        QueueStatus {
            waiting: state.queue.len(),
            active: usize::from(state.active.is_some()),
            completed: state.completed,
            failed: state.failed,
            active_job: state.active.as_ref().map(|a| a.id.clone()),
        }
    }

    /// Wait until no job is active or queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Stop continuing to queued jobs. The active job still runs to completion.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }

    /// Worker loop: processes `first`, then drains the queue with a cooldown between jobs.
    async fn run(self: Arc<Self>, first: Job) {
        let mut job = first;
        loop {
            self.process(job).await;

            let has_more = !self.state.lock().queue.is_empty();
            if has_more {
                debug!(cooldown = ?self.config.job_cooldown(), "Cooling down before next job");
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => {
                        info!("Dispatcher stopped, leaving queued jobs");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.job_cooldown()) => {}
                }
            }

            match self.take_next() {
                Some(next) => job = next,
                None => return,
            }
        }
        self.release();
    }

    fn take_next(&self) -> Option<Job> {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(job) => {
                state.active = Some(ActiveJob::from(&job));
                Some(job)
            }
            None => {
                state.running = false;
                state.active = None;
                self.idle_tx.send_replace(true);
                None
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.active = None;
        self.idle_tx.send_replace(true);
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn process(&self, mut job: Job) {
        let chat_id = job.chat_id.clone();
        let _ = self.event_tx.send(DispatchEvent::JobStarted {
            job_id: job.id.clone(),
        });

        match self.execute(&mut job).await {
            Ok(summary) => {
                info!(
                    successful = summary.successful,
                    failed = summary.failed,
                    total = summary.total,
                    success_rate = summary.success_rate,
                    duration_ms = summary.duration_ms,
                    "Job completed"
                );
                let notification = if summary.failed == 0 {
                    JobNotification::JobCompleted { summary }
                } else {
                    JobNotification::JobFailed {
                        job_id: job.id.clone(),
                        message: format!("{} pages failed to post", summary.failed),
                        summary: Some(summary),
                    }
                };
                self.notify(&chat_id, notification).await;

                let mut state = self.state.lock();
                state.completed += 1;
                state.active = None;
            }
            Err(e) => {
                error!(error = %e, "Job failed");
                job.fail(e.to_string());
                self.notify(
                    &chat_id,
                    JobNotification::JobFailed {
                        job_id: job.id.clone(),
                        message: e.to_string(),
                        summary: None,
                    },
                )
                .await;

                let mut state = self.state.lock();
                state.failed += 1;
                state.active = None;
            }
        }

        let _ = self.event_tx.send(DispatchEvent::JobFinished { job: Box::new(job) });
    }

    /// Walk every destination of the snapshot. Errors here abort the whole job.
    async fn execute(&self, job: &mut Job) -> Result<JobSummary> {
        if job.destinations.is_empty() {
            return Err(Error::validation("No enabled destinations available"));
        }
        if !tokio::fs::try_exists(&job.video_path).await.unwrap_or(false) {
            return Err(Error::not_found(
                "Video file",
                job.video_path.display().to_string(),
            ));
        }
        job.start()?;

        let destinations = job.destinations.clone();
        let total = destinations.len();

        for (i, destination) in destinations.iter().enumerate() {
            job.current_index = i;
            let index = i + 1;
            info!(destination = %destination.name, index, total, "Posting to destination");
            self.notify(
                &job.chat_id,
                JobNotification::UploadStarting {
                    destination: destination.name.clone(),
                    index,
                    total,
                },
            )
            .await;

            let result = self
                .uploader
                .post_to_one(&job.id, &job.video_path, destination, &job.description)
                .await;

            let pause = match result {
                Ok(outcome) => {
                    job.record(PostResult::success(destination, outcome.post_id));
                    self.notify_complete(job, destination, index, total, false)
                        .await;
                    Some(self.tuner.destination_delay())
                }
                Err(e) => {
                    warn!(destination = %destination.name, error = %e, "Post failed");
                    job.record(PostResult::failure(destination, e.to_string()));
                    if self.retry(job, destination).await {
                        self.notify_complete(job, destination, index, total, true)
                            .await;
                        Some(self.config.retry_success_delay())
                    } else {
                        warn!(destination = %destination.name, "Giving up on destination, moving on");
                        None
                    }
                }
            };

            if let Some(pause) = pause.filter(|_| index < total) {
                self.notify(
                    &job.chat_id,
                    JobNotification::NextDestination {
                        index: index + 1,
                        total,
                    },
                )
                .await;
                tokio::time::sleep(pause).await;
            }
        }

        job.complete()?;
        Ok(job.summary())
    }

    /// Retry a failed destination, replacing its result. Returns true on success.
    async fn retry(&self, job: &mut Job, destination: &Destination) -> bool {
        for attempt in 1..=self.config.retry_count {
            tokio::time::sleep(self.config.retry_delay()).await;
            info!(destination = %destination.name, attempt, "Retrying post");

            match self
                .uploader
                .post_to_one(&job.id, &job.video_path, destination, &job.description)
                .await
            {
                Ok(outcome) => {
                    job.replace_last_failed(
                        PostResult::success(destination, outcome.post_id).with_retries(attempt),
                    );
                    info!(destination = %destination.name, attempt, "Post succeeded after retry");
                    return true;
                }
                Err(e) => {
                    warn!(destination = %destination.name, attempt, error = %e, "Retry failed");
                    job.replace_last_failed(
                        PostResult::failure(destination, e.to_string()).with_retries(attempt),
                    );
                }
            }
        }
        false
    }

    async fn notify_complete(
        &self,
        job: &Job,
        destination: &Destination,
        index: usize,
        total: usize,
        after_retry: bool,
    ) {
        self.notify(
            &job.chat_id,
            JobNotification::UploadComplete {
                destination: destination.name.clone(),
                index,
                total,
                after_retry,
            },
        )
        .await;
    }

    /// Deliver a notification; failures are logged and otherwise ignored.
    async fn notify(&self, chat_id: &str, notification: JobNotification) {
        if let Err(e) = self.notifier.notify(chat_id, &notification).await {
            warn!(kind = notification.kind(), error = %e, "Failed to deliver notification");
        }
    }

    /// Look up every enabled destination with its own credential.
    pub async fn check_connections(&self) -> Result<Vec<ConnectionCheck>> {
        let destinations = self.source.enabled_destinations().await?;
        let pace = destinations.len() > CONNECTION_CHECK_BURST;
        let mut checks = Vec::with_capacity(destinations.len());

        for (i, destination) in destinations.iter().enumerate() {
            if pace && i > 0 {
                tokio::time::sleep(CONNECTION_CHECK_DELAY).await;
            }

            let status = match self
                .identity
                .lookup(&destination.remote_id, &destination.access_token)
                .await
            {
                Ok(identity) => ConnectionStatus::Connected {
                    remote_name: identity.name,
                },
                Err(e) => {
                    warn!(destination = %destination.name, error = %e, "Connection check failed");
                    ConnectionStatus::Error {
                        message: e.to_string(),
                    }
                }
            };

            checks.push(ConnectionCheck {
                destination_id: destination.id,
                name: destination.name.clone(),
                remote_id: destination.remote_id.clone(),
                status,
            });
        }

        let connected = checks.iter().filter(|c| c.is_connected()).count();
        info!(connected, total = checks.len(), "Connection check finished");
        Ok(checks)
    }

    /// Fail queued jobs older than `max_age` and tell their chats.
    /// Returns how many were dropped.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let stale: Vec<Job> = {
            let mut state = self.state.lock();
            let (stale, fresh): (Vec<Job>, Vec<Job>) =
                state.queue.drain(..).partition(|job| job.age() >= max_age);
            state.queue = fresh.into();
            state.failed += stale.len() as u64;
            stale
        };
        if stale.is_empty() {
            return 0;
        }

        let removed = stale.len();
        let message = format!(
            "Job expired after waiting more than {} minutes in the queue",
            max_age.num_minutes()
        );
        for mut job in stale {
            warn!(job_id = %job.id, "Dropping stale queued job");
            job.fail(message.clone());
            self.notify(
                &job.chat_id,
                JobNotification::JobFailed {
                    job_id: job.id.clone(),
                    message: message.clone(),
                    summary: None,
                },
            )
            .await;
            let _ = self.event_tx.send(DispatchEvent::JobFinished { job: Box::new(job) });
        }
        info!(removed, "Dropped stale queued jobs");
        removed
    }

    async fn run_maintenance(&self) {
        let max_age = self.config.stale_job_max_age();
        let jobs = self.cleanup_stale(max_age).await;
        let records = self.tracker.cleanup_stale(max_age);
        debug!(jobs, records, "Maintenance pass finished");
    }

    /// Periodically drop stale jobs and transfer records until `cancel` fires.
    pub fn start_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let period = self.config.maintenance_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Maintenance task shutting down");
                        break;
                    }
                    _ = ticker.tick() => dispatcher.run_maintenance().await,
                }
            }
        })
    }

    /// Millisecond timestamp, bumped to stay unique within the process.
    fn next_job_id(&self) -> JobId {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_job_id.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_job_id.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next.to_string(),
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountIdentity, ResultStatus};
    use crate::registry::ResolutionError;
    use crate::transfer::TunerConfig;
    use crate::upload::{PlatformError, UploadPath};
    use std::collections::{HashMap, VecDeque};
    use tempfile::TempDir;
    use tokio::sync::{Notify, Semaphore};

    struct MockSource {
        destinations: Mutex<Vec<Destination>>,
    }

    #[async_trait]
    impl DestinationSource for MockSource {
        async fn enabled_destinations(&self) -> Result<Vec<Destination>> {
            Ok(self.destinations.lock().clone())
        }
    }

    /// Blocks every snapshot until a permit is released.
    struct GatedSource {
        destinations: Vec<Destination>,
        entered: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl DestinationSource for GatedSource {
        async fn enabled_destinations(&self) -> Result<Vec<Destination>> {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
            Ok(self.destinations.clone())
        }
    }

    /// Scripted outcomes per remote id; unscripted calls succeed.
    #[derive(Default)]
    struct MockUploader {
        outcomes: Mutex<HashMap<String, VecDeque<bool>>>,
        calls: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl MockUploader {
        fn script(self, remote_id: &str, outcomes: &[bool]) -> Self {
            self.outcomes
                .lock()
                .insert(remote_id.to_string(), outcomes.iter().copied().collect());
            self
        }
    }

    #[async_trait]
    impl Uploader for MockUploader {
        async fn post_to_one(
            &self,
            _job_id: &str,
            _video_path: &Path,
            destination: &Destination,
            _description: &str,
        ) -> std::result::Result<UploadOutcome, UploadError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.calls.lock().push(destination.remote_id.clone());
            let ok = self
                .outcomes
                .lock()
                .get_mut(&destination.remote_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(true);
            if ok {
                Ok(UploadOutcome {
                    post_id: format!("post-{}", destination.remote_id),
                    path: UploadPath::Resumable,
                    bytes: 10,
                    compressed: false,
                    duration: Duration::ZERO,
                })
            } else {
                Err(UploadError::new(PlatformError::from_body(500, "{}"), None))
            }
        }
    }

    #[derive(Default)]
    struct MockNotifier {
        sent: Mutex<Vec<(String, JobNotification)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn notify(&self, chat_id: &str, notification: &JobNotification) -> Result<()> {
            self.sent
                .lock()
                .push((chat_id.to_string(), notification.clone()));
            if self.fail {
                return Err(Error::notification("chat unavailable"));
            }
            Ok(())
        }
    }

    struct MockIdentity;

    #[async_trait]
    impl IdentityProvider for MockIdentity {
        async fn resolve(
            &self,
            _access_token: &str,
        ) -> std::result::Result<AccountIdentity, ResolutionError> {
            unreachable!("not used by the dispatcher")
        }

        async fn lookup(
            &self,
            remote_id: &str,
            access_token: &str,
        ) -> std::result::Result<AccountIdentity, ResolutionError> {
            if access_token == "expired" {
                return Err(ResolutionError::Api {
                    status: 401,
                    message: "Session has expired".to_string(),
                    code: Some(190),
                });
            }
            Ok(AccountIdentity {
                id: remote_id.to_string(),
                name: format!("Remote {remote_id}"),
                category: None,
                followers_count: None,
                verification_status: None,
            })
        }
    }

    fn destination(id: u32, remote_id: &str) -> Destination {
        Destination::new(id, remote_id, "token", "app1", format!("Page {remote_id}"))
    }

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            retry_count: 1,
            retry_delay_ms: 0,
            retry_success_delay_ms: 0,
            job_cooldown_ms: 0,
            ..Default::default()
        }
    }

    struct Harness {
        dir: TempDir,
        source: Arc<MockSource>,
        uploader: Arc<MockUploader>,
        notifier: Arc<MockNotifier>,
        dispatcher: Arc<JobDispatcher>,
    }

    impl Harness {
        fn new(destinations: Vec<Destination>, uploader: MockUploader, notifier: MockNotifier) -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("video.mp4"), b"video").unwrap();

            let source = Arc::new(MockSource {
                destinations: Mutex::new(destinations),
            });
            let uploader = Arc::new(uploader);
            let notifier = Arc::new(notifier);
            // Excellent profile keeps the inter-destination pause short.
            let tuner = Arc::new(TransferTuner::new(TunerConfig {
                default_avg_speed: 3.0,
                default_stability: 0.9,
                ..Default::default()
            }));
            let dispatcher = Arc::new(JobDispatcher::new(
                test_config(),
                source.clone(),
                uploader.clone(),
                Arc::new(MockIdentity),
                notifier.clone(),
                tuner,
                Arc::new(TransferTracker::new()),
            ));

            Self {
                dir,
                source,
                uploader,
                notifier,
                dispatcher,
            }
        }

        fn request(&self, message_id: &str) -> JobRequest {
            JobRequest::new(self.dir.path().join("video.mp4"), "chat-1", message_id)
                .with_description("A <b>video</b>")
        }
    }

    fn finished_jobs(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DispatchEvent::JobFinished { job } = event {
                jobs.push(*job);
            }
        }
        jobs
    }

    #[tokio::test]
    async fn test_mixed_outcomes_complete_job() {
        let uploader = MockUploader::default().script("b", &[false, false]);
        let h = Harness::new(
            vec![destination(1, "a"), destination(2, "b"), destination(3, "c")],
            uploader,
            MockNotifier::default(),
        );
        let mut rx = h.dispatcher.subscribe();

        h.dispatcher.submit(h.request("m1")).await.unwrap();
        h.dispatcher.wait_idle().await;

        let jobs = finished_jobs(&mut rx);
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.status, crate::domain::JobStatus::Completed);
        assert_eq!(job.description, "A bvideo/b");
        assert_eq!(job.results.len(), 3);
        let statuses: Vec<ResultStatus> = job.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ResultStatus::Success, ResultStatus::Failed, ResultStatus::Success]
        );
        assert_eq!(job.results[1].retried, Some(1));

        let summary = job.summary();
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.success_rate, 67);

        assert_eq!(*h.uploader.calls.lock(), vec!["a", "b", "b", "c"]);

        let sent = h.notifier.sent.lock();
        let kinds: Vec<&str> = sent.iter().map(|(_, n)| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "upload_starting",
                "upload_complete",
                "next_destination",
                "upload_starting",
                "upload_starting",
                "upload_complete",
                "job_failed",
            ]
        );
        assert!(sent.iter().all(|(chat, _)| chat == "chat-1"));
        match &sent.last().unwrap().1 {
            JobNotification::JobFailed { message, .. } => {
                assert_eq!(message, "1 pages failed to post")
            }
            other => panic!("unexpected {other:?}"),
        }

        let status = h.dispatcher.queue_status();
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 0);
    }

    #[tokio::test]
    async fn test_retry_success_replaces_failed_result() {
        let uploader = MockUploader::default().script("a", &[false, true]);
        let h = Harness::new(
            vec![destination(1, "a"), destination(2, "b")],
            uploader,
            MockNotifier::default(),
        );
        let mut rx = h.dispatcher.subscribe();

        h.dispatcher.submit(h.request("m1")).await.unwrap();
        h.dispatcher.wait_idle().await;

        let job = finished_jobs(&mut rx).remove(0);
        assert_eq!(job.results.len(), 2);
        assert!(job.results[0].is_success());
        assert_eq!(job.results[0].retried, Some(1));
        assert_eq!(job.results[0].post_id.as_deref(), Some("post-a"));

        let sent = h.notifier.sent.lock();
        assert!(sent.iter().any(|(_, n)| matches!(
            n,
            JobNotification::UploadComplete { after_retry: true, index: 1, .. }
        )));
        assert!(matches!(
            sent.last().unwrap().1,
            JobNotification::JobCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_queue_status_and_idempotent_submit() {
        let gate = Arc::new(Semaphore::new(0));
        let uploader = MockUploader {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = Harness::new(vec![destination(1, "a")], uploader, MockNotifier::default());

        let idle = h.dispatcher.queue_status();
        assert_eq!((idle.waiting, idle.active), (0, 0));

        let first = h.dispatcher.submit(h.request("m1")).await.unwrap();
        let status = h.dispatcher.queue_status();
        assert_eq!((status.waiting, status.active), (0, 1));
        assert_eq!(status.active_job.as_deref(), Some(first.as_str()));

        // Same message while active.
        assert_eq!(h.dispatcher.submit(h.request("m1")).await.unwrap(), first);

        let second = h.dispatcher.submit(h.request("m2")).await.unwrap();
        assert_ne!(second, first);
        // Same message while queued.
        assert_eq!(h.dispatcher.submit(h.request("m2")).await.unwrap(), second);
        assert_eq!(h.dispatcher.queue_status().waiting, 1);

        gate.add_permits(10);
        h.dispatcher.wait_idle().await;

        let done = h.dispatcher.queue_status();
        assert_eq!((done.waiting, done.active), (0, 0));
        assert_eq!(done.completed, 2);
        assert_eq!(*h.uploader.calls.lock(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_snapshot_ignores_later_registry_changes() {
        let gate = Arc::new(Semaphore::new(0));
        let uploader = MockUploader {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = Harness::new(
            vec![destination(1, "a"), destination(2, "b")],
            uploader,
            MockNotifier::default(),
        );
        let mut rx = h.dispatcher.subscribe();

        h.dispatcher.submit(h.request("m1")).await.unwrap();
        h.source.destinations.lock().retain(|d| d.remote_id != "b");
        gate.add_permits(10);
        h.dispatcher.wait_idle().await;

        let job = finished_jobs(&mut rx).remove(0);
        assert_eq!(job.results.len(), 2);
        assert_eq!(*h.uploader.calls.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_no_destinations_fails_job() {
        let h = Harness::new(Vec::new(), MockUploader::default(), MockNotifier::default());
        let mut rx = h.dispatcher.subscribe();

        h.dispatcher.submit(h.request("m1")).await.unwrap();
        h.dispatcher.wait_idle().await;

        let job = finished_jobs(&mut rx).remove(0);
        assert_eq!(job.status, crate::domain::JobStatus::Failed);
        assert!(job.error.is_some());
        assert!(job.results.is_empty());

        let status = h.dispatcher.queue_status();
        assert_eq!(status.failed, 1);
        assert_eq!(status.active, 0);
        assert!(matches!(
            h.notifier.sent.lock()[0].1,
            JobNotification::JobFailed { summary: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_video_fails_job() {
        let h = Harness::new(
            vec![destination(1, "a")],
            MockUploader::default(),
            MockNotifier::default(),
        );
        let request = JobRequest::new(h.dir.path().join("missing.mp4"), "chat-1", "m1");

        h.dispatcher.submit(request).await.unwrap();
        h.dispatcher.wait_idle().await;

        assert_eq!(h.dispatcher.queue_status().failed, 1);
        assert!(h.uploader.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_stop_job() {
        let notifier = MockNotifier {
            fail: true,
            ..Default::default()
        };
        let h = Harness::new(
            vec![destination(1, "a"), destination(2, "b")],
            MockUploader::default(),
            notifier,
        );

        h.dispatcher.submit(h.request("m1")).await.unwrap();
        h.dispatcher.wait_idle().await;

        assert_eq!(h.dispatcher.queue_status().completed, 1);
        assert_eq!(h.uploader.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_stale_fails_queued_jobs() {
        let gate = Arc::new(Semaphore::new(0));
        let uploader = MockUploader {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = Harness::new(vec![destination(1, "a")], uploader, MockNotifier::default());

        h.dispatcher.submit(h.request("m1")).await.unwrap();
        let mut events = h.dispatcher.subscribe();
        let stale_id = h.dispatcher.submit(h.request("m2")).await.unwrap();
        assert_eq!(h.dispatcher.cleanup_stale(Duration::from_secs(3600)).await, 0);
        assert_eq!(h.dispatcher.cleanup_stale(Duration::ZERO).await, 1);

        let status = h.dispatcher.queue_status();
        assert_eq!((status.waiting, status.failed), (0, 1));
        let dropped = finished_jobs(&mut events);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, stale_id);
        assert_eq!(dropped[0].status, crate::domain::JobStatus::Failed);

        let expired: Vec<_> = h
            .notifier
            .sent
            .lock()
            .iter()
            .filter_map(|(chat, n)| match n {
                JobNotification::JobFailed { job_id, .. } => Some((chat.clone(), job_id.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(expired, vec![("chat-1".to_string(), stale_id)]);

        gate.add_permits(10);
        h.dispatcher.wait_idle().await;
        let status = h.dispatcher.queue_status();
        assert_eq!((status.completed, status.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_check_connections() {
        let mut expired = destination(2, "b");
        expired.access_token = "expired".to_string();
        let h = Harness::new(
            vec![destination(1, "a"), expired],
            MockUploader::default(),
            MockNotifier::default(),
        );

        let checks = h.dispatcher.check_connections().await.unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(
            checks[0].status,
            ConnectionStatus::Connected {
                remote_name: "Remote a".to_string()
            }
        );
        assert!(!checks[1].is_connected());
    }

    #[tokio::test]
    async fn test_job_ids_are_unique() {
        let h = Harness::new(Vec::new(), MockUploader::default(), MockNotifier::default());
        let a = h.dispatcher.next_job_id();
        let b = h.dispatcher.next_job_id();
        assert!(b.parse::<i64>().unwrap() > a.parse::<i64>().unwrap());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let h = Harness::new(vec![destination(1, "a")], MockUploader::default(), MockNotifier::default());
        h.dispatcher.shutdown();
        assert!(matches!(
            h.dispatcher.submit(h.request("m1")).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_during_snapshot_rejects_submit() {
        let source = Arc::new(GatedSource {
            destinations: vec![destination(1, "a")],
            entered: Notify::new(),
            gate: Semaphore::new(0),
        });
        let uploader = Arc::new(MockUploader::default());
        let dispatcher = Arc::new(JobDispatcher::new(
            test_config(),
            source.clone(),
            uploader.clone(),
            Arc::new(MockIdentity),
            Arc::new(MockNotifier::default()),
            Arc::new(TransferTuner::new(TunerConfig::default())),
            Arc::new(TransferTracker::new()),
        ));

        let pending = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit(JobRequest::new("/tmp/video.mp4", "chat-1", "m1"))
                    .await
            })
        };
        source.entered.notified().await;
        dispatcher.shutdown();
        source.gate.add_permits(1);

        assert!(matches!(pending.await.unwrap(), Err(Error::ShuttingDown)));
        dispatcher.wait_idle().await;
        let status = dispatcher.queue_status();
        assert_eq!((status.active, status.waiting), (0, 0));
        assert!(uploader.calls.lock().is_empty());
    }
}

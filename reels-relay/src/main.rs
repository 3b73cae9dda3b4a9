use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reels_relay::config::AppConfig;
use reels_relay::dispatcher::{DispatchEvent, JobDispatcher};
use reels_relay::domain::JobRequest;
use reels_relay::logging;
use reels_relay::media::{FfmpegTranscoder, MediaTransform};
use reels_relay::notification::TelegramNotifier;
use reels_relay::registry::{DestinationRegistry, GraphIdentityProvider};
use reels_relay::transfer::{TransferTracker, TransferTuner};
use reels_relay::upload::{GraphPublisher, UploadProtocol};
use reels_relay::utils::http_client;

/// Client-wide default; upload calls set their own per-request timeouts.
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let (logging, _guard) = logging::init_logging(&config.logging.log_dir)?;

    info!(
        destinations = config.destinations.len(),
        "reels-relay starting"
    );

    http_client::install_rustls_provider();
    let client = http_client::build_client(HTTP_TIMEOUT)?;

    let tuner = Arc::new(TransferTuner::new(config.tuner.clone()));
    let tracker = Arc::new(TransferTracker::new());

    let identity = Arc::new(GraphIdentityProvider::new(
        client.clone(),
        config.graph.clone(),
    ));
    let registry = Arc::new(DestinationRegistry::new(
        identity.clone(),
        config.registry.clone(),
    ));
    registry.initialize(config.destinations.clone()).await;

    let transcoder = Arc::new(FfmpegTranscoder::new(
        &config.media.ffmpeg_path,
        &config.media.ffprobe_path,
    ));
    let transform = Arc::new(MediaTransform::new(config.media.clone(), transcoder));
    let publisher = Arc::new(GraphPublisher::new(client.clone(), config.graph.clone()));
    let protocol = Arc::new(UploadProtocol::new(
        publisher,
        transform,
        tuner.clone(),
        tracker.clone(),
    ));
    let notifier = Arc::new(TelegramNotifier::new(config.telegram.clone(), client));

    let dispatcher = Arc::new(JobDispatcher::new(
        config.dispatch.clone(),
        registry.clone(),
        protocol,
        identity,
        notifier,
        tuner,
        tracker,
    ));

    let report = registry.report();
    if !report.validation.is_valid {
        warn!(errors = ?report.validation.errors, "Destination configuration has errors");
    }

    match dispatcher.check_connections().await {
        Ok(checks) => {
            let connected = checks.iter().filter(|c| c.is_connected()).count();
            info!(connected, total = checks.len(), "Connection check finished");
        }
        Err(e) => warn!(error = %e, "Connection check failed"),
    }

    let cancel = CancellationToken::new();
    logging.start_retention_cleanup(cancel.clone());
    let maintenance = dispatcher.start_maintenance(cancel.clone());
    spawn_event_logger(&dispatcher, cancel.clone());

    let mut args = std::env::args().skip(1);
    if let Some(path) = args.next() {
        let description = args.collect::<Vec<_>>().join(" ");
        let request = cli_request(PathBuf::from(path), description, &config);
        match dispatcher.submit(request).await {
            Ok(job_id) => info!(job_id = %job_id, "Job submitted"),
            Err(e) => error!(error = %e, "Failed to submit job"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!(status = ?dispatcher.queue_status(), "Shutdown requested, draining queue");

    cancel.cancel();
    dispatcher.wait_idle().await;
    dispatcher.shutdown();
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task ended abnormally");
    }

    info!("reels-relay stopped");
    Ok(())
}

/// Build a job for a video named on the command line.
fn cli_request(path: PathBuf, description: String, config: &AppConfig) -> JobRequest {
    let message_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cli".to_string());
    let chat_id = config.telegram.default_chat_id.clone().unwrap_or_default();

    JobRequest::new(path, chat_id, message_id).with_description(description)
}

fn spawn_event_logger(dispatcher: &Arc<JobDispatcher>, cancel: CancellationToken) {
    let mut events = dispatcher.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(DispatchEvent::JobFinished { job }) => {
                        let summary = job.summary();
                        info!(
                            job_id = %job.id,
                            successful = summary.successful,
                            failed = summary.failed,
                            success_rate = summary.success_rate,
                            "Job finished"
                        );
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event logger lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

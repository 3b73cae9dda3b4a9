//! Subscriber setup.
//!
//! Console output plus a daily-rotated file under the log directory. The
//! filter can be swapped at runtime, and rotated files past retention are
//! swept once a day.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
};

pub const DEFAULT_LOG_FILTER: &str = "reels_relay=info,reqwest=warn";

/// Rotated files are named `<prefix>.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "reels-relay.log";

const RETENTION_DAYS: i64 = 7;
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Which rotated log files to keep.
#[derive(Debug, Clone)]
pub struct LogRetention {
    dir: PathBuf,
    prefix: String,
    days: i64,
}

impl LogRetention {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, days: i64) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            days,
        }
    }

    /// True for a rotated file of ours dated more than `days` before `today`.
    fn is_expired(&self, file_name: &str, today: NaiveDate) -> bool {
        let Some(date) = file_name
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        else {
            return false;
        };
        date < today - chrono::Duration::days(self.days)
    }

    /// Remove expired files, returning how many were deleted.
    pub async fn sweep(&self) -> std::io::Result<usize> {
        let today = Local::now().date_naive();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| self.is_expired(n, today)) {
                continue;
            }

            let path = entry.path();
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Could not remove expired log");
            } else {
                debug!(path = %path.display(), "Removed expired log");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Log retention sweep finished");
        }
        Ok(removed)
    }
}

/// Runtime control over the installed subscriber.
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    retention: LogRetention,
}

impl LoggingHandle {
    pub fn get_filter(&self) -> String {
        self.filter
            .with_current(ToString::to_string)
            .unwrap_or_default()
    }

    /// Swap the active filter, e.g. to `reels_relay=debug`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::config(format!("Bad log filter {directive:?}: {e}")))?;
        self.filter
            .reload(filter)
            .map_err(|e| crate::Error::Other(format!("Log filter reload failed: {e}")))?;

        info!(directive, "Log filter changed");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.retention.dir
    }

    /// Sweep expired logs now and then daily, until cancelled.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let retention = self.retention.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = retention.sweep().await {
                            warn!(error = %e, "Log retention sweep failed");
                        }
                    }
                }
            }
            debug!("Log retention task stopped");
        });
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes the file writer on drop; hold it until exit.
pub fn init_logging(log_dir: impl AsRef<Path>) -> crate::Result<(Arc<LoggingHandle>, WorkerGuard)> {
    let dir = log_dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter, filter_handle) = reload::Layer::new(filter);

    let console = fmt::layer().with_timer(LocalTimer);
    let file = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_timer(LocalTimer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Logging already initialized: {e}")))?;

    let handle = LoggingHandle {
        filter: filter_handle,
        retention: LogRetention::new(dir, LOG_FILE_PREFIX, RETENTION_DAYS),
    };
    Ok((Arc::new(handle), guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_is_expired() {
        let retention = LogRetention::new("/tmp", LOG_FILE_PREFIX, 7);
        let today = date("2026-03-20");

        assert!(retention.is_expired("reels-relay.log.2026-03-01", today));
        assert!(!retention.is_expired("reels-relay.log.2026-03-13", today));
        assert!(!retention.is_expired("reels-relay.log.2026-03-20", today));
        assert!(!retention.is_expired("reels-relay.log", today));
        assert!(!retention.is_expired("reels-relay.log.backup", today));
        assert!(!retention.is_expired("other.log.2026-03-01", today));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let today = Local::now().date_naive();
        let old = today - chrono::Duration::days(30);

        let expired = dir.path().join(format!("{LOG_FILE_PREFIX}.{}", old.format("%Y-%m-%d")));
        let current = dir.path().join(format!("{LOG_FILE_PREFIX}.{}", today.format("%Y-%m-%d")));
        let foreign = dir.path().join(format!("other.log.{}", old.format("%Y-%m-%d")));
        for path in [&expired, &current, &foreign] {
            tokio::fs::write(path, b"line").await.unwrap();
        }

        let retention = LogRetention::new(dir.path(), LOG_FILE_PREFIX, RETENTION_DAYS);
        assert_eq!(retention.sweep().await.unwrap(), 1);
        assert!(!expired.exists());
        assert!(current.exists());
        assert!(foreign.exists());
    }
}

//! Network-adaptive transfer tuning.
//!
//! The tuner keeps a rolling window of recent upload outcomes (the network
//! profile) and derives chunk size, timeouts and pacing delays from it. The
//! derivation is a pure function of average speed and stability, so the same
//! profile always yields the same settings.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

const MIN_CHUNK_TIMEOUT_MS: f64 = 60_000.0;
const MAX_CHUNK_TIMEOUT_MS: f64 = 300_000.0;

/// Configuration for the transfer tuner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Number of recent uploads kept in the profile.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Average speed (MB/s) assumed before any upload completes.
    #[serde(default = "default_avg_speed")]
    pub default_avg_speed: f64,
    /// Stability ratio assumed before any upload completes.
    #[serde(default = "default_stability")]
    pub default_stability: f64,
}

fn default_window_size() -> usize {
    10
}

fn default_avg_speed() -> f64 {
    1.0
}

fn default_stability() -> f64 {
    0.8
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            default_avg_speed: default_avg_speed(),
            default_stability: default_stability(),
        }
    }
}

/// Outcome of a single upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UploadSample {
    /// Throughput in MB/s.
    pub speed_mbps: f64,
    pub duration_secs: f64,
    pub size_mb: f64,
    pub success: bool,
}

impl UploadSample {
    pub fn success(speed_mbps: f64, duration_secs: f64, size_mb: f64) -> Self {
        Self {
            speed_mbps,
            duration_secs,
            size_mb,
            success: true,
        }
    }

    pub fn failure() -> Self {
        Self {
            speed_mbps: 0.0,
            duration_secs: 0.0,
            size_mb: 0.0,
            success: false,
        }
    }
}

/// Rolling statistics over recent uploads.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkProfile {
    pub samples: VecDeque<UploadSample>,
    /// Mean speed of successful samples, in MB/s.
    pub avg_speed: f64,
    /// Successful samples divided by window length.
    pub stability: f64,
}

impl NetworkProfile {
    fn new(config: &TunerConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_size),
            avg_speed: config.default_avg_speed,
            stability: config.default_stability,
        }
    }

    fn record(&mut self, sample: UploadSample, window_size: usize) {
        self.samples.push_back(sample);
        while self.samples.len() > window_size.max(1) {
            self.samples.pop_front();
        }

        let successes: Vec<&UploadSample> = self.samples.iter().filter(|s| s.success).collect();
        // With no success in the window the previous estimate is kept.
        if successes.is_empty() {
            return;
        }

        self.avg_speed =
            successes.iter().map(|s| s.speed_mbps).sum::<f64>() / successes.len() as f64;
        self.stability = successes.len() as f64 / self.samples.len() as f64;
    }
}

/// Parameters for the next upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferSettings {
    pub chunk_size: u64,
    pub chunk_timeout: Duration,
    pub chunk_delay: Duration,
    pub destination_delay: Duration,
    pub max_concurrent: usize,
    pub retry_attempts: u32,
}

impl TransferSettings {
    /// Derive settings from average speed (MB/s) and stability.
    pub fn derive(avg_speed: f64, stability: f64) -> Self {
        let (chunk_size, chunk_delay_ms) = if avg_speed > 2.0 && stability > 0.8 {
            (64 * MIB, 0)
        } else if avg_speed > 1.0 && stability > 0.6 {
            (32 * MIB, 25)
        } else if avg_speed < 0.5 || stability < 0.5 {
            (8 * MIB, 100)
        } else {
            (16 * MIB, 100)
        };

        Self {
            chunk_size,
            chunk_timeout: chunk_timeout(chunk_size, avg_speed, stability),
            chunk_delay: Duration::from_millis(chunk_delay_ms),
            destination_delay: Duration::from_millis(if stability > 0.8 { 250 } else { 500 }),
            max_concurrent: if stability > 0.7 { 2 } else { 1 },
            retry_attempts: if stability > 0.6 { 1 } else { 2 },
        }
    }
}

/// Expected transfer time for a chunk, padded by a stability factor and clamped.
fn chunk_timeout(chunk_size: u64, avg_speed: f64, stability: f64) -> Duration {
    let chunk_mb = chunk_size as f64 / MIB as f64;
    let expected_secs = chunk_mb / avg_speed.max(0.1);
    let factor = if stability < 0.6 { 3.0 } else { 2.0 };
    let timeout_ms = (expected_secs * factor * 1000.0)
        .max(MIN_CHUNK_TIMEOUT_MS)
        .min(MAX_CHUNK_TIMEOUT_MS);
    Duration::from_millis(timeout_ms.round() as u64)
}

/// Coarse network quality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn classify(avg_speed: f64, stability: f64) -> Self {
        if avg_speed > 2.0 && stability > 0.8 {
            Self::Excellent
        } else if avg_speed > 1.0 && stability > 0.6 {
            Self::Good
        } else if avg_speed > 0.5 && stability > 0.4 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationCategory {
    Network,
    Stability,
    Performance,
    Analysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

/// Informational advice derived from the profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub category: RecommendationCategory,
    pub priority: RecommendationPriority,
    pub message: String,
}

/// Snapshot of tuner state for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkReport {
    pub avg_speed: f64,
    pub stability: f64,
    pub sample_count: usize,
    pub quality: NetworkQuality,
    pub settings: TransferSettings,
    pub recommendations: Vec<Recommendation>,
}

/// Events emitted by the tuner.
#[derive(Debug, Clone)]
pub enum TunerEvent {
    /// The quality label changed after recording a sample.
    QualityChanged {
        previous: NetworkQuality,
        current: NetworkQuality,
    },
}

/// Process-wide transfer tuner.
pub struct TransferTuner {
    config: TunerConfig,
    profile: RwLock<NetworkProfile>,
    event_tx: broadcast::Sender<TunerEvent>,
}

impl TransferTuner {
    pub fn new(config: TunerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        let profile = NetworkProfile::new(&config);

        Self {
            config,
            profile: RwLock::new(profile),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TunerConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunerEvent> {
        self.event_tx.subscribe()
    }

    /// Fold an upload outcome into the profile.
    pub fn record(&self, sample: UploadSample) {
        let (previous, current, avg_speed, stability) = {
            let mut profile = self.profile.write();
            let previous = NetworkQuality::classify(profile.avg_speed, profile.stability);
            profile.record(sample, self.config.window_size);
            let current = NetworkQuality::classify(profile.avg_speed, profile.stability);
            (previous, current, profile.avg_speed, profile.stability)
        };

        debug!(
            success = sample.success,
            speed = sample.speed_mbps,
            avg_speed,
            stability,
            "Network profile updated"
        );

        if previous != current {
            info!(%previous, %current, "Network quality changed");
            // Ignore errors - just means no subscribers currently
            let _ = self
                .event_tx
                .send(TunerEvent::QualityChanged { previous, current });
        }
    }

    /// Settings for the next upload attempt.
    pub fn settings(&self) -> TransferSettings {
        let profile = self.profile.read();
        TransferSettings::derive(profile.avg_speed, profile.stability)
    }

    /// Delay to wait between two destinations.
    pub fn destination_delay(&self) -> Duration {
        self.settings().destination_delay
    }

    pub fn quality(&self) -> NetworkQuality {
        let profile = self.profile.read();
        NetworkQuality::classify(profile.avg_speed, profile.stability)
    }

    pub fn profile(&self) -> NetworkProfile {
        self.profile.read().clone()
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        let profile = self.profile.read();
        let mut recommendations = Vec::new();

        if profile.avg_speed < 0.5 {
            recommendations.push(Recommendation {
                category: RecommendationCategory::Network,
                priority: RecommendationPriority::High,
                message: "Upload speed is very low. Check the network connection or use smaller files."
                    .to_string(),
            });
        }

        if profile.stability < 0.5 {
            recommendations.push(Recommendation {
                category: RecommendationCategory::Stability,
                priority: RecommendationPriority::High,
                message: "Uploads fail frequently. The connection appears unstable.".to_string(),
            });
        }

        if profile.avg_speed > 0.5 && profile.avg_speed < 1.0 {
            recommendations.push(Recommendation {
                category: RecommendationCategory::Performance,
                priority: RecommendationPriority::Medium,
                message: "Upload speed is moderate. Compressing videos further may help."
                    .to_string(),
            });
        }

        if profile.samples.len() < 3 {
            recommendations.push(Recommendation {
                category: RecommendationCategory::Analysis,
                priority: RecommendationPriority::Low,
                message: "Not enough uploads yet for an accurate network analysis.".to_string(),
            });
        }

        recommendations
    }

    pub fn network_report(&self) -> NetworkReport {
        let (avg_speed, stability, sample_count) = {
            let profile = self.profile.read();
            (profile.avg_speed, profile.stability, profile.samples.len())
        };

        NetworkReport {
            avg_speed,
            stability,
            sample_count,
            quality: NetworkQuality::classify(avg_speed, stability),
            settings: TransferSettings::derive(avg_speed, stability),
            recommendations: self.recommendations(),
        }
    }

    /// Restore the default profile.
    pub fn reset(&self) {
        *self.profile.write() = NetworkProfile::new(&self.config);
        info!("Network profile reset");
    }
}

impl Default for TransferTuner {
    fn default() -> Self {
        Self::with_defaults()
    }
}

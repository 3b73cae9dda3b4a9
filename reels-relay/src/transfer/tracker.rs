//! Per-upload instrumentation and per-destination performance history.
//!
//! - `TransferRecord`: ephemeral phase timings for one (job, destination) upload
//! - `DestinationStats`: rolling aggregate the record is folded into on completion

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::tuner::MIB;

/// Timing of one named phase.
#[derive(Debug, Clone)]
pub struct PhaseTiming {
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub duration: Option<Duration>,
}

/// In-flight upload instrumentation, discarded once folded into the aggregate.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub job_id: String,
    pub destination: String,
    pub size_bytes: u64,
    pub started_at: Instant,
    pub created_at: DateTime<Utc>,
    pub phases: HashMap<String, PhaseTiming>,
}

/// Result of closing a record.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub job_id: String,
    pub destination: String,
    pub size_mb: f64,
    pub total_duration: Duration,
    /// MB/s over the whole record.
    pub speed_mbps: f64,
    pub success: bool,
    pub phases: Vec<(String, Duration)>,
}

/// Historical aggregate for one destination.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestinationStats {
    pub total_uploads: u64,
    pub successful_uploads: u64,
    pub total_size_mb: f64,
    pub total_time_secs: f64,
    pub average_speed_mbps: f64,
    pub fastest: Option<Duration>,
    pub slowest: Option<Duration>,
    pub last_upload: Option<DateTime<Utc>>,
}

impl DestinationStats {
    /// Rounded percentage of successful uploads.
    pub fn success_rate(&self) -> u32 {
        if self.total_uploads == 0 {
            return 0;
        }
        ((self.successful_uploads as f64 / self.total_uploads as f64) * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationReport {
    pub destination: String,
    pub success_rate: u32,
    pub stats: DestinationStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub destinations: Vec<DestinationReport>,
    pub average_speed_mbps: f64,
    pub average_success_rate: f64,
    pub recommendations: Vec<String>,
}

/// Tracks uploads per (job, destination).
pub struct TransferTracker {
    records: DashMap<String, TransferRecord>,
    stats: DashMap<String, DestinationStats>,
}

fn record_key(job_id: &str, destination: &str) -> String {
    format!("{job_id}_{destination}")
}

impl TransferTracker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    /// Open a record for an upload attempt. Replaces any record with the same key.
    pub fn begin(&self, job_id: &str, destination: &str, size_bytes: u64) {
        let record = TransferRecord {
            job_id: job_id.to_string(),
            destination: destination.to_string(),
            size_bytes,
            started_at: Instant::now(),
            created_at: Utc::now(),
            phases: HashMap::new(),
        };
        self.records.insert(record_key(job_id, destination), record);
        debug!(job_id, destination, size_bytes, "Transfer tracking started");
    }

    /// Start timing a phase.
    pub fn phase(&self, job_id: &str, destination: &str, name: &str) {
        let Some(mut record) = self.records.get_mut(&record_key(job_id, destination)) else {
            warn!(job_id, destination, phase = name, "No transfer record for phase");
            return;
        };
        record.phases.insert(
            name.to_string(),
            PhaseTiming {
                started_at: Instant::now(),
                ended_at: None,
                duration: None,
            },
        );
    }

    /// Stop timing a phase, returning its duration.
    pub fn end_phase(&self, job_id: &str, destination: &str, name: &str) -> Option<Duration> {
        let mut record = self.records.get_mut(&record_key(job_id, destination))?;
        let timing = record.phases.get_mut(name)?;
        let now = Instant::now();
        let duration = now.duration_since(timing.started_at);
        timing.ended_at = Some(now);
        timing.duration = Some(duration);

        debug!(job_id, destination, phase = name, ?duration, "Transfer phase completed");
        Some(duration)
    }

    /// Close a record, fold it into the destination aggregate and return its summary.
    pub fn end(&self, job_id: &str, destination: &str, success: bool) -> Option<TransferSummary> {
        let (_, record) = self.records.remove(&record_key(job_id, destination))?;
        let elapsed = record.started_at.elapsed();
        let summary = self.fold(record, elapsed, success);

        info!(
            job_id,
            destination,
            size_mb = summary.size_mb,
            speed_mbps = summary.speed_mbps,
            duration_secs = summary.total_duration.as_secs_f64(),
            success,
            "Upload performance summary"
        );
        Some(summary)
    }

    fn fold(&self, record: TransferRecord, total_duration: Duration, success: bool) -> TransferSummary {
        let size_mb = record.size_bytes as f64 / MIB as f64;
        let secs = total_duration.as_secs_f64();
        let speed_mbps = if secs > 0.0 { size_mb / secs } else { 0.0 };

        let mut stats = self.stats.entry(record.destination.clone()).or_default();
        stats.total_uploads += 1;
        stats.last_upload = Some(Utc::now());
        if success {
            stats.successful_uploads += 1;
            stats.total_size_mb += size_mb;
            stats.total_time_secs += secs;
            if stats.total_time_secs > 0.0 {
                stats.average_speed_mbps = stats.total_size_mb / stats.total_time_secs;
            }
            if speed_mbps > 0.0 {
                stats.fastest = Some(stats.fastest.map_or(total_duration, |d| d.min(total_duration)));
                stats.slowest = Some(stats.slowest.map_or(total_duration, |d| d.max(total_duration)));
            }
        }
        drop(stats);

        let mut phases: Vec<(String, Duration)> = record
            .phases
            .into_iter()
            .map(|(name, timing)| (name, timing.duration.unwrap_or_default()))
            .collect();
        phases.sort_by(|a, b| a.0.cmp(&b.0));

        TransferSummary {
            job_id: record.job_id,
            destination: record.destination,
            size_mb,
            total_duration,
            speed_mbps,
            success,
            phases,
        }
    }

    pub fn destination_report(&self, destination: &str) -> Option<DestinationReport> {
        self.stats.get(destination).map(|stats| DestinationReport {
            destination: destination.to_string(),
            success_rate: stats.success_rate(),
            stats: stats.clone(),
        })
    }

    /// Aggregates for every destination, busiest first, plus threshold-based advice.
    pub fn overall_report(&self) -> PerformanceReport {
        let mut destinations: Vec<DestinationReport> = self
            .stats
            .iter()
            .map(|entry| DestinationReport {
                destination: entry.key().clone(),
                success_rate: entry.success_rate(),
                stats: entry.value().clone(),
            })
            .collect();
        destinations.sort_by(|a, b| b.stats.total_uploads.cmp(&a.stats.total_uploads));

        if destinations.is_empty() {
            return PerformanceReport {
                destinations,
                average_speed_mbps: 0.0,
                average_success_rate: 0.0,
                recommendations: Vec::new(),
            };
        }

        let count = destinations.len() as f64;
        let average_speed_mbps = destinations
            .iter()
            .map(|d| d.stats.average_speed_mbps)
            .sum::<f64>()
            / count;
        let average_success_rate =
            destinations.iter().map(|d| d.success_rate as f64).sum::<f64>() / count;

        let mut recommendations = Vec::new();
        if average_speed_mbps < 0.5 {
            recommendations.push(
                "Upload speed is slow: consider larger chunks or stronger compression.".to_string(),
            );
        }
        if average_success_rate < 90.0 {
            recommendations.push(
                "Success rate is low: check network connectivity and access tokens.".to_string(),
            );
        }
        let slow: Vec<&str> = destinations
            .iter()
            .filter(|d| d.stats.average_speed_mbps < average_speed_mbps * 0.7)
            .map(|d| d.destination.as_str())
            .collect();
        if !slow.is_empty() {
            recommendations.push(format!(
                "Destinations {} are underperforming: check their tokens and permissions.",
                slow.join(", ")
            ));
        }

        PerformanceReport {
            destinations,
            average_speed_mbps,
            average_success_rate,
            recommendations,
        }
    }

    /// Drop records abandoned for longer than `max_age`. Returns the number removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.started_at.elapsed() < max_age);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!(count = removed, "Cleaned up stale transfer records");
        }
        removed
    }

    /// Number of uploads currently being tracked.
    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    pub fn reset(&self) {
        self.records.clear();
        self.stats.clear();
    }
}

impl Default for TransferTracker {
    fn default() -> Self {
        Self::new()
    }
}

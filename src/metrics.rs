// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Load metrics for the model loader.
//!
//! The loader emits two kinds of samples, both namespaced with the label it
//! was configured with:
//!
//! - `{label}.Model.ReadFromCache.Duration` / `{label}.Model.Download.Duration`
//!   once per completed attempt
//! - `{label}.Model.Status` once per completed attempt or terminal decision
//!
//! Emission is fire-and-forget. A sink must never block the driver task.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use crate::locks::{resilient_read, resilient_write};

/// Discrete outcome reported to the `Model.Status` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelStatus {
    /// A model was accepted, from the cache or the network.
    Ok,
    /// The cache file was missing, unreadable or empty.
    FileNotFound,
    /// The cache file had content but the validator rejected it.
    FileInvalid,
    /// The transport reported a failed download.
    DownloadFailed,
    /// The download succeeded but the validator rejected the body.
    DownloadInvalid,
    /// No further download attempts are allowed.
    RetriesExhausted,
    /// An activity pulse arrived before the backoff deadline.
    DownloadThrottled,
    /// The loader was dropped before it finished.
    LoadingAbandoned,
    /// Neither a cache path nor a usable URL was configured.
    NoSource,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::FileNotFound => "file-not-found",
            Self::FileInvalid => "file-invalid",
            Self::DownloadFailed => "download-failed",
            Self::DownloadInvalid => "download-invalid",
            Self::RetriesExhausted => "retries-exhausted",
            Self::DownloadThrottled => "download-throttled",
            Self::LoadingAbandoned => "loading-abandoned",
            Self::NoSource => "no-source",
        }
    }

    /// Statuses produced by a finished cache read.
    pub fn is_file_status(&self) -> bool {
        matches!(self, Self::FileNotFound | Self::FileInvalid)
    }

    /// Statuses produced by a finished download attempt.
    pub fn is_download_status(&self) -> bool {
        matches!(self, Self::DownloadFailed | Self::DownloadInvalid)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric names derived from a loader's label.
#[derive(Debug, Clone)]
pub struct MetricNames {
    pub read_duration: String,
    pub download_duration: String,
    pub status: String,
}

impl MetricNames {
    pub fn new(label: &str) -> Self {
        Self {
            read_duration: format!("{}.Model.ReadFromCache.Duration", label),
            download_duration: format!("{}.Model.Download.Duration", label),
            status: format!("{}.Model.Status", label),
        }
    }
}

/// Destination for loader metrics.
pub trait MetricsSink: Send + Sync {
    fn record_duration(&self, name: &str, duration: Duration);
    fn record_status(&self, name: &str, status: ModelStatus);
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Default sink: every sample becomes a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_duration(&self, name: &str, duration: Duration) {
        tracing::info!(
            target: "ranker_loader::metrics",
            metric = name,
            duration_ms = whole_millis(duration),
        );
    }

    fn record_status(&self, name: &str, status: ModelStatus) {
        tracing::info!(
            target: "ranker_loader::metrics",
            metric = name,
            status = status.as_str(),
        );
    }
}

/// A single recorded sample.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Duration { name: String, duration: Duration },
    Status { name: String, status: ModelStatus },
}

/// Sink that keeps every sample in memory.
///
/// Used by the CLI to print a summary after a load, and by tests to assert
/// exactly which statuses a run produced.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: RwLock<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// All samples in emission order.
    pub fn events(&self) -> Vec<MetricEvent> {
        resilient_read(&self.events).clone()
    }

    /// Every status sample, in emission order.
    pub fn statuses(&self) -> Vec<ModelStatus> {
        resilient_read(&self.events)
            .iter()
            .filter_map(|e| match e {
                MetricEvent::Status { status, .. } => Some(*status),
                MetricEvent::Duration { .. } => None,
            })
            .collect()
    }

    /// Number of duration samples recorded under `name`.
    pub fn duration_count(&self, name: &str) -> usize {
        resilient_read(&self.events)
            .iter()
            .filter(|e| matches!(e, MetricEvent::Duration { name: n, .. } if n == name))
            .count()
    }

    pub fn clear(&self) {
        resilient_write(&self.events).clear();
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_duration(&self, name: &str, duration: Duration) {
        resilient_write(&self.events).push(MetricEvent::Duration {
            name: name.to_string(),
            duration,
        });
    }

    fn record_status(&self, name: &str, status: ModelStatus) {
        resilient_write(&self.events).push(MetricEvent::Status {
            name: name.to_string(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_use_label_prefix() {
        let names = MetricNames::new("Translate");
        assert_eq!(names.read_duration, "Translate.Model.ReadFromCache.Duration");
        assert_eq!(names.download_duration, "Translate.Model.Download.Duration");
        assert_eq!(names.status, "Translate.Model.Status");
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&ModelStatus::RetriesExhausted).unwrap();
        assert_eq!(json, "\"retries-exhausted\"");
        assert_eq!(ModelStatus::FileNotFound.to_string(), "file-not-found");
    }

    #[test]
    fn test_recording_metrics_filters() {
        let metrics = RecordingMetrics::new();
        metrics.record_duration("x.Model.Download.Duration", Duration::from_millis(5));
        metrics.record_status("x.Model.Status", ModelStatus::DownloadFailed);
        metrics.record_status("x.Model.Status", ModelStatus::Ok);

        assert_eq!(metrics.events().len(), 3);
        assert_eq!(
            metrics.statuses(),
            vec![ModelStatus::DownloadFailed, ModelStatus::Ok]
        );
        assert_eq!(metrics.duration_count("x.Model.Download.Duration"), 1);
        assert_eq!(metrics.duration_count("x.Model.ReadFromCache.Duration"), 0);

        metrics.clear();
        assert!(metrics.events().is_empty());
    }

    #[test]
    fn test_whole_millis_saturates() {
        assert_eq!(whole_millis(Duration::from_micros(2_500)), 2);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_status_groups() {
        assert!(ModelStatus::FileInvalid.is_file_status());
        assert!(!ModelStatus::FileInvalid.is_download_status());
        assert!(ModelStatus::DownloadInvalid.is_download_status());
        assert!(!ModelStatus::Ok.is_file_status());
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Types shared by the model loader and its collaborators.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::metrics::ModelStatus;

/// Why a validator refused a byte payload.
///
/// The loader never branches on the variant; it only logs it and moves on
/// to the next source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRejection {
    /// Bytes could not be parsed into a model.
    Parse(String),
    /// Parsed, but structurally unusable (bad checksum, wrong version).
    Incompatible(String),
    /// Parsed and intact, but past its freshness window.
    Expired,
    /// Cached model was downloaded from a different URL than the one configured.
    SourceMismatch { expected: String, found: String },
    /// Validator-specific reason.
    Other(String),
}

impl fmt::Display for ModelRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "failed to parse model: {}", msg),
            Self::Incompatible(msg) => write!(f, "incompatible model: {}", msg),
            Self::Expired => write!(f, "model has expired"),
            Self::SourceMismatch { expected, found } => {
                write!(f, "model source {} does not match {}", found, expected)
            }
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ModelRejection {}

/// Parses and validates raw model bytes. Runs on background tasks.
pub type Validator<M> = Arc<dyn Fn(&[u8]) -> Result<M, ModelRejection> + Send + Sync>;

/// Receives the loader's terminal outcome, exactly once.
pub type OnModelAvailable<M> = Box<dyn FnOnce(LoadOutcome<M>) + Send + 'static>;

/// Where an accepted model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Cache,
    Remote,
}

/// Terminal result handed to the result sink.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome<M> {
    /// A validated model; ownership passes to the sink.
    Loaded { model: M, source: ModelSource },
    /// No model could be obtained.
    Unavailable { status: ModelStatus },
}

impl<M> LoadOutcome<M> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    pub fn source(&self) -> Option<ModelSource> {
        match self {
            Self::Loaded { source, .. } => Some(*source),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn into_model(self) -> Option<M> {
        match self {
            Self::Loaded { model, .. } => Some(model),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Download attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed downloads allowed before the loader gives up for good.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_backoff: Duration,
    /// Upper bound for the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(3 * 60),
            max_backoff: Duration::from_secs(60 * 60),
        }
    }
}

/// Immutable loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub cache_path: Option<PathBuf>,
    pub model_url: Option<Url>,
    /// Prefix for every metric this loader emits.
    pub metrics_label: String,
    pub retry: RetryPolicy,
}

impl LoaderConfig {
    /// Build a config from loosely-typed inputs.
    ///
    /// An empty cache path means "no cache". An empty, relative or non-HTTP
    /// URL means "no remote source".
    pub fn new(
        cache_path: impl Into<PathBuf>,
        model_url: &str,
        metrics_label: impl Into<String>,
    ) -> Self {
        let cache_path = cache_path.into();
        Self {
            cache_path: (!cache_path.as_os_str().is_empty()).then_some(cache_path),
            model_url: parse_model_url(model_url),
            metrics_label: metrics_label.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// True if the loader has at least one place to get a model from.
    pub fn has_source(&self) -> bool {
        self.cache_path.is_some() || self.model_url.is_some()
    }
}

/// Parse `raw` as an absolute http(s) URL, or `None`.
pub fn parse_model_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(url) => {
            tracing::warn!("Ignoring model URL with unsupported scheme: {}", url.scheme());
            None
        }
        Err(e) => {
            tracing::warn!("Ignoring invalid model URL {:?}: {}", raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_empty_inputs_mean_absent() {
        let config = LoaderConfig::new("", "", "Test");
        assert!(config.cache_path.is_none());
        assert!(config.model_url.is_none());
        assert!(!config.has_source());
    }

    #[test]
    fn test_config_rejects_bad_urls() {
        assert!(parse_model_url("not a url").is_none());
        assert!(parse_model_url("/relative/path").is_none());
        assert!(parse_model_url("ftp://example.com/model").is_none());
        assert!(parse_model_url("  https://example.com/m.bin ").is_some());
    }

    #[test]
    fn test_config_with_cache_only() {
        let config = LoaderConfig::new("/tmp/m.bin", "garbage", "Test");
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/m.bin")));
        assert!(config.model_url.is_none());
        assert!(config.has_source());
    }

    #[test]
    fn test_outcome_accessors() {
        let loaded = LoadOutcome::Loaded { model: 7u8, source: ModelSource::Remote };
        assert!(loaded.is_loaded());
        assert_eq!(loaded.source(), Some(ModelSource::Remote));
        assert_eq!(loaded.into_model(), Some(7));

        let failed: LoadOutcome<u8> = LoadOutcome::Unavailable { status: ModelStatus::NoSource };
        assert!(!failed.is_loaded());
        assert_eq!(failed.into_model(), None);
    }

    #[test]
    fn test_rejection_display() {
        let r = ModelRejection::SourceMismatch {
            expected: "https://a/m".into(),
            found: "https://b/m".into(),
        };
        assert_eq!(r.to_string(), "model source https://b/m does not match https://a/m");
        assert_eq!(ModelRejection::Expired.to_string(), "model has expired");
    }
}

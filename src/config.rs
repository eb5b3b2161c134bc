// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent settings for the `ranker-loader` CLI.
//!
//! Settings live in `~/.ranker-loader/config.json`. Every field is optional;
//! missing fields fall back to defaults, and `RANKER_MODEL_URL` overrides the
//! model URL from the file. Command-line flags are applied on top by the
//! binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fetch::DEFAULT_FETCH_TIMEOUT_SECS;
use crate::loader::{LoaderConfig, RetryPolicy};

/// Environment variable overriding `model_url`.
pub const MODEL_URL_ENV: &str = "RANKER_MODEL_URL";

/// Label used for metrics when none is configured.
pub const DEFAULT_METRICS_LABEL: &str = "Ranker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// Remote location of the model.
    pub model_url: Option<String>,
    /// Cache file. `None` uses the default location; an empty path disables caching.
    pub cache_path: Option<PathBuf>,
    pub metrics_label: String,
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            model_url: None,
            cache_path: None,
            metrics_label: DEFAULT_METRICS_LABEL.to_string(),
            max_attempts: retry.max_attempts,
            base_backoff_secs: retry.base_backoff.as_secs(),
            max_backoff_secs: retry.max_backoff.as_secs(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

/// `~/.ranker-loader`
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".ranker-loader"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

impl LoaderSettings {
    /// Load from `path` (or the default location) and apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        let mut settings = Self::load_from(&path)?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Load from `path` only. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {:?}; using defaults", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(MODEL_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.model_url = Some(url);
        }
    }

    /// The cache file this configuration points at, if caching is enabled.
    pub fn resolved_cache_path(&self) -> Option<PathBuf> {
        match &self.cache_path {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path.clone()),
            None => config_dir().ok().map(|dir| {
                dir.join("models")
                    .join(format!("{}.model", self.metrics_label.to_lowercase()))
            }),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_secs(self.base_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs.max(self.base_backoff_secs)),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn to_loader_config(&self) -> LoaderConfig {
        LoaderConfig::new(
            self.resolved_cache_path().unwrap_or_default(),
            self.model_url.as_deref().unwrap_or(""),
            self.metrics_label.clone(),
        )
        .with_retry_policy(self.retry_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = LoaderSettings::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(settings, LoaderSettings::default());
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.base_backoff_secs, 180);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"model_url":"https://m.example/x","max_attempts":5}"#).unwrap();

        let settings = LoaderSettings::load_from(&path).unwrap();
        assert_eq!(settings.model_url.as_deref(), Some("https://m.example/x"));
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.metrics_label, DEFAULT_METRICS_LABEL);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(LoaderSettings::load_from(&path).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("sub").join("config.json");
        let settings = LoaderSettings {
            metrics_label: "Translate".to_string(),
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(LoaderSettings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_env_override() {
        let mut settings = LoaderSettings::default();
        settings.apply_env(|key| (key == MODEL_URL_ENV).then(|| "https://env.example/m".to_string()));
        assert_eq!(settings.model_url.as_deref(), Some("https://env.example/m"));

        settings.apply_env(|_| Some("   ".to_string()));
        assert_eq!(settings.model_url.as_deref(), Some("https://env.example/m"));
    }

    #[test]
    fn test_empty_cache_path_disables_cache() {
        let settings = LoaderSettings {
            cache_path: Some(PathBuf::new()),
            ..Default::default()
        };
        assert_eq!(settings.resolved_cache_path(), None);
        assert!(settings.to_loader_config().cache_path.is_none());
    }

    #[test]
    fn test_to_loader_config() {
        let settings = LoaderSettings {
            model_url: Some("https://m.example/ranker".to_string()),
            cache_path: Some(PathBuf::from("/tmp/ranker.model")),
            max_attempts: 4,
            base_backoff_secs: 10,
            max_backoff_secs: 5,
            ..Default::default()
        };
        let config = settings.to_loader_config();
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/ranker.model")));
        assert_eq!(config.model_url.unwrap().as_str(), "https://m.example/ranker");
        assert_eq!(config.retry.max_attempts, 4);
        // max_backoff never drops below base_backoff
        assert_eq!(config.retry.max_backoff, Duration::from_secs(10));
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! ranker-loader - Resilient ranker model loading
//!
//! Local cache first, remote download when needed.
//!
//! A loader obtains one versioned model through a fallback chain:
//!
//! **Cache file** -> **Remote URL** (retried on activity, with backoff)
//!
//! # Core Modules
//!
//! - [`loader`] - State machine, activity gate and the [`ModelLoader`] itself
//! - [`cache`] - Locked, atomic whole-file cache
//! - [`fetch`] - HTTP transport for model downloads
//! - [`model`] - JSON envelope format with freshness and checksum checks
//! - [`metrics`] - Load duration and status metrics
//! - [`config`] - CLI settings file
//! - [`error`] - User-facing error formatting

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod locks;
pub mod metrics;
pub mod model;

pub use cache::{FileCache, ModelCache};
pub use fetch::{FetchResponse, HttpFetcher, ModelFetcher};
pub use loader::{
    LoadOutcome, LoaderConfig, LoaderState, ModelLoader, ModelRejection, ModelSource,
    RetryPolicy, Validator,
};
pub use metrics::{MetricsSink, ModelStatus, RecordingMetrics, TracingMetrics};
pub use model::RankerModel;

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient model loading.
//!
//! A [`ModelLoader`] obtains exactly one model:
//! - Reads the local cache first
//! - Falls back to the remote URL when the cache is missing, stale or invalid
//! - Retries downloads only on caller activity, within a fixed budget
//! - Persists a fresh download back to the cache
//! - Reports the outcome exactly once
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ notify   ┌─────────────────┐ spawn  ┌─────────────────┐
//! │ ModelLoader     │─────────▶│ Driver task     │───────▶│ Cache read /    │
//! │ (handle)        │◀─────────│ (state machine) │◀───────│ download task   │
//! └─────────────────┘  watch   └────────┬────────┘  weak  └─────────────────┘
//!                                       │             mpsc
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │ Result sink     │
//!                              │ (called once)   │
//!                              └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use ranker_loader::loader::{LoaderConfig, ModelLoader};
//! use ranker_loader::model::RankerModel;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = LoaderConfig::new(
//!     "/var/cache/app/translate.model",
//!     "https://example.com/models/translate.model",
//!     "Translate",
//! );
//! let validator = RankerModel::validator(config.model_url.clone());
//!
//! let loader = ModelLoader::builder(config).start(
//!     validator,
//!     Box::new(|outcome| println!("model available: {}", outcome.is_loaded())),
//! )?;
//!
//! // Whenever the ranked feature is used:
//! loader.notify_activity();
//!
//! loader.wait_finished().await;
//! # Ok(())
//! # }
//! ```

pub mod gate;
pub mod manager;
pub mod state;
pub mod types;

pub use gate::{ActivityGate, GateDecision};
pub use manager::{ModelLoader, ModelLoaderBuilder};
pub use state::{IllegalTransition, LoaderEvent, LoaderState};
pub use types::{
    parse_model_url, LoadOutcome, LoaderConfig, ModelRejection, ModelSource, OnModelAvailable,
    RetryPolicy, Validator,
};

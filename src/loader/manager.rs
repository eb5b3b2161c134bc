// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The model loader and its driver task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{FileCache, ModelCache};
use crate::fetch::{HttpFetcher, ModelFetcher, DEFAULT_FETCH_TIMEOUT_SECS};
use crate::metrics::{MetricNames, MetricsSink, ModelStatus, TracingMetrics};
use super::gate::ActivityGate;
use super::state::{LoaderEvent, LoaderState};
use super::types::{
    LoadOutcome, LoaderConfig, ModelRejection, ModelSource, OnModelAvailable, Validator,
};

/// Validator verdict on one batch of bytes.
enum Checked<M> {
    /// Nothing usable was read (I/O error, empty file, transport failure).
    Missing(String),
    Rejected(ModelRejection),
    Accepted(M),
}

fn check<M>(validator: &Validator<M>, bytes: &[u8]) -> Checked<M> {
    match validator(bytes) {
        Ok(model) => Checked::Accepted(model),
        Err(rejection) => Checked::Rejected(rejection),
    }
}

/// Results handed from background tasks back to the driver.
enum Completion<M> {
    FileLoaded(Checked<M>),
    UrlFetched { checked: Checked<M>, bytes: Vec<u8> },
}

/// The single in-flight background operation.
struct PendingOperation {
    source: ModelSource,
    handle: JoinHandle<()>,
}

/// Activity pulses shared between the handle and the driver.
///
/// The counter is the source of truth; `Notify` only wakes the driver. A
/// wake-up whose count the driver has already seen is ignored.
#[derive(Default)]
struct ActivitySignal {
    pulses: AtomicU64,
    notify: Notify,
}

impl ActivitySignal {
    fn pulse(&self) {
        self.pulses.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn count(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }
}

/// Remote half of the configuration, present only with a usable URL.
struct RemoteSource {
    url: Url,
    fetcher: Arc<dyn ModelFetcher>,
}

/// Configures and starts a [`ModelLoader`].
pub struct ModelLoaderBuilder {
    config: LoaderConfig,
    fetcher: Option<Arc<dyn ModelFetcher>>,
    cache: Arc<dyn ModelCache>,
    metrics: Arc<dyn MetricsSink>,
}

impl ModelLoaderBuilder {
    /// Transport for downloads. Defaults to an [`HttpFetcher`].
    pub fn fetcher(mut self, fetcher: Arc<dyn ModelFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Cache backend. Defaults to [`FileCache`].
    pub fn cache(mut self, cache: Arc<dyn ModelCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Metrics destination. Defaults to [`TracingMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Decide the first transition and kick off background work.
    ///
    /// Never blocks and performs no I/O. If the configuration has neither a
    /// cache path nor a usable URL, `on_model_available` runs before this
    /// returns. Otherwise a tokio runtime must be current; without one an
    /// error is returned and `on_model_available` is dropped uncalled.
    pub fn start<M: Send + 'static>(
        self,
        validator: Validator<M>,
        on_model_available: OnModelAvailable<M>,
    ) -> Result<ModelLoader> {
        let ModelLoaderBuilder {
            config,
            fetcher,
            cache,
            metrics,
        } = self;
        let names = MetricNames::new(&config.metrics_label);
        let label = config.metrics_label.clone();

        let first = LoaderState::NotStarted.next(&LoaderEvent::Start {
            has_cache: config.cache_path.is_some(),
            has_url: config.model_url.is_some(),
        })?;

        if first.is_terminal() {
            tracing::info!("[{}] No cache path or model URL configured; nothing to load", label);
            metrics.record_status(&names.status, ModelStatus::NoSource);
            on_model_available(LoadOutcome::Unavailable {
                status: ModelStatus::NoSource,
            });
            let (_state_tx, state_rx) = watch::channel(first);
            return Ok(ModelLoader {
                label,
                activity: Arc::new(ActivitySignal::default()),
                state_rx,
                _shutdown_tx: None,
            });
        }

        let runtime = Handle::try_current()
            .context("ModelLoader needs a tokio runtime to schedule background loads")?;

        let remote = match config.model_url.clone() {
            Some(url) => {
                let fetcher = match fetcher {
                    Some(fetcher) => fetcher,
                    None => Arc::new(HttpFetcher::new(Duration::from_secs(
                        DEFAULT_FETCH_TIMEOUT_SECS,
                    ))?),
                };
                Some(RemoteSource { url, fetcher })
            }
            None => None,
        };

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LoaderState::NotStarted);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let activity = Arc::new(ActivitySignal::default());
        let now = Instant::now();

        let mut driver = Driver {
            label: label.clone(),
            state: LoaderState::NotStarted,
            gate: ActivityGate::new(config.retry, now),
            cache_path: config.cache_path,
            remote,
            validator,
            sink: Some(on_model_available),
            cache,
            metrics,
            names,
            completion_tx,
            pending: None,
            load_started_at: now,
            state_tx,
            activity: Arc::clone(&activity),
            pulses_seen: 0,
            runtime: runtime.clone(),
        };

        driver.transition(first);
        match first {
            LoaderState::LoadingFromFile => driver.start_load_from_file(),
            LoaderState::LoadingFromUrl => driver.start_load_from_url(),
            _ => {}
        }

        runtime.spawn(driver.run(completion_rx, shutdown_rx));

        Ok(ModelLoader {
            label,
            activity,
            state_rx,
            _shutdown_tx: Some(shutdown_tx),
        })
    }
}

/// Loads one model from a local cache, falling back to a remote URL.
///
/// All state lives on a driver task; this handle only signals activity and
/// observes state. Dropping it cancels any in-flight work and guarantees the
/// result sink will not run afterwards.
pub struct ModelLoader {
    label: String,
    activity: Arc<ActivitySignal>,
    state_rx: watch::Receiver<LoaderState>,
    /// Dropping this tells the driver to shut down.
    _shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ModelLoader {
    pub fn builder(config: LoaderConfig) -> ModelLoaderBuilder {
        ModelLoaderBuilder {
            config,
            fetcher: None,
            cache: Arc::new(FileCache::new()),
            metrics: Arc::new(TracingMetrics),
        }
    }

    /// Signal that the ranked feature is in use.
    ///
    /// If a download is pending this may start one, subject to the retry
    /// budget and backoff deadline. Pulses are coalesced: any number of calls
    /// before the driver wakes count as one. Pulses that arrive while a load
    /// is in flight are discarded once the loader goes idle.
    pub fn notify_activity(&self) {
        if !self.state_rx.borrow().is_terminal() {
            self.activity.pulse();
        }
    }

    pub fn state(&self) -> LoaderState {
        *self.state_rx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<LoaderState> {
        self.state_rx.clone()
    }

    /// Resolve once the loader reaches `Finished`.
    pub async fn wait_finished(&self) -> LoaderState {
        let mut rx = self.state_rx.clone();
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|s| *s);
        match result {
            Ok(state) => state,
            // Driver gone
            Err(_) => *rx.borrow(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for ModelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLoader")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns the state machine. Every transition happens on this task.
struct Driver<M> {
    label: String,
    state: LoaderState,
    gate: ActivityGate,
    cache_path: Option<PathBuf>,
    remote: Option<RemoteSource>,
    validator: Validator<M>,
    sink: Option<OnModelAvailable<M>>,
    cache: Arc<dyn ModelCache>,
    metrics: Arc<dyn MetricsSink>,
    names: MetricNames,
    /// The only strong sender. Background tasks hold weak ones.
    completion_tx: mpsc::UnboundedSender<Completion<M>>,
    pending: Option<PendingOperation>,
    load_started_at: Instant,
    state_tx: watch::Sender<LoaderState>,
    activity: Arc<ActivitySignal>,
    /// Pulse count already consumed or discarded.
    pulses_seen: u64,
    runtime: Handle,
}

impl<M: Send + 'static> Driver<M> {
    async fn run(
        mut self,
        mut completions: mpsc::UnboundedReceiver<Completion<M>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let activity = Arc::clone(&self.activity);
        while !self.state.is_terminal() {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.abandon();
                    return;
                }
                Some(completion) = completions.recv() => {
                    self.pending = None;
                    match completion {
                        Completion::FileLoaded(checked) => self.on_file_loaded(checked),
                        Completion::UrlFetched { checked, bytes } => self.on_url_fetched(checked, bytes),
                    }
                }
                _ = activity.notify.notified() => {
                    let pulses = activity.count();
                    if pulses != self.pulses_seen {
                        self.pulses_seen = pulses;
                        self.on_activity();
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: LoaderState) {
        if next != self.state {
            tracing::debug!("[{}] Loader state {} -> {}", self.label, self.state, next);
            if next == LoaderState::Idle {
                // Only pulses sent after Idle is published may start a download.
                self.pulses_seen = self.activity.count();
            }
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    fn report_status(&self, status: ModelStatus) {
        self.metrics.record_status(&self.names.status, status);
    }

    fn finish(&mut self, outcome: LoadOutcome<M>) {
        self.transition(LoaderState::Finished);
        match &outcome {
            LoadOutcome::Loaded { source, .. } => {
                tracing::info!("[{}] Model loaded from {:?}", self.label, source)
            }
            LoadOutcome::Unavailable { status } => {
                tracing::info!("[{}] Giving up on model: {}", self.label, status)
            }
        }
        if let Some(sink) = self.sink.take() {
            sink(outcome);
        }
    }

    fn abandon(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!("[{}] Cancelling in-flight {:?} load", self.label, pending.source);
            pending.handle.abort();
        }
        if !self.state.is_terminal() {
            tracing::info!("[{}] Loader dropped in state {}", self.label, self.state);
            self.report_status(ModelStatus::LoadingAbandoned);
        }
    }

    fn start_load_from_file(&mut self) {
        let Some(path) = self.cache_path.clone() else {
            return;
        };
        debug_assert!(self.pending.is_none(), "a background load is already in flight");

        tracing::debug!("[{}] Reading cached model from {:?}", self.label, path);
        self.load_started_at = Instant::now();
        let cache = Arc::clone(&self.cache);
        let validator = Arc::clone(&self.validator);
        let completion_tx = self.completion_tx.downgrade();

        let handle = self.runtime.spawn(async move {
            let checked = match cache.read(&path).await {
                Ok(bytes) if bytes.is_empty() => Checked::Missing("cache file is empty".to_string()),
                Ok(bytes) => check(&validator, &bytes),
                Err(e) => Checked::Missing(e.to_string()),
            };
            if let Some(tx) = completion_tx.upgrade() {
                let _ = tx.send(Completion::FileLoaded(checked));
            }
        });
        self.pending = Some(PendingOperation {
            source: ModelSource::Cache,
            handle,
        });
    }

    fn start_load_from_url(&mut self) {
        let Some(remote) = &self.remote else {
            return;
        };
        debug_assert!(self.pending.is_none(), "a background load is already in flight");

        tracing::debug!(
            "[{}] Downloading model from {} (attempt {})",
            self.label,
            remote.url,
            self.gate.attempts_made() + 1
        );
        self.load_started_at = Instant::now();
        let url = remote.url.clone();
        let fetcher = Arc::clone(&remote.fetcher);
        let validator = Arc::clone(&self.validator);
        let completion_tx = self.completion_tx.downgrade();

        let handle = self.runtime.spawn(async move {
            let response = fetcher.fetch(&url).await;
            let checked = if response.success {
                check(&validator, &response.body)
            } else {
                Checked::Missing(
                    response
                        .error
                        .unwrap_or_else(|| "fetcher reported failure".to_string()),
                )
            };
            if let Some(tx) = completion_tx.upgrade() {
                let _ = tx.send(Completion::UrlFetched {
                    checked,
                    bytes: response.body,
                });
            }
        });
        self.pending = Some(PendingOperation {
            source: ModelSource::Remote,
            handle,
        });
    }

    fn on_activity(&mut self) {
        let decision = self.gate.check(Instant::now());
        let event = LoaderEvent::Activity {
            has_url: self.remote.is_some(),
            gate: decision,
        };
        let next = match self.state.next(&event) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!("[{}] {}", self.label, e);
                return;
            }
        };

        match (self.state, next) {
            (LoaderState::Idle, LoaderState::LoadingFromUrl) => {
                self.transition(next);
                self.start_load_from_url();
            }
            (LoaderState::Idle, LoaderState::Idle) => {
                tracing::debug!("[{}] Download throttled until backoff deadline", self.label);
                self.report_status(ModelStatus::DownloadThrottled);
            }
            (LoaderState::Idle, LoaderState::Finished) => {
                self.report_status(ModelStatus::RetriesExhausted);
                self.finish(LoadOutcome::Unavailable {
                    status: ModelStatus::RetriesExhausted,
                });
            }
            _ => {}
        }
    }

    fn on_file_loaded(&mut self, checked: Checked<M>) {
        let accepted = matches!(checked, Checked::Accepted(_));
        let next = match self.state.next(&LoaderEvent::FileLoaded { accepted }) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!("[{}] {}", self.label, e);
                return;
            }
        };
        self.metrics
            .record_duration(&self.names.read_duration, self.load_started_at.elapsed());

        match checked {
            Checked::Accepted(model) => {
                self.report_status(ModelStatus::Ok);
                self.finish(LoadOutcome::Loaded {
                    model,
                    source: ModelSource::Cache,
                });
            }
            Checked::Missing(reason) => {
                tracing::debug!("[{}] No cached model: {}", self.label, reason);
                self.report_status(ModelStatus::FileNotFound);
                self.transition(next);
            }
            Checked::Rejected(rejection) => {
                tracing::info!("[{}] Cached model rejected: {}", self.label, rejection);
                self.report_status(ModelStatus::FileInvalid);
                self.transition(next);
            }
        }
    }

    fn on_url_fetched(&mut self, checked: Checked<M>, bytes: Vec<u8>) {
        let accepted = matches!(checked, Checked::Accepted(_));
        let exhausted = !accepted && self.gate.remaining_attempts() <= 1;
        let next = match self
            .state
            .next(&LoaderEvent::UrlFetched { accepted, exhausted })
        {
            Ok(next) => next,
            Err(e) => {
                tracing::error!("[{}] {}", self.label, e);
                return;
            }
        };
        self.metrics
            .record_duration(&self.names.download_duration, self.load_started_at.elapsed());

        let status = match checked {
            Checked::Accepted(model) => {
                self.report_status(ModelStatus::Ok);
                self.persist(bytes);
                self.finish(LoadOutcome::Loaded {
                    model,
                    source: ModelSource::Remote,
                });
                return;
            }
            Checked::Missing(reason) => {
                tracing::info!("[{}] Model download failed: {}", self.label, reason);
                ModelStatus::DownloadFailed
            }
            Checked::Rejected(rejection) => {
                tracing::info!("[{}] Downloaded model rejected: {}", self.label, rejection);
                ModelStatus::DownloadInvalid
            }
        };

        self.report_status(status);
        self.gate.record_failure(Instant::now());

        if next.is_terminal() {
            self.report_status(ModelStatus::RetriesExhausted);
            self.finish(LoadOutcome::Unavailable {
                status: ModelStatus::RetriesExhausted,
            });
        } else {
            tracing::debug!(
                "[{}] {} download attempt(s) left; next no sooner than {:?}",
                self.label,
                self.gate.remaining_attempts(),
                self.gate
                    .next_earliest_attempt()
                    .saturating_duration_since(Instant::now())
            );
            self.transition(next);
        }
    }

    /// Write a freshly downloaded model to the cache. Failures are logged only.
    fn persist(&self, bytes: Vec<u8>) {
        let Some(path) = self.cache_path.clone() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        let label = self.label.clone();
        self.runtime.spawn(async move {
            match cache.write(&path, bytes).await {
                Ok(()) => tracing::debug!("[{}] Cached model at {:?}", label, path),
                Err(e) => tracing::warn!("[{}] Failed to cache model at {:?}: {:#}", label, path, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_validator() -> Validator<usize> {
        Arc::new(|bytes: &[u8]| {
            if bytes.starts_with(b"ok") {
                Ok(bytes.len())
            } else {
                Err(ModelRejection::Other("bad prefix".to_string()))
            }
        })
    }

    #[test]
    fn test_check_maps_validator_result() {
        let validator = length_validator();
        assert!(matches!(check(&validator, b"ok-123"), Checked::Accepted(6)));
        assert!(matches!(check(&validator, b"nope"), Checked::Rejected(_)));
    }

    #[test]
    fn test_start_without_sources_needs_no_runtime() {
        let delivered = Arc::new(std::sync::Mutex::new(None));
        let delivered_clone = Arc::clone(&delivered);

        let loader = ModelLoader::builder(LoaderConfig::new("", "", "Unit"))
            .start(
                length_validator(),
                Box::new(move |outcome| {
                    *delivered_clone.lock().unwrap() = Some(outcome);
                }),
            )
            .expect("no runtime is required when there is nothing to load");

        assert!(loader.is_finished());
        assert_eq!(
            delivered.lock().unwrap().take(),
            Some(LoadOutcome::Unavailable { status: ModelStatus::NoSource })
        );
    }

    #[test]
    fn test_start_with_source_outside_runtime_fails() {
        let result = ModelLoader::builder(LoaderConfig::new("/tmp/unit.model", "", "Unit"))
            .start(length_validator(), Box::new(|_| {}));
        assert!(result.is_err());
    }
}

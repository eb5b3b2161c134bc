// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Loader lifecycle state machine.
//!
//! ```text
//!                 ┌──────────────────┐   accepted
//!  NotStarted ───▶│ LoadingFromFile  │──────────────────────┐
//!      │          └────────┬─────────┘                      │
//!      │ no cache          │ missing / rejected             ▼
//!      │                   ▼                           ┌──────────┐
//!      │              ┌─────────┐  exhausted / no url  │ Finished │
//!      │              │  Idle   │─────────────────────▶└──────────┘
//!      │              └─┬────▲──┘                           ▲
//!      │   pulse + gate │    │ failed, budget left          │
//!      ▼                ▼    │                              │
//!  ┌────────────────────────┴┐  accepted / exhausted        │
//!  │     LoadingFromUrl      │──────────────────────────────┘
//!  └─────────────────────────┘
//! ```
//!
//! Transitions are a pure function of `(state, event)`. The loader applies
//! the returned state and performs whatever side effect entering it implies.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::gate::GateDecision;

/// Current lifecycle state of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderState {
    /// Newly created; nothing scheduled yet.
    NotStarted,
    /// A cache read is in flight.
    LoadingFromFile,
    /// Nothing in flight; waiting for an activity pulse.
    Idle,
    /// A download is in flight.
    LoadingFromUrl,
    /// Terminal. The result sink has run.
    Finished,
}

impl LoaderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::LoadingFromFile => "loading_from_file",
            Self::Idle => "idle",
            Self::LoadingFromUrl => "loading_from_url",
            Self::Finished => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// True while a background operation is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::LoadingFromFile | Self::LoadingFromUrl)
    }

    /// Compute the state that follows `event`.
    ///
    /// Activity pulses are legal everywhere and are no-ops outside `Idle`.
    /// Completions are only legal in the matching loading state.
    pub fn next(self, event: &LoaderEvent) -> Result<LoaderState, IllegalTransition> {
        use LoaderEvent::*;
        use LoaderState::*;

        match (self, event) {
            (NotStarted, Start { has_cache: true, .. }) => Ok(LoadingFromFile),
            (NotStarted, Start { has_url: true, .. }) => Ok(LoadingFromUrl),
            (NotStarted, Start { .. }) => Ok(Finished),

            (LoadingFromFile, FileLoaded { accepted: true }) => Ok(Finished),
            (LoadingFromFile, FileLoaded { accepted: false }) => Ok(Idle),

            (Idle, Activity { has_url: false, .. }) => Ok(Finished),
            (Idle, Activity { gate: GateDecision::Exhausted, .. }) => Ok(Finished),
            (Idle, Activity { gate: GateDecision::Throttled, .. }) => Ok(Idle),
            (Idle, Activity { gate: GateDecision::Attempt, .. }) => Ok(LoadingFromUrl),
            (state, Activity { .. }) => Ok(state),

            (LoadingFromUrl, UrlFetched { accepted: true, .. }) => Ok(Finished),
            (LoadingFromUrl, UrlFetched { exhausted: true, .. }) => Ok(Finished),
            (LoadingFromUrl, UrlFetched { .. }) => Ok(Idle),

            (from, event) => Err(IllegalTransition {
                from,
                event: event.name(),
            }),
        }
    }
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderEvent {
    /// Construction decided which source to try first.
    Start { has_cache: bool, has_url: bool },
    /// The cache read finished.
    FileLoaded { accepted: bool },
    /// The caller signalled activity.
    Activity { has_url: bool, gate: GateDecision },
    /// A download finished. `exhausted` is true if this failure used up the
    /// last allowed attempt.
    UrlFetched { accepted: bool, exhausted: bool },
}

impl LoaderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::FileLoaded { .. } => "file_loaded",
            Self::Activity { .. } => "activity",
            Self::UrlFetched { .. } => "url_fetched",
        }
    }
}

/// An event arrived in a state that cannot handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: LoaderState,
    pub event: &'static str,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal loader transition: {} in state {}", self.event, self.from)
    }
}

impl std::error::Error for IllegalTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use LoaderEvent::*;
    use LoaderState::*;

    const ALL_STATES: [LoaderState; 5] = [NotStarted, LoadingFromFile, Idle, LoadingFromUrl, Finished];

    fn start(has_cache: bool, has_url: bool) -> LoaderEvent {
        Start { has_cache, has_url }
    }

    fn pulse(gate: GateDecision) -> LoaderEvent {
        Activity { has_url: true, gate }
    }

    #[test]
    fn test_start_prefers_cache_then_url() {
        assert_eq!(NotStarted.next(&start(true, true)), Ok(LoadingFromFile));
        assert_eq!(NotStarted.next(&start(true, false)), Ok(LoadingFromFile));
        assert_eq!(NotStarted.next(&start(false, true)), Ok(LoadingFromUrl));
        assert_eq!(NotStarted.next(&start(false, false)), Ok(Finished));
    }

    #[test]
    fn test_file_loaded() {
        assert_eq!(LoadingFromFile.next(&FileLoaded { accepted: true }), Ok(Finished));
        assert_eq!(LoadingFromFile.next(&FileLoaded { accepted: false }), Ok(Idle));
    }

    #[test]
    fn test_activity_in_idle() {
        assert_eq!(Idle.next(&pulse(GateDecision::Attempt)), Ok(LoadingFromUrl));
        assert_eq!(Idle.next(&pulse(GateDecision::Throttled)), Ok(Idle));
        assert_eq!(Idle.next(&pulse(GateDecision::Exhausted)), Ok(Finished));
        assert_eq!(
            Idle.next(&Activity { has_url: false, gate: GateDecision::Attempt }),
            Ok(Finished)
        );
    }

    #[test]
    fn test_activity_is_noop_outside_idle() {
        for state in [NotStarted, LoadingFromFile, LoadingFromUrl, Finished] {
            for gate in [GateDecision::Attempt, GateDecision::Throttled, GateDecision::Exhausted] {
                assert_eq!(state.next(&pulse(gate)), Ok(state));
            }
        }
    }

    #[test]
    fn test_url_fetched() {
        let ok = UrlFetched { accepted: true, exhausted: false };
        let retry = UrlFetched { accepted: false, exhausted: false };
        let give_up = UrlFetched { accepted: false, exhausted: true };
        assert_eq!(LoadingFromUrl.next(&ok), Ok(Finished));
        assert_eq!(LoadingFromUrl.next(&retry), Ok(Idle));
        assert_eq!(LoadingFromUrl.next(&give_up), Ok(Finished));
    }

    #[test]
    fn test_completions_outside_their_state_are_illegal() {
        for state in ALL_STATES {
            if state != LoadingFromFile {
                let err = state.next(&FileLoaded { accepted: true }).unwrap_err();
                assert_eq!(err.from, state);
                assert_eq!(err.event, "file_loaded");
            }
            if state != LoadingFromUrl {
                assert!(state.next(&UrlFetched { accepted: true, exhausted: false }).is_err());
            }
            if state != NotStarted {
                assert!(state.next(&start(true, true)).is_err());
            }
        }
    }

    #[test]
    fn test_finished_is_absorbing() {
        assert!(Finished.is_terminal());
        assert!(!Finished.is_loading());
        assert_eq!(Finished.next(&pulse(GateDecision::Attempt)), Ok(Finished));
    }

    #[test]
    fn test_display() {
        assert_eq!(LoadingFromUrl.to_string(), "loading_from_url");
        assert_eq!(
            IllegalTransition { from: Idle, event: "file_loaded" }.to_string(),
            "illegal loader transition: file_loaded in state idle"
        );
    }
}

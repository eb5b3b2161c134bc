// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing error messages for the CLI.
//!
//! The loader never returns errors for load failures; it reports a
//! [`ModelStatus`] through its result sink. This module turns those statuses
//! (and the few genuine errors the CLI can hit) into messages with likely
//! causes and concrete next steps.

use std::fmt;
use std::path::Path;

use crate::metrics::ModelStatus;

/// Footer appended to every formatted error.
pub const VERBOSE_HINT: &str = "Re-run with --verbose to see the full load trace.";

/// Format an error with title, causes, and fixes.
///
/// # Example
///
/// ```
/// use ranker_loader::error::format_error;
///
/// let error = format_error(
///     "Model download failed",
///     &["Model server unreachable"],
///     &["Check the URL: ranker-loader config show"],
/// );
/// assert!(error.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n\n", title);

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(VERBOSE_HINT);
    output
}

/// Builder for [`format_error`] messages with owned parts.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(String::as_str).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(String::as_str).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

/// Explain why a load finished without a model.
pub fn unavailable_message(status: ModelStatus, cache_path: Option<&Path>) -> ErrorBuilder {
    let builder = ErrorBuilder::new(format!("No ranker model available ({})", status));
    match status {
        ModelStatus::NoSource => builder
            .cause("No cache path and no usable model URL were configured")
            .fix("Pass --url https://... or set model_url in the config file")
            .fix("Inspect the active settings: ranker-loader config show"),
        ModelStatus::RetriesExhausted => {
            let builder = builder
                .cause("The model server was unreachable for every allowed attempt")
                .cause("The server returned a model the validator rejected")
                .fix("Check the URL responds: curl -I <model url>")
                .fix("Raise the attempt budget with --max-attempts");
            match cache_path {
                Some(path) => builder.fix(format!(
                    "Inspect the cached copy: ranker-loader inspect {}",
                    path.display()
                )),
                None => builder,
            }
        }
        ModelStatus::LoadingAbandoned => builder
            .cause("The loader was stopped before it finished")
            .fix("Increase --pulses or --pulse-interval-ms"),
        _ => builder.cause(format!("Loader stopped with status {}", status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error() {
        let error = format_error("Test Error", &["Cause 1", "Cause 2"], &["Fix 1", "Fix 2"]);

        assert!(error.starts_with("[✗] Test Error"));
        assert!(error.contains("  - Cause 2"));
        assert!(error.contains("  2. Fix 2"));
        assert!(error.ends_with(VERBOSE_HINT));
    }

    #[test]
    fn test_empty_causes_and_fixes() {
        let error = format_error("Empty test", &[], &[]);
        assert!(!error.contains("Possible causes:"));
        assert!(!error.contains("Try these fixes:"));
    }

    #[test]
    fn test_builder_display_matches_build() {
        let builder = ErrorBuilder::new("Display test").cause("Cause").fix("Fix");
        assert_eq!(builder.to_string(), builder.build());
    }

    #[test]
    fn test_unavailable_message_mentions_cache_path() {
        let message = unavailable_message(
            ModelStatus::RetriesExhausted,
            Some(Path::new("/tmp/translate.model")),
        )
        .build();
        assert!(message.contains("retries-exhausted"));
        assert!(message.contains("ranker-loader inspect /tmp/translate.model"));

        let no_source = unavailable_message(ModelStatus::NoSource, None).build();
        assert!(no_source.contains("--url"));
    }
}

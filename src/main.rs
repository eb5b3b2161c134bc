// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::oneshot;

use ranker_loader::cache::FileCache;
use ranker_loader::config::{default_config_path, LoaderSettings};
use ranker_loader::error::{unavailable_message, ErrorBuilder};
use ranker_loader::fetch::HttpFetcher;
use ranker_loader::loader::{LoadOutcome, ModelLoader};
use ranker_loader::metrics::{MetricEvent, ModelStatus, RecordingMetrics};
use ranker_loader::model::RankerModel;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - a model is available
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Data error - cached model is malformed or stale
    pub const DATA_ERR: i32 = 65;
    /// Temporary failure - no model yet, try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
mod spinner {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// Create a spinner, or a hidden one in quiet mode.
    pub fn create(message: &str, quiet: bool) -> ProgressBar {
        if quiet {
            return ProgressBar::hidden();
        }
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
            .template("{spinner:.cyan} {msg}")
        {
            spinner.set_style(style);
        }
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    }
}

/// ranker-loader - Resilient ranker model loading.
#[derive(Parser)]
#[command(name = "ranker-loader")]
#[command(version = VERSION)]
#[command(about = "Load a ranker model from the local cache, downloading it when needed.")]
#[command(long_about = "ranker-loader - Resilient ranker model loading\n\n\
    Load a model:        ranker-loader load --url https://example.com/ranker.model\n\
    Inspect the cache:   ranker-loader inspect ~/.ranker-loader/models/ranker.model\n\
    Clear the cache:     ranker-loader clear\n\
    Show settings:       ranker-loader config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to ~/.ranker-loader/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode: errors only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: log every state transition and metric
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the model, pulsing activity until it is available or pulses run out
    ///
    /// Examples:
    ///   ranker-loader load --url https://example.com/ranker.model
    ///   ranker-loader load --cache ./ranker.model --pulses 20 --pulse-interval-ms 500
    Load {
        /// Remote model URL
        #[arg(short, long)]
        url: Option<String>,
        /// Cache file path
        #[arg(short, long)]
        cache: Option<PathBuf>,
        /// Skip the cache entirely
        #[arg(long, conflicts_with = "cache")]
        no_cache: bool,
        /// Metric label
        #[arg(short, long)]
        label: Option<String>,
        /// Download attempts before giving up
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Delay after the first failed download, doubled on each further failure
        #[arg(long)]
        base_backoff_secs: Option<u64>,
        /// Activity pulses to send before abandoning the load
        #[arg(long, default_value_t = 30)]
        pulses: u32,
        /// Milliseconds between activity pulses
        #[arg(long, default_value_t = 1000)]
        pulse_interval_ms: u64,
        /// Print every recorded metric after the load
        #[arg(long)]
        metrics: bool,
    },

    /// Show metadata and freshness of a cached model
    Inspect {
        /// Cache file (defaults to the configured cache path)
        path: Option<PathBuf>,
    },

    /// Delete the cached model
    Clear {
        /// Cache file (defaults to the configured cache path)
        path: Option<PathBuf>,
    },

    /// Manage settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective settings
    Show,
    /// Write the effective settings to the settings file
    Init,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else if quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let settings = match LoaderSettings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!(
                "{}",
                ErrorBuilder::new("Failed to load settings")
                    .cause(format!("{:#}", e))
                    .fix("Fix or delete the settings file")
                    .fix("Recreate it: ranker-loader config init")
            );
            process::exit(CONFIG);
        }
    };

    let code = match run(cli, settings).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            ERROR
        }
    };
    process::exit(code);
}

async fn run(cli: Cli, mut settings: LoaderSettings) -> Result<i32> {
    match cli.command {
        Commands::Load {
            url,
            cache,
            no_cache,
            label,
            max_attempts,
            base_backoff_secs,
            pulses,
            pulse_interval_ms,
            metrics,
        } => {
            if let Some(url) = url {
                settings.model_url = Some(url);
            }
            if no_cache {
                settings.cache_path = Some(PathBuf::new());
            } else if let Some(cache) = cache {
                settings.cache_path = Some(cache);
            }
            if let Some(label) = label {
                settings.metrics_label = label;
            }
            if let Some(max_attempts) = max_attempts {
                settings.max_attempts = max_attempts;
            }
            if let Some(secs) = base_backoff_secs {
                settings.base_backoff_secs = secs;
            }
            let opts = LoadOptions {
                pulses,
                pulse_interval: Duration::from_millis(pulse_interval_ms.max(1)),
                print_metrics: metrics || cli.verbose,
                quiet: cli.quiet,
            };
            load(&settings, opts).await
        }
        Commands::Inspect { path } => {
            let path = path
                .or_else(|| settings.resolved_cache_path())
                .context("No cache path configured")?;
            inspect(&path)
        }
        Commands::Clear { path } => {
            let path = path
                .or_else(|| settings.resolved_cache_path())
                .context("No cache path configured")?;
            if FileCache::remove(&path)? {
                println!("{} Removed {}", "[OK]".green(), path.display());
            } else {
                println!("{} Nothing cached at {}", "[!]".yellow(), path.display());
            }
            Ok(SUCCESS)
        }
        Commands::Config { command } => {
            match command {
                ConfigCommands::Show => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                    match settings.resolved_cache_path() {
                        Some(path) => println!("\nCache file: {}", path.display()),
                        None => println!("\nCache file: (disabled)"),
                    }
                }
                ConfigCommands::Init => {
                    let path = match cli.config {
                        Some(path) => path,
                        None => default_config_path()?,
                    };
                    settings.save(&path)?;
                    println!("{} Wrote {}", "[OK]".green(), path.display());
                }
            }
            Ok(SUCCESS)
        }
    }
}

struct LoadOptions {
    pulses: u32,
    pulse_interval: Duration,
    print_metrics: bool,
    quiet: bool,
}

async fn load(settings: &LoaderSettings, opts: LoadOptions) -> Result<i32> {
    let config = settings.to_loader_config();
    let cache_path = config.cache_path.clone();
    let validator = RankerModel::validator(config.model_url.clone());
    let metrics = Arc::new(RecordingMetrics::new());

    let (outcome_tx, mut outcome_rx) = oneshot::channel();
    let loader = ModelLoader::builder(config)
        .fetcher(Arc::new(HttpFetcher::new(settings.fetch_timeout())?))
        .metrics(metrics.clone())
        .start(
            validator,
            Box::new(move |outcome| {
                let _ = outcome_tx.send(outcome);
            }),
        )?;

    let spinner = spinner::create("Loading ranker model...", opts.quiet);
    let mut ticker = tokio::time::interval(opts.pulse_interval);
    ticker.tick().await;
    let mut sent = 0u32;

    let outcome = loop {
        tokio::select! {
            outcome = &mut outcome_rx => break outcome.ok(),
            _ = ticker.tick() => {
                if sent >= opts.pulses {
                    break None;
                }
                sent += 1;
                loader.notify_activity();
                spinner.set_message(format!(
                    "Loading ranker model... ({}, pulse {}/{})",
                    loader.state(),
                    sent,
                    opts.pulses
                ));
            }
        }
    };
    spinner.finish_and_clear();
    // Dropping the loader abandons any load still in flight.
    drop(loader);

    if opts.print_metrics {
        print_metrics(&metrics);
    }

    match outcome {
        Some(LoadOutcome::Loaded { model, source }) => {
            println!(
                "{} Model loaded from {:?} ({} byte payload)",
                "[OK]".green(),
                source,
                model.payload.len()
            );
            print_metadata(&model);
            Ok(SUCCESS)
        }
        Some(LoadOutcome::Unavailable { status }) => {
            eprintln!("{}", unavailable_message(status, cache_path.as_deref()));
            Ok(TEMP_FAIL)
        }
        None => {
            eprintln!(
                "{}",
                unavailable_message(ModelStatus::LoadingAbandoned, cache_path.as_deref())
            );
            Ok(TEMP_FAIL)
        }
    }
}

fn inspect(path: &std::path::Path) -> Result<i32> {
    let bytes = FileCache::read_blocking(path, Duration::from_secs(5))
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let model = match RankerModel::from_bytes(&bytes) {
        Ok(model) => model,
        Err(e) => {
            eprintln!(
                "{}",
                ErrorBuilder::new(format!("{} is not a ranker model", path.display()))
                    .cause(e.to_string())
                    .fix(format!("Remove it: ranker-loader clear {}", path.display()))
            );
            return Ok(DATA_ERR);
        }
    };

    println!("{} ({} bytes)", path.display().to_string().bold(), bytes.len());
    print_metadata(&model);

    match model.verify(None, Utc::now()) {
        Ok(()) => {
            println!("{} Model is intact and fresh", "[OK]".green());
            Ok(SUCCESS)
        }
        Err(e) => {
            println!("{} {}", "[!]".yellow(), e);
            Ok(DATA_ERR)
        }
    }
}

fn print_metadata(model: &RankerModel) {
    let meta = &model.metadata;
    println!("  Source:        {}", meta.source.as_deref().unwrap_or("(unknown)"));
    println!("  Last modified: {}", meta.last_modified.to_rfc3339());
    match model.expires_at() {
        Some(expiry) => println!("  Expires:       {}", expiry.to_rfc3339()),
        None => println!("  Expires:       never"),
    }
    println!("  SHA-256:       {}", meta.sha256.dimmed());
}

fn print_metrics(metrics: &RecordingMetrics) {
    println!("{}", "Metrics:".bold());
    for event in metrics.events() {
        match event {
            MetricEvent::Duration { name, duration } => {
                println!("  {} = {}ms", name, duration.as_millis())
            }
            MetricEvent::Status { name, status } => println!("  {} = {}", name, status),
        }
    }
}

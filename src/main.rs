//! Subweave - resumable per-episode subtitle enrichment
//!
//! Entry point: parses the command line, sets up logging and configuration, and
//! dispatches to the workflow.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subweave::catalog::{Manifest, RunScope};
use subweave::cli::{Args, Commands};
use subweave::config::Config;
use subweave::layers::{join_layers, parse_layer_list, Layer, LayerGraph, LayerOutcome};
use subweave::tracks::TrackType;
use subweave::workflow::{TrackState, Workflow};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;

    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new("subweave.toml").exists() {
                info!("Found subweave.toml in current directory, loading...");
                Config::from_file("subweave.toml")?
            } else {
                Config::default()
            }
        }
    };

    match args.command {
        Commands::Run { manifest, episode, invalidate, default_subtitle } => {
            if let Some(raw) = default_subtitle {
                config.tracks.default_subtitle = raw.parse::<TrackType>()?;
                config.validate()?;
            }
            let manifest = Manifest::from_file(&manifest)?;
            let scope = scope_of(episode);
            let layers = match invalidate {
                Some(raw) => parse_layer_list(&raw)?,
                None => Vec::new(),
            };

            let workflow = Workflow::new(config)?;
            workflow.check_collaborators().await?;
            let summary = workflow.run(&manifest, &scope, &layers).await?;

            for report in &summary.reports {
                let tracks = report
                    .tracks
                    .iter()
                    .map(|(track, state)| format!("{}={}", track, describe(state)))
                    .collect::<Vec<_>>()
                    .join(" ");
                let delay = report
                    .delay
                    .as_ref()
                    .map(|d| format!("{}ms ({:?})", d.offset_ms, d.method))
                    .unwrap_or_else(|| "kept".to_string());
                println!(
                    "{:<12} delay {:<24} {} mux={}{}",
                    report.episode_id,
                    delay,
                    tracks,
                    if report.muxed { "built" } else { "kept" },
                    report.failure.as_deref().map(|f| format!("  FAILED: {}", f)).unwrap_or_default()
                );
            }
            let failures = summary.failures();
            for failure in &failures {
                println!("{}", failure);
            }

            let failed = failures.len();
            if failed > 0 {
                anyhow::bail!("{} of {} episodes failed", failed, summary.reports.len() + summary.errors.len());
            }
        }
        Commands::Invalidate { manifest, episode, layers } => {
            let manifest = Manifest::from_file(&manifest)?;
            let layers = parse_layer_list(&layers)?;
            let workflow = Workflow::new(config)?;
            let invalidation = workflow.preflight(&manifest, &scope_of(episode), &layers).await?;

            for result in &invalidation.results {
                let outcome = match &result.outcome {
                    LayerOutcome::Cleared(n) => format!("cleared ({} namespaces)", n),
                    LayerOutcome::Failed(reason) => format!("FAILED: {}", reason),
                    LayerOutcome::Skipped => "skipped".to_string(),
                };
                println!("{:<10} {}", result.layer, outcome);
            }
            if let Some((layer, reason)) = invalidation.first_failure() {
                anyhow::bail!("invalidation of {} failed: {}", layer, reason);
            }
        }
        Commands::Layers { closure } => match closure {
            Some(raw) => {
                let requested = parse_layer_list(&raw)?;
                println!("{}", join_layers(&LayerGraph::closure(&requested)));
            }
            None => {
                for layer in LayerGraph::topological_order() {
                    println!("{:<10} -> {}", layer, join_layers(layer.dependents()));
                }
            }
        },
        Commands::Status { manifest, episode } => {
            let manifest = Manifest::from_file(&manifest)?;
            let workflow = Workflow::new(config)?;
            for status in workflow.status(&manifest, &scope_of(episode))? {
                println!("\n{}", status.episode_id);
                for layer in Layer::ALL {
                    let present = status.layers.get(&layer).copied().unwrap_or(false);
                    println!("  {:<10} {}", layer, if present { "present" } else { "missing" });
                }
                for (track, counts) in &status.chunks {
                    if counts.total > 0 {
                        println!(
                            "  chunks {:<5} {} recorded, {} complete, {} failed",
                            track, counts.total, counts.complete, counts.failed
                        );
                    }
                }
            }
        }
        Commands::InitConfig { output } => {
            if output.exists() {
                warn!("{} already exists, not overwriting", output.display());
            } else {
                config.save_to_file(&output)?;
                println!("Configuration written to {}", output.display());
            }
        }
    }

    Ok(())
}

fn scope_of(episode: Option<String>) -> RunScope {
    episode.map(RunScope::Episode).unwrap_or(RunScope::Group)
}

fn describe(state: &TrackState) -> String {
    match state {
        TrackState::Off => "off".to_string(),
        TrackState::Reused => "kept".to_string(),
        TrackState::Built { external_calls, cache_hits } => {
            format!("built({} calls, {} cached)", external_calls, cache_hits)
        }
        TrackState::Failed(_) => "failed".to_string(),
    }
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir: PathBuf = std::env::current_dir()?.join(".subweave").join("log");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = rolling::daily(&log_dir, "subweave.log");
    let (non_blocking_file, _guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(_guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("subweave.log").display()
    );

    Ok(())
}

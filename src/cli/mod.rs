// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::manifest;
use crate::orchestrator::Orchestrator;
use crate::source::enumerate_images;
use crate::storage::{ArtifactStore, PipelineState, STATE_FILE};
use crate::types::Stage;
use crate::vision::{BridgeClient, PromptTable, VlmClient};

/// Text-crop dataset curation pipeline
#[derive(Parser, Debug)]
#[command(name = "text-curator")]
#[command(version)]
#[command(about = "Detect, crop and quality-filter text regions into a curated dataset", long_about = None)]
pub struct Cli {
    /// Pipeline configuration file (TOML)
    #[arg(long, short, env = "CURATION_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run (or resume) the pipeline over the source directory
    Run(TargetArgs),

    /// Rebuild the manifests from stored artifacts without model calls
    Manifest(ManifestArgs),

    /// Show per-stage progress, failures and model sidecar health
    Status(TargetArgs),
}

/// Selects which part of the source corpus a command works on
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Subfolder of source_dir to process (e.g. one SA-1B shard)
    #[arg(long)]
    pub source_subfolder: Option<String>,

    /// Suffix for the run directory and output files; defaults to `_<subfolder>`
    #[arg(long)]
    pub output_suffix: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ManifestArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Overwrite an existing manifest even if some images lack complete records
    #[arg(long)]
    pub force: bool,
}

impl Commands {
    fn target(&self) -> &TargetArgs {
        match self {
            Commands::Run(t) | Commands::Status(t) => t,
            Commands::Manifest(args) => &args.target,
        }
    }
}

/// Load file, environment and CLI settings, in that order of precedence
pub fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config
        .apply_env()
        .context("applying environment overrides")?;

    let target = cli.command.target();
    if let Some(sub) = &target.source_subfolder {
        config.source_subfolder = Some(sub.clone());
    }
    if let Some(suffix) = &target.output_suffix {
        config.output_suffix = Some(suffix.clone());
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Install the global subscriber; `RUST_LOG` wins over `logging.level`
pub fn init_tracing(config: &PipelineConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .with_context(|| format!("invalid log level '{}'", config.logging.level))?;

    match &config.logging.file {
        Some(file) => {
            let path = config.run_dir().join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

/// Execute CLI command
pub async fn execute(cli: Cli, config: PipelineConfig) -> Result<()> {
    match cli.command {
        Commands::Run(_) => run(config).await,
        Commands::Manifest(args) => regenerate(config, args.force).await,
        Commands::Status(_) => status(config).await,
    }
}

async fn run(config: PipelineConfig) -> Result<()> {
    let config = Arc::new(config);
    let images = enumerate_images(&config.input_dir()).context("enumerating source images")?;
    let orchestrator =
        Orchestrator::from_config(config.clone()).context("configuring model clients")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight calls and stopping");
            on_signal.cancel();
        }
    });

    let summary = orchestrator
        .run(&images, cancel)
        .await
        .context("pipeline run aborted")?;
    summary.log();

    println!("Images:     {}", summary.total_images);
    println!("Processed:  {}", summary.processed.len());
    println!("Failed:     {}", summary.failed.len());
    for failure in &summary.failed {
        println!("  {} [{}]: {}", failure.image_id, failure.stage, failure.reason);
    }
    println!("Skipped:    {}", summary.skipped.len());
    match &summary.manifest {
        Some(paths) => println!(
            "Manifest:   {} ({} entries)",
            paths.restoration.display(),
            summary.manifest_entries
        ),
        None => println!("Manifest:   not written"),
    }

    if summary.cancelled {
        bail!("run cancelled; rerun to resume");
    }
    if !summary.failed.is_empty() {
        bail!("{} images failed; rerun to retry them", summary.failed.len());
    }
    Ok(())
}

async fn regenerate(config: PipelineConfig, force: bool) -> Result<()> {
    let images = enumerate_images(&config.input_dir()).context("enumerating source images")?;
    let store = ArtifactStore::new(config.run_dir());
    let state = PipelineState::open(store.root().join(STATE_FILE))
        .await
        .context("reading state log")?;

    let summary = manifest::regenerate(&config, &images, &store, &state, force)
        .await
        .context("rebuilding manifest (pass --force to write a partial one)")?;
    info!(
        included = summary.images_included,
        skipped = summary.images_skipped.len(),
        "Manifest rebuilt"
    );

    println!(
        "Manifest:   {} ({} entries from {} images)",
        summary.paths.restoration.display(),
        summary.entry_count,
        summary.images_included
    );
    if !summary.images_skipped.is_empty() {
        println!("Incomplete: {} images left out", summary.images_skipped.len());
    }
    Ok(())
}

async fn status(config: PipelineConfig) -> Result<()> {
    let images = enumerate_images(&config.input_dir()).context("enumerating source images")?;
    let state_path = config.run_dir().join(STATE_FILE);
    let state = PipelineState::open(&state_path)
        .await
        .context("reading state log")?;

    println!("Run directory: {}", config.run_dir().display());
    println!("Source images: {}", images.len());
    for stage in Stage::ALL {
        println!("  {:<10} {}", stage.as_str(), state.completed_count(stage).await);
    }

    let mut complete = 0;
    for image in &images {
        if state.is_fully_complete(&image.id).await {
            complete += 1;
        }
    }
    println!("Complete:      {}", complete);

    let failures = state.failures().await;
    println!("Failed:        {}", failures.len());
    for (image_id, failure) in &failures {
        println!("  {} [{}]: {}", image_id, failure.stage, failure.reason);
    }

    print_sidecar_health(&config).await
}

async fn print_sidecar_health(config: &PipelineConfig) -> Result<()> {
    let probe_timeout = Duration::from_secs(5);
    let models = &config.models;
    let up = |healthy: bool| if healthy { "up" } else { "down" };

    let bridge = BridgeClient::new(&models.bridge_endpoint, probe_timeout)
        .context("building bridge client")?;
    println!(
        "Bridge:        {} ({})",
        bridge.endpoint(),
        up(bridge.health_check().await)
    );

    let mut names = vec![models.blur_vlm_name.as_str()];
    if config.annotation.enabled {
        names.extend([models.vlm1_name.as_str(), models.vlm2_name.as_str()]);
    }
    names.sort_unstable();
    names.dedup();

    let prompts = PromptTable::from_blur_config(&config.blur);
    for name in names {
        match models.endpoint_for(name) {
            Ok(endpoint) => {
                let client = VlmClient::new(
                    name,
                    &endpoint.endpoint,
                    endpoint.model.as_deref(),
                    prompts.clone(),
                    probe_timeout,
                )
                .with_context(|| format!("building client for VLM '{}'", name))?;
                println!(
                    "VLM {:<10} {} ({})",
                    name,
                    endpoint.endpoint,
                    up(client.health_check().await)
                );
            }
            Err(e) => println!("VLM {:<10} {}", name, e),
        }
    }
    Ok(())
}

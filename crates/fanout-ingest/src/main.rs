//! Fanout Ingest - multi-sink ingestion worker

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fanout_common::logging::{init_logging, LogConfig, LogLevel};
use fanout_ingest::config::Config;
use fanout_ingest::controller::IngestionController;
use fanout_ingest::coordinator::FanOutCoordinator;
use fanout_ingest::normalizer::Normalizer;
use fanout_ingest::report::RunState;
use fanout_ingest::schema;
use fanout_ingest::sinks::{build_sinks, prepare_sinks};
use fanout_ingest::source::{build_source, ArtifactLayout, ArtifactReference, ArtifactSource, LocalArtifactSource};
use fanout_ingest::worker::{shutdown_on_signal, IngestionWorker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fanout-ingest")]
#[command(author, version, about = "Fan structured records out to time-series, columnar, search and vector stores")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the artifact source until interrupted
    Run,

    /// Process the current listing once and exit
    Once,

    /// Run a single local file through the sinks without moving it
    File {
        /// Path to a .json, .jsonl/.ndjson or .csv file
        path: PathBuf,
    },

    /// Print the canonical schema contract
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("fanout-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = Config::load()?;

    match cli.command {
        Command::Schema => {
            print!("{}", schema::render_table(&config.sinks.enabled));
        },
        Command::Run => {
            let controller = build_controller(&config, build_source(&config.source).await?).await?;
            let mut worker = IngestionWorker::new(
                controller,
                config.source.layout.input_prefix.clone(),
                config.pipeline.poll_interval(),
            );
            worker.run(shutdown_on_signal()).await;
        },
        Command::Once => {
            let controller = build_controller(&config, build_source(&config.source).await?).await?;
            let mut worker = IngestionWorker::new(
                controller,
                config.source.layout.input_prefix.clone(),
                config.pipeline.poll_interval(),
            );
            let reports = worker.run_once().await?;
            let quarantined = reports
                .iter()
                .filter(|r| r.final_state == RunState::Quarantined)
                .count();

            info!(processed = reports.len(), quarantined, "Single pass complete");
            if quarantined > 0 {
                anyhow::bail!("{} of {} artifacts quarantined", quarantined, reports.len());
            }
        },
        Command::File { path } => {
            let root = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Invalid file path: {}", path.display()))?
                .to_string();
            let size = tokio::fs::metadata(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?
                .len();

            let source: Arc<dyn ArtifactSource> = Arc::new(LocalArtifactSource::new(root, ArtifactLayout::default()));
            let controller = build_controller(&config, source).await?;
            let report = controller.run_dry(&ArtifactReference::new(file_name, size)).await;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.final_state == RunState::Quarantined {
                anyhow::bail!("{} would be quarantined", path.display());
            }
        },
    }

    Ok(())
}

async fn build_controller(config: &Config, source: Arc<dyn ArtifactSource>) -> Result<Arc<IngestionController>> {
    let sinks = build_sinks(&config.sinks, &config.pipeline.target_name)?;
    prepare_sinks(&sinks, config.pipeline.ensure_schema).await;

    let coordinator = FanOutCoordinator::new(sinks, config.pipeline.sink_timeout());
    let normalizer = Normalizer::new(config.mapping.clone(), config.key_policy.clone());

    Ok(Arc::new(IngestionController::new(
        source,
        normalizer,
        coordinator,
        config.pipeline.controller_config(),
    )))
}

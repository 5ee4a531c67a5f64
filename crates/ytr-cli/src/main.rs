use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ytr_sync::{PipelineConfig, RunSummary, SyncApp};

#[derive(Debug, Parser)]
#[command(name = "ytr")]
#[command(about = "Incremental YouTube Reporting extraction and warehouse loads")]
struct Cli {
    /// Pipeline config; falls back to $YTR_CONFIG, then ./ytr.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug-level logs unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, load the reports table, then load channel, video and category metadata.
    Run,
    /// Extract and normalize reports for the current watermark window only.
    Extract,
    /// Replace the reports table with every processed report on disk.
    Load,
    /// Load channel, video and category tables for the processed reports.
    Enrich,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

fn print_extraction(summary: &RunSummary) {
    println!(
        "extraction {:?}: run_id={} listed={} reconciled={} processed={} failed={} watermark={}",
        summary.final_state,
        summary.run_id,
        summary.listed,
        summary.reconciled,
        summary.processed.len(),
        summary.failures.len(),
        summary
            .new_watermark
            .or(summary.previous_watermark)
            .map(|w| w.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    for failure in &summary.failures {
        warn!(
            report_id = %failure.report_id,
            coverage_date = %failure.coverage_date,
            stage = ?failure.stage,
            error = %failure.error,
            "report not processed"
        );
    }
}

fn print_load(rows: Option<usize>) {
    match rows {
        Some(rows) => println!("reports table loaded: rows={rows}"),
        None => println!("reports table load skipped: no processed reports"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = PipelineConfig::resolve_path(cli.config);
    let config = PipelineConfig::load(&config_path)?;
    let app = Arc::new(SyncApp::new(config)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = app.run_all().await?;
            print_extraction(&summary.extraction);
            print_load(summary.loaded_rows);
            if let Some(enrichment) = summary.enrichment {
                println!("{}", serde_json::to_string(&enrichment)?);
            }
        }
        Commands::Extract => {
            let summary = app.extract().await?;
            print_extraction(&summary);
        }
        Commands::Load => {
            print_load(app.load_reports().await?);
        }
        Commands::Enrich => {
            let enrichment = app.enrich().await?;
            println!("{}", serde_json::to_string(&enrichment)?);
        }
        Commands::Schedule => {
            let Some(mut sched) = app.maybe_build_scheduler().await? else {
                bail!("scheduling is disabled; set schedule.enabled or YTR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(crons = ?app.config().schedule.crons, "scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

//! adsft - full-text extraction pipeline

use adsft_common::logging::{init_logging, LogConfig, LogLevel};
use adsft_pipeline::broker::InMemoryBroker;
use adsft_pipeline::config::PipelineConfig;
use adsft_pipeline::input::LinkList;
use adsft_pipeline::runner::PipelineRunner;
use adsft_pipeline::topology::TaskMaster;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "adsft")]
#[command(author, version, about = "ADS full-text extraction pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Check a link list and extract every record that needs it
    Run {
        /// Link list: one `bibcode path provider` per line
        #[arg(short, long)]
        links: PathBuf,

        /// Root of the extraction metadata store
        #[arg(long)]
        extract_path: Option<PathBuf>,

        /// Root that source paths are relative to
        #[arg(long)]
        fulltext_root: Option<PathBuf>,

        /// Workers per stage
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print the queue/routing-key table
    Topology,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("adsft")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = init_logging(&log_config)?;

    let mut config = PipelineConfig::load().context("Failed to load pipeline configuration")?;

    match cli.command {
        Command::Run {
            links,
            extract_path,
            fulltext_root,
            workers,
        } => {
            if let Some(extract_path) = extract_path {
                config.extract_path = extract_path;
            }
            if let Some(fulltext_root) = fulltext_root {
                config.fulltext_root = fulltext_root;
            }
            if let Some(workers) = workers {
                config.workers_per_stage = workers;
            }
            config.validate()?;

            run(config, links).await?;
        }
        Command::Topology => {
            let task_master = TaskMaster::with_default_routes(&config.exchange);
            println!("{:<30} {:<18} EXCHANGE", "QUEUE", "ROUTING KEY");
            for route in task_master.routes() {
                println!(
                    "{:<30} {:<18} {}",
                    route.queue, route.routing_key, route.exchange
                );
            }
        }
    }

    Ok(())
}

async fn run(config: PipelineConfig, links: PathBuf) -> Result<()> {
    let links = LinkList::from_file(&links)
        .with_context(|| format!("Failed to read link list {}", links.display()))?;
    info!(records = links.len(), "Starting pipeline run");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight tasks");
            signal.cancel();
        }
    });

    let runner = PipelineRunner::new(InMemoryBroker::default(), config);
    let summary = runner.run_to_completion(&links, shutdown).await?;

    println!("Records:         {}", summary.records);
    for (routing_key, count) in &summary.routed {
        println!("  {:<16} {}", routing_key, count);
    }
    println!("Result messages: {}", summary.results);
    println!("Error records:   {}", summary.errors);

    if summary.errors > 0 {
        warn!(errors = summary.errors, "Some records failed, see the error queue");
    }

    Ok(())
}

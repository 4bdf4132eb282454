use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use leadgen_common::Config;
use leadgen_scout::extract::{DirectoryCardExtractor, MapsFeedExtractor};
use leadgen_scout::launcher::{InProcessLauncher, ProcessLauncher, WorkerLauncher};
use leadgen_scout::orchestrator::{PipelineOrchestrator, RunRequest, StageSelection};
use leadgen_scout::partition::parse_zip_list;
use leadgen_scout::search_worker::{SearchWorker, WorkerConfig};
use leadgen_scout::session::{factory_for, PageProfile};

#[derive(Parser)]
#[command(name = "leadgen")]
#[command(about = "Multi-worker lead discovery and directory matching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search a ZIP range, then match the results against the directory
    Run {
        #[command(flatten)]
        search: SearchArgs,

        /// Directory matching workers
        #[arg(long, env = "LEADGEN_MATCH_WORKERS")]
        match_workers: Option<usize>,
    },

    /// Stage 1 only: search and filter
    Search {
        #[command(flatten)]
        search: SearchArgs,
    },

    /// Stage 2 only: directory matching and final filter
    Match {
        #[arg(long, env = "LEADGEN_MATCH_WORKERS")]
        match_workers: Option<usize>,
    },

    /// One Stage-1 worker process
    #[command(hide = true)]
    SearchWorker {
        /// JSON-encoded worker configuration
        #[arg(long)]
        config: String,
    },
}

#[derive(Args)]
struct SearchArgs {
    /// Two-letter region code, e.g. GA
    region: String,
    start_zip: u32,
    end_zip: u32,

    /// Search workers
    #[arg(long, env = "LEADGEN_WORKERS")]
    workers: Option<usize>,

    /// Run search workers as tasks in this process instead of subprocesses
    #[arg(long)]
    in_process: bool,

    /// Ignore and never update the progress tracker
    #[arg(long, env = "LEADGEN_TRACKER_BYPASS", value_parser = clap::builder::FalseyValueParser::new())]
    tracker_bypass: bool,

    /// Per-ZIP output directory
    #[arg(long, env = "LEADGEN_OUTPUT_BY_ZIP_DIR")]
    output_by_zip_dir: Option<PathBuf>,

    /// Explicit ZIPs to search instead of the range
    #[arg(long, env = "LEADGEN_ZIP_LIST")]
    zip_list: Option<ZipList>,

    /// Append all results to one file instead of one file per ZIP
    #[arg(long, conflicts_with = "output_by_zip_dir")]
    single_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct ZipList(Vec<u32>);

impl FromStr for ZipList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_zip_list(s).map(ZipList)
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("leadgen=info".parse()?);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Cancel on the first Ctrl-C.
fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialise logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(Cli::parse()).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("leadgen failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let config = Config::from_env()?;

    match cli.command {
        Commands::SearchWorker { config: raw } => {
            let worker_config: WorkerConfig =
                serde_json::from_str(&raw).context("Invalid worker configuration")?;
            let factory = factory_for(&config, PageProfile::map_search())?;
            let worker = SearchWorker::new(worker_config, factory, Arc::new(MapsFeedExtractor::new()), cancel);
            worker.run().await?;
            Ok(0)
        }
        Commands::Run {
            search,
            match_workers,
        } => {
            config.log_redacted();
            let orchestrator = orchestrator(&config, search.in_process, cancel)?;
            let mut request = search.into_request(&config, StageSelection::Full);
            if let Some(n) = match_workers {
                request.match_workers = n;
            }
            info!(run_id = orchestrator.run_id(), region = request.region.as_str(), "Lead run starting");
            Ok(orchestrator.run(&request).await?.exit_code())
        }
        Commands::Search { search } => {
            config.log_redacted();
            let orchestrator = orchestrator(&config, search.in_process, cancel)?;
            let request = search.into_request(&config, StageSelection::SearchOnly);
            info!(run_id = orchestrator.run_id(), region = request.region.as_str(), "Search run starting");
            Ok(orchestrator.run(&request).await?.exit_code())
        }
        Commands::Match { match_workers } => {
            config.log_redacted();
            let orchestrator = orchestrator(&config, false, cancel)?;
            let workers = match_workers.unwrap_or(config.match_workers);
            info!(run_id = orchestrator.run_id(), workers, "Match run starting");
            Ok(orchestrator.run_match(workers).await?.exit_code())
        }
    }
}

impl SearchArgs {
    fn into_request(self, config: &Config, stages: StageSelection) -> RunRequest {
        let mut request = RunRequest::new(&self.region, self.start_zip, self.end_zip, config);
        request.zip_list = self.zip_list.map(|l| l.0);
        request.tracker_bypass = self.tracker_bypass;
        request.output_by_zip_dir = self.output_by_zip_dir;
        request.single_file = self.single_file;
        request.stages = stages;
        if let Some(n) = self.workers {
            request.search_workers = n;
        }
        request
    }
}

fn orchestrator(config: &Config, in_process: bool, cancel: CancellationToken) -> Result<PipelineOrchestrator> {
    let launcher: Arc<dyn WorkerLauncher> = if in_process {
        Arc::new(InProcessLauncher::new(
            factory_for(config, PageProfile::map_search())?,
            Arc::new(MapsFeedExtractor::new()),
            cancel.clone(),
        ))
    } else {
        Arc::new(ProcessLauncher::current_exe()?)
    };

    Ok(PipelineOrchestrator::new(
        config.clone(),
        launcher,
        factory_for(config, PageProfile::directory_search())?,
        Arc::new(DirectoryCardExtractor::new(&config.directory_search_url)),
        cancel,
    ))
}

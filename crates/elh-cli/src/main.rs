use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use elh_sync::{
    install_interrupt_handler, load_source_registry, DiscoverOptions, HarvestConfig, Harvester,
    RunOutcome, ShutdownSignal, StatusReport,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "elh")]
#[command(about = "Resumable episode link harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Checkpoint file (overrides ELH_CHECKPOINT_PATH)
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,

    /// Source registry YAML (overrides ELH_SOURCES_PATH)
    #[arg(long, global = true)]
    sources: Option<PathBuf>,

    /// Maximum in-flight fetches (overrides ELH_CONCURRENCY)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl listings and record collections in the checkpoint
    Discover(DiscoverArgs),
    /// Fetch every pending item of every known collection
    Enrich,
    /// Discover, then enrich
    Run(DiscoverArgs),
    /// Print progress from the checkpoint
    Status,
}

#[derive(Debug, Clone, Copy, Default, Args)]
struct DiscoverArgs {
    /// Re-fetch sources that are already in the checkpoint
    #[arg(long)]
    rediscover: bool,
    /// Render deferred (paginated) sources in a headless browser
    #[arg(long)]
    render: bool,
}

impl From<DiscoverArgs> for DiscoverOptions {
    fn from(args: DiscoverArgs) -> Self {
        Self {
            rediscover: args.rediscover,
            render: args.render,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "harvest failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = HarvestConfig::from_env();
    if let Some(path) = cli.checkpoint {
        config.checkpoint_path = path;
    }
    if let Some(path) = cli.sources {
        config.sources_path = path;
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency.max(1);
    }

    let command = cli.command.unwrap_or(Commands::Run(DiscoverArgs::default()));
    let wants_render = matches!(&command, Commands::Discover(a) | Commands::Run(a) if a.render);
    let harvester = Harvester::from_config(config).await?;
    let mut shutdown = install_interrupt_handler();

    #[cfg(feature = "browser")]
    let renderer = if wants_render {
        launch_renderer(harvester.config()).await
    } else {
        None
    };
    #[cfg(feature = "browser")]
    let harvester = match &renderer {
        Some(renderer) => harvester.with_renderer(renderer.clone()),
        None => harvester,
    };
    #[cfg(not(feature = "browser"))]
    if wants_render {
        warn!("built without the `browser` feature, deferred sources stay deferred");
    }

    let result = execute(&harvester, command, &mut shutdown).await;

    #[cfg(feature = "browser")]
    {
        drop(harvester);
        if let Some(renderer) = renderer.and_then(|r| std::sync::Arc::try_unwrap(r).ok()) {
            renderer.close().await;
        }
    }
    result
}

async fn execute(harvester: &Harvester, command: Commands, shutdown: &mut ShutdownSignal) -> Result<()> {
    match command {
        Commands::Discover(args) => {
            let registry = load_source_registry(&harvester.config().sources_path).await?;
            let outcome = harvester
                .run_until_shutdown(harvester.discover(&registry, args.into()), shutdown)
                .await?;
            if let Some(summary) = completed(harvester, outcome) {
                println!(
                    "discover complete: sources={} skipped={} collections={} deferred={} rendered={} failed={}",
                    summary.sources,
                    summary.skipped,
                    summary.collections,
                    summary.deferred,
                    summary.rendered,
                    summary.failed
                );
            }
        }
        Commands::Enrich => {
            let outcome = harvester
                .run_until_shutdown(harvester.enrich(), shutdown)
                .await?;
            if let Some(summary) = completed(harvester, outcome) {
                println!(
                    "enrich complete: collections={} fetched={} completed={} empty={} timed_out={}",
                    summary.collections,
                    summary.dispatched,
                    summary.completed,
                    summary.empty,
                    summary.timed_out
                );
            }
        }
        Commands::Run(args) => {
            let registry = load_source_registry(&harvester.config().sources_path).await?;
            let outcome = harvester
                .run_until_shutdown(harvester.run(&registry, args.into()), shutdown)
                .await?;
            if let Some(summary) = completed(harvester, outcome) {
                println!(
                    "run complete: run_id={} collections={} deferred={} fetched={} completed={} empty={}",
                    summary.run_id,
                    summary.discovery.collections,
                    summary.discovery.deferred,
                    summary.enrichment.dispatched,
                    summary.enrichment.completed,
                    summary.enrichment.empty
                );
            }
        }
        Commands::Status => print_status(&harvester.status().await),
    }
    Ok(())
}

fn completed<T>(harvester: &Harvester, outcome: RunOutcome<T>) -> Option<T> {
    match outcome {
        RunOutcome::Completed(value) => Some(value),
        RunOutcome::Interrupted => {
            println!(
                "interrupted: progress saved to {}",
                harvester.store().path().display()
            );
            None
        }
    }
}

fn print_status(report: &StatusReport) {
    for collection in &report.collections {
        println!(
            "{:<40} {:>5}/{:<5} {}",
            collection.key.as_str(),
            collection.complete,
            collection.total,
            collection.title.as_deref().unwrap_or("")
        );
    }
    println!(
        "total {}/{} items complete across {} collections, {} deferred sources",
        report.complete(),
        report.total(),
        report.collections.len(),
        report.deferred
    );
}

#[cfg(feature = "browser")]
async fn launch_renderer(
    config: &HarvestConfig,
) -> Option<std::sync::Arc<elh_adapters::ChromiumRenderer>> {
    let chromium = elh_adapters::ChromiumConfig {
        settle: config.settle(),
        ..Default::default()
    };
    match elh_adapters::ChromiumRenderer::launch(chromium).await {
        Ok(renderer) => Some(std::sync::Arc::new(renderer)),
        Err(err) => {
            warn!(error = %err, "headless browser unavailable, deferred sources stay deferred");
            None
        }
    }
}

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use reach_core::PayloadScope;
use reach_sync::{run_sync_once, BatchReport, KeySelection, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "reach-cli")]
#[command(about = "Synchronize whitewater reach attributes to the hosted layers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Worker count; defaults to REACH_SYNC_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Cover every reach in the line layer instead of only gauged ones.
    #[arg(long)]
    all: bool,
    /// Sync only these reach ids.
    #[arg(long = "reach-id")]
    reach_ids: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full attribute sync for each selected reach.
    Sync(RunArgs),
    /// Refresh only the gauge stage columns.
    Stages(RunArgs),
}

impl RunArgs {
    fn selection(&self) -> KeySelection {
        if !self.reach_ids.is_empty() {
            KeySelection::Explicit(self.reach_ids.clone())
        } else if self.all {
            KeySelection::All
        } else {
            KeySelection::GaugedOnly
        }
    }
}

fn print_summary(report: &BatchReport) {
    println!(
        "sync complete: run_id={} scheduled={} succeeded={} not_found={} duplicate_key={} \
         fetch_failed={} update_failed={} skipped={}",
        report.run_id,
        report.scheduled,
        report.succeeded,
        report.not_found,
        report.duplicate_key,
        report.fetch_failed,
        report.update_failed,
        report.skipped_by_cancel,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; draining in-flight jobs");
            signal_cancel.cancel();
        }
    });

    let (scope, args) = match cli.command.unwrap_or(Commands::Sync(RunArgs {
        concurrency: None,
        all: false,
        reach_ids: Vec::new(),
    })) {
        Commands::Sync(args) => (PayloadScope::Full, args),
        Commands::Stages(args) => (PayloadScope::StageOnly, args),
    };

    let report = run_sync_once(
        &config,
        scope,
        args.selection(),
        args.concurrency,
        cancel,
    )
    .await?;

    print_summary(&report);
    Ok(())
}

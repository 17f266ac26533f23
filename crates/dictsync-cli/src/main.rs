use anyhow::Result;
use clap::{Parser, Subcommand};
use dictsync_pipeline::RunOutcome;

#[derive(Debug, Parser)]
#[command(name = "dictsync")]
#[command(about = "Dictionary-to-repository synchronization")]
struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for every enabled dataset.
    Sync {
        /// Read snapshots from local fixtures instead of live systems.
        #[arg(long)]
        offline: bool,
        /// Compute and persist the change script without submitting it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Print a digest of the most recent runs.
    Report {
        /// How many runs to include, newest first.
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn describe_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::NoChange => "no change".to_string(),
        RunOutcome::DryRun { operations } => {
            format!("dry run, {operations} operations scripted")
        }
        RunOutcome::Applied {
            version_id,
            operations,
        } => format!("applied {operations} operations, version {version_id}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Sync {
        offline: false,
        dry_run: false,
    }) {
        Commands::Sync { offline, dry_run } => {
            let summaries = dictsync_pipeline::run_sync_once_from_env(offline, dry_run).await?;
            for summary in &summaries {
                println!(
                    "{}: {} ({} source records, {} target records, {} diff entries)",
                    summary.dataset_id,
                    describe_outcome(&summary.outcome),
                    summary.source_records,
                    summary.target_records,
                    summary.diff_entries,
                );
            }
        }
        Commands::Schedule => {
            let config = dictsync_pipeline::SyncConfig::from_env();
            match dictsync_pipeline::maybe_build_scheduler(&config).await? {
                Some(scheduler) => {
                    scheduler.start().await?;
                    tracing::info!("scheduler running; press Ctrl-C to stop");
                    tokio::signal::ctrl_c().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set DICTSYNC_SCHEDULER_ENABLED=1 to enable");
                }
            }
        }
        Commands::Report { runs } => {
            let config = dictsync_pipeline::SyncConfig::from_env();
            let digest =
                dictsync_pipeline::report_recent_markdown(runs, Some(config.workspace_root))?;
            println!("{digest}");
        }
    }

    Ok(())
}

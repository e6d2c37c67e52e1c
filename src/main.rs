use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rangeflow::commands;
use rangeflow::config::Config;

#[derive(Parser)]
#[command(
    name = "rangeflow",
    version,
    about = "Lease-based distributed processing of ordered key ranges",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database holding jobs and partitions; defaults to the
    /// configured storage path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Configuration file (TOML); environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the demo schema
    Deploy,

    /// Drop the demo schema
    Remove,

    /// Schedule a job over the demo integer range [0, count)
    Schedule {
        /// Job identifier
        #[arg(short, long)]
        job: String,

        /// Number of keys in the demo range
        #[arg(short, long, default_value = "10000")]
        count: u64,
    },

    /// Run worker slots against a scheduled job
    Run {
        /// Job identifier
        #[arg(short, long)]
        job: String,

        /// Concurrent worker slots
        #[arg(short, long, default_value = "2")]
        workers: usize,

        /// Number of keys in the demo range (must match the scheduled job)
        #[arg(short, long, default_value = "10000")]
        count: u64,
    },

    /// Poll job status on an interval
    Status {
        /// Job identifier
        #[arg(short, long)]
        job: String,

        /// Seconds between polls
        #[arg(short, long, default_value = "5")]
        interval: u64,

        /// Print a single status line and exit
        #[arg(long, default_value = "false")]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    if let Err(e) = rangeflow::metrics::init_metrics() {
        tracing::warn!(error = %e, "metrics initialization failed, continuing without");
    }

    let db = cli.db.unwrap_or_else(|| config.storage.sqlite_path.clone());

    match cli.command {
        Commands::Deploy => commands::deploy(&db)?,

        Commands::Remove => commands::remove(&db)?,

        Commands::Schedule { job, count } => {
            tracing::info!(job = %job, count = count, "scheduling job");
            commands::schedule_job(&config, &db, &job, count).await?;
        }

        Commands::Run {
            job,
            workers,
            count,
        } => {
            tracing::info!(job = %job, workers = workers, "starting worker slots");
            commands::run_workers(&config, &db, &job, workers, count).await?;
        }

        Commands::Status {
            job,
            interval,
            once,
        } => {
            commands::monitor(&db, &job, interval, once).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}

//! Kairos: durable timer-based job scheduler
//!
//! Main binary with subcommands:
//! - `daemon`: Recover persisted jobs, schedule seed jobs, dispatch firings
//! - `list`: Print persisted job records

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kairos_scheduler::{
    DEFAULT_BACKOFF_RETRY_MILLIS, DEFAULT_HTTP_TIMEOUT_SECS,
    DEFAULT_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS, JobStatus, SchedulerConfig,
};

mod daemon;
mod list;

#[derive(Parser)]
#[command(name = "kairos")]
#[command(about = "Durable timer-based job scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until interrupted
    Daemon {
        /// Path of the JSON job store
        #[arg(long, env = "KAIROS_STORE_PATH")]
        store: PathBuf,

        /// JSON array of jobs to schedule after recovery
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Delay before retrying a failed execution, in milliseconds
        #[arg(long, env = "KAIROS_BACKOFF_RETRY_MILLIS", default_value_t = DEFAULT_BACKOFF_RETRY_MILLIS)]
        backoff_retry_millis: u64,

        /// How long after its expiration a job may still be retried, in milliseconds
        #[arg(long, env = "KAIROS_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS", default_value_t = DEFAULT_MAX_INTERVAL_LIMIT_TO_RETRY_MILLIS)]
        max_interval_limit_to_retry_millis: u64,

        /// Timeout for deliveries to job recipients, in seconds
        #[arg(long, env = "KAIROS_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
        http_timeout_secs: u64,
    },

    /// Print persisted jobs as JSON lines
    List {
        /// Path of the JSON job store
        #[arg(long, env = "KAIROS_STORE_PATH")]
        store: PathBuf,

        /// Only show jobs in these statuses (SCHEDULED, RETRY)
        #[arg(long = "status", value_name = "STATUS", value_parser = list::parse_active_status)]
        statuses: Vec<JobStatus>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "kairos=info,kairos_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            store,
            seed,
            backoff_retry_millis,
            max_interval_limit_to_retry_millis,
            http_timeout_secs,
        } => {
            daemon::run(daemon::DaemonConfig {
                store_path: store,
                seed_path: seed,
                scheduler: SchedulerConfig::new()
                    .with_backoff_retry_millis(backoff_retry_millis)
                    .with_max_interval_limit_to_retry_millis(max_interval_limit_to_retry_millis),
                http_timeout: Duration::from_secs(http_timeout_secs),
            })
            .await
        }

        Commands::List { store, statuses } => {
            let mut stdout = std::io::stdout().lock();
            list::run(&store, &statuses, &mut stdout).await
        }
    }
}

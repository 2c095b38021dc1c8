//! Graph crawler CLI
//!
//! Local execution entry point. For AWS Lambda, use `graph-crawler-lambda`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use graph_crawler::{
    app::App,
    error::{AppError, Result},
    models::{Config, JobKey},
    pipeline::{Caller, Invocation, Target},
};
use tokio_util::sync::CancellationToken;

/// Incremental social-graph crawler
#[derive(Parser, Debug)]
#[command(
    name = "graph-crawler",
    version,
    about = "Crawls a social graph one rate-limited step at a time and exports GML"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up a handle and create a crawl job for it
    Enqueue { owner: String, handle: String },

    /// Advance jobs by one step
    Tick {
        /// Only this owner's oldest unfinished job
        #[arg(long)]
        owner: Option<String>,

        /// Exactly this job (requires --owner)
        #[arg(long, requires = "owner")]
        root: Option<String>,

        /// Drive ticks as this admin instead of as the scheduler
        #[arg(long = "as")]
        caller: Option<String>,
    },

    /// Show progress of one job
    Status {
        owner: String,
        root: String,

        /// Caller to view the status as (admins see internal details)
        #[arg(long = "as")]
        caller: Option<String>,
    },

    /// List an owner's jobs
    List { owner: String },

    /// Delete a job and everything it collected
    Delete { owner: String, root: String },

    /// Save a finished job's graph file
    Download {
        owner: String,
        root: String,

        /// Output file (default: <display name>.gml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    init_logging(cli.verbose, &config.logging.level);
    log::debug!("Using configuration from {}", cli.config.display());

    let command = match cli.command {
        Command::Validate => {
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("✓ Config OK");
            return Ok(());
        }
        command => command,
    };

    let mut config = config;
    config.apply_env();
    config.validate()?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling in-flight calls");
            ctrl_c.cancel();
        }
    });

    let app = App::open_local(config).await?;
    let jobs = app.jobs.with_cancellation(cancel.clone());

    match command {
        Command::Enqueue { owner, handle } => {
            let key = jobs.enqueue(&owner, &handle).await?;
            println!("Enqueued {}", key);
        }

        Command::Tick { owner, root, caller } => {
            let caller = caller.map_or(Caller::Scheduler, Caller::User);
            let target = Target::from_address(owner, root)?;
            let invocation = app.driver.run(&caller, target, &cancel).await?;
            for line in invocation.lines() {
                println!("{}", line);
            }
            if let Invocation::Ran(reports) = &invocation {
                if reports.iter().all(|r| r.is_failure()) {
                    return Err(AppError::upstream("every selected job failed"));
                }
            }
        }

        Command::Status { owner, root, caller } => {
            let caller = caller.unwrap_or_else(|| owner.clone());
            let status = jobs.status(&caller, &JobKey::new(owner, root)).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::List { owner } => {
            for job in jobs.list(&owner).await? {
                let state = if job.done { "done" } else { job.phase().name() };
                println!("{}\t{}\t{}\t{}", job.root_id(), job.node.display_name, state, job.status);
            }
        }

        Command::Delete { owner, root } => {
            let removed = jobs.delete(&JobKey::new(owner, root)).await?;
            println!("Deleted job and {} child tasks", removed);
        }

        Command::Download { owner, root, output } => {
            let download = jobs.download(&JobKey::new(owner, root)).await?;
            let path = output.unwrap_or_else(|| PathBuf::from(&download.file_name));
            tokio::fs::write(&path, &download.bytes).await?;
            println!("Wrote {} bytes to {}", download.bytes.len(), path.display());
        }

        // handled before the store is opened
        Command::Validate => {}
    }

    Ok(())
}

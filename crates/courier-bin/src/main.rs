//! Courier: rate-adaptive bulk message dispatch over provider channels.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::AppConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courier", version, about = "Bulk message dispatch engine")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true, default_value = "courier.json", env = "COURIER_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch daemon.
    Start,
    /// Show channels and active jobs.
    Status,
    /// Register a sending channel.
    AddChannel {
        #[arg(long)]
        id: String,
        #[arg(long)]
        label: String,
        /// Initial rate in messages per second.
        #[arg(long, default_value_t = 60)]
        rate: i64,
    },
    /// Submit a job from a JSON entries file.
    Submit {
        /// Channel to dispatch the job on.
        #[arg(long)]
        channel: String,
        /// Entries file: a JSON array of {group, recipient, payload}.
        #[arg(long)]
        entries: PathBuf,
        /// Template group order; defaults to first appearance in the file.
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
    },
    /// Pause a job.
    PauseJob {
        #[arg(long)]
        job: String,
    },
    /// Resume a paused job (including a permanent abuse pause).
    ResumeJob {
        #[arg(long)]
        job: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    init_tracing(config.log_json);

    match cli.command {
        Command::Start => commands::start(config).await,
        Command::Status => commands::status(config).await,
        Command::AddChannel { id, label, rate } => {
            commands::add_channel(config, id, label, rate).await
        }
        Command::Submit {
            channel,
            entries,
            groups,
        } => commands::submit(config, channel, &entries, groups).await,
        Command::PauseJob { job } => commands::pause_job(config, job).await,
        Command::ResumeJob { job } => commands::resume_job(config, job).await,
    }
}

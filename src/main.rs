use anyhow::Result;
use clap::{Parser, Subcommand};
use parley::config::DEFAULT_CONFIG_FILE;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version, about = "Service supervisor and conversation-training orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start all configured services in dependency order and supervise them
    Up,
    /// Run the bridge service hosting the training control API
    Bridge {
        /// Listen port (overrides PORT env and configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Control a training session on a running bridge
    Train {
        #[command(subcommand)]
        command: TrainCommands,
    },
}

#[derive(Subcommand)]
pub enum TrainCommands {
    /// Start a training session
    Start {
        /// Maximum number of exchanges
        #[arg(long, default_value = "100")]
        exchanges: u64,

        /// Delay between exchanges in seconds
        #[arg(long, default_value = "2.0")]
        delay: f64,

        /// Exchanges before switching topics
        #[arg(long, default_value = "10")]
        topic_interval: u64,

        /// Keep printing progress until the session finishes
        #[arg(long)]
        watch: bool,
    },
    /// Request a running session to stop
    Stop,
    /// Show the current session status
    Status,
    /// Show recent exchanges
    Log {
        /// Number of entries to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match &cli.command {
        Commands::Up => cmd::cmd_up(&cli.config).await?,
        Commands::Bridge { port } => cmd::cmd_bridge(&cli.config, *port).await?,
        Commands::Train { command } => match command {
            TrainCommands::Start {
                exchanges,
                delay,
                topic_interval,
                watch,
            } => {
                cmd::cmd_train_start(&cli.config, *exchanges, *delay, *topic_interval, *watch)
                    .await?
            }
            TrainCommands::Stop => cmd::cmd_train_stop(&cli.config).await?,
            TrainCommands::Status => cmd::cmd_train_status(&cli.config).await?,
            TrainCommands::Log { limit } => cmd::cmd_train_log(&cli.config, *limit).await?,
        },
    }

    Ok(())
}

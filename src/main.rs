use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use harvest::config::{HARVEST_DIR, HarvestConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(version, about = "Review harvest orchestrator")]
pub struct Cli {
    /// Directory holding harvest.toml (and the database by default)
    #[arg(long, global = true, env = "HARVEST_DIR")]
    pub harvest_dir: Option<PathBuf>,

    /// Database path, overriding [server].db_path
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Debug-level logging for the harvest crate
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server for the approval surface and collaborators
    Serve {
        /// Bind address, overriding [server].host
        #[arg(long)]
        host: Option<String>,
        /// Port, overriding [server].port
        #[arg(short, long)]
        port: Option<u16>,
        /// Allow cross-origin requests
        #[arg(long)]
        cors: bool,
    },
    /// Create the database and run migrations
    InitDb,
    /// List jobs with their statistics
    Jobs {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate harvest.toml
    Validate,
    /// Write a default harvest.toml
    Init,
}

fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "harvest=debug" } else { "harvest=info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json)?;

    let harvest_dir = match cli.harvest_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()
            .context("Failed to get current directory")?
            .join(HARVEST_DIR),
    };
    let mut config = HarvestConfig::load(harvest_dir)?;
    if let Some(db_path) = &cli.db_path {
        config.toml.server.db_path = db_path.clone();
    }

    match cli.command {
        Commands::Serve { host, port, cors } => {
            if let Some(host) = host {
                config.toml.server.host = host;
            }
            if let Some(port) = port {
                config.toml.server.port = port;
            }
            cmd::cmd_serve(&config, cors).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config.toml.server.db_path)?,
        Commands::Jobs { json } => cmd::cmd_jobs(&config.toml.server.db_path, json)?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}

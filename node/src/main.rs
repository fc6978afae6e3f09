//! MeshQuery Node Binary

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use meshquery_core::{unix_now, NodeConfig};
use meshquery_node::{channel_report, load_config, manifest_report};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshquery-node")]
#[command(about = "MeshQuery Node - Decentralized Query Router")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Output file path
        #[arg(short, long, default_value = "meshquery.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the persisted payment channels
    Channels,

    /// Parse a provider manifest and show what it advertises
    Manifest {
        /// Manifest file path
        path: PathBuf,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())
        .with_context(|| format!("cannot load config {:?}", cli.config))?;
    init_logging(&config.log_level);

    match cli.command {
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                bail!("{} exists, pass --force to overwrite", output.display());
            }
            std::fs::write(&output, NodeConfig::default().to_toml()?)?;
            println!("Configuration saved to: {}", output.display());
        }

        Commands::Channels => {
            info!("Reading channels from {}", config.channels_path().display());
            let report = channel_report(&config, unix_now())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Manifest { path } => {
            let report = manifest_report(&path)
                .with_context(|| format!("invalid manifest {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

//! Armitage runtime binary.
//!
//! `start` boots the full runtime (store, kernel, scheduler, pollers)
//! with local fallback collaborators and runs until interrupted.
//! `check-config` validates a configuration file and prints the resolved
//! paths.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use armitage::config::{load_config, runtime_paths, Config};
use armitage::runtime::{Providers, Runtime};

#[derive(Parser)]
#[command(name = "armitage", version, about = "Multi-agent assistant runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the runtime until interrupted.
    Start {
        /// Path to the configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file and print the resolved paths.
    CheckConfig {
        /// Path to the configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

fn load(config_path: Option<&PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Start { config } => {
            let config = load(config.as_ref())?;
            let paths = runtime_paths(&config)?;
            let _logging = armitage::logging::init_runtime(&paths.logs_dir)?;

            info!(root = %paths.root.display(), "starting armitage");
            let runtime = Runtime::start(&config, &paths, Providers::default()).await?;

            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
            runtime.shutdown().await;
            Ok(())
        }
        Command::CheckConfig { config } => {
            armitage::logging::init_cli();
            let config = load(config.as_ref())?;
            let paths = runtime_paths(&config)?;
            println!("configuration OK");
            println!("  data dir:   {}", paths.root.display());
            println!("  database:   {}", paths.db_path.display());
            println!("  logs:       {}", paths.logs_dir.display());
            println!("  queue cap:  {}", config.queue.soft_cap);
            println!("  worker cap: {}", config.runtime.worker_cap);
            Ok(())
        }
    }
}

mod cli;
mod config;
mod error;
mod host;
mod image;
mod job;
mod network;
mod provider;
mod scheduler;
mod ssh;
mod storage;
mod task;
#[cfg(test)]
mod testutil;
mod util;
mod vm;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rallyci", about = "CI runner provisioning ephemeral VMs across KVM hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print what it declares.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Run configured jobs as one task and print its JSON report.
    Run {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: PathBuf,
        /// Project name exported to scripts as RCI_PROJECT.
        #[arg(long, short)]
        project: String,
        /// Job to run; repeat for several.
        #[arg(long = "job", short, required = true)]
        jobs: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let config = cli::load_config(&config)?;
            cli::run_check(&config)?;
        }
        Commands::Run { config, project, jobs } => {
            let config = Arc::new(cli::load_config(&config)?);
            let report = cli::run_task(config, &project, &jobs).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                anyhow::bail!("task {} did not succeed", report.id);
            }
        }
    }

    Ok(())
}

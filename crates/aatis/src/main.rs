//! aatis - operator CLI for the AATIS orchestration core
//!
//! Inspects the persisted state of a deployment (tasks, memory tiers,
//! capabilities, audit trail) and exercises the constitution gate locally.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;
mod error;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("aatis=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = config::Config::load()?;

    match cli.command {
        Commands::Doctor => commands::doctor::execute(&config).await,
        Commands::Status { json } => commands::status::execute(json, &config),
        Commands::Rules(cmd) => commands::rules::execute(cmd, &config),
        Commands::Task(cmd) => commands::task::execute(cmd, &config),
        Commands::Memory(cmd) => commands::memory::execute(cmd, &config).await,
        Commands::Capability(cmd) => commands::capability::execute(cmd, &config),
        Commands::Audit(cmd) => commands::audit::execute(cmd, &config),
        Commands::Maintain => commands::maintain::execute(&config).await,
        Commands::Version => {
            println!("aatis {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

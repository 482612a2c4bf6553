//! One-shot maintenance pass.
//!
//! Loads the persisted state into a core, runs the same pass the background
//! loop runs (memory sweep, execution timeouts, archiving), and lets the
//! write-through persistence store the outcome. Refused while a running
//! core holds the database.

use aatis_sdk::{MaintenanceReport, Orchestrator};
use anyhow::Result;
use colored::Colorize;

use crate::config::Config;

/// Run one pass against the configured database
pub async fn run(config: &Config) -> Result<MaintenanceReport> {
    let _lease = config.lease()?;
    let mut core = Orchestrator::new(config.sdk_config())?;
    core.initialize().await?;
    let report = core.maintain().await?;
    Ok(report)
}

/// Execute maintain command.
pub async fn execute(config: &Config) -> Result<()> {
    let report = run(config).await?;

    println!("{}", "Maintenance pass".cyan().bold());
    println!("  Promoted:  {}", report.sweep.promoted.len());
    println!("  Demoted:   {}", report.sweep.demoted.len());
    println!("  Evicted:   {}", report.sweep.evicted.len());
    println!("  Timed out: {}", report.timed_out.len());
    println!("  Archived:  {}", report.archived.len());

    for id in &report.timed_out {
        println!("    {} {}", "timeout".red(), id);
    }
    if report.sweep.is_empty() && report.timed_out.is_empty() && report.archived.is_empty() {
        println!("{}", "Nothing to do".dimmed());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aatis_core::types::Provenance;
    use aatis_sdk::SDKConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_pass_on_fresh_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.db");
        {
            let mut core = Orchestrator::new(SDKConfig::new(&path)).unwrap();
            core.initialize().await.unwrap();
            core.ingest("smb signing disabled on beta", Provenance::agent("recon"))
                .await
                .unwrap();
        }

        let mut config = Config::default();
        config.paths.database = path;
        let report = run(&config).await.unwrap();
        assert!(report.sweep.is_empty());
        assert!(report.timed_out.is_empty());
        assert!(report.archived.is_empty());
    }

    #[tokio::test]
    async fn test_refused_while_core_runs() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.database = dir.path().join("core.db");

        let mut core = Orchestrator::new(config.sdk_config()).unwrap();
        core.start().unwrap();
        let err = run(&config).await.unwrap_err();
        assert!(err.to_string().contains("running core"));

        core.shutdown().await.unwrap();
        assert!(run(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_database() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.database = dir.path().join("absent.db");
        assert!(run(&config).await.is_err());
        assert!(!config.paths.database.exists());
    }
}

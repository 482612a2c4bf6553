//! System status (dashboard view).

use std::collections::BTreeMap;

use aatis_core::Database;
use aatis_core::types::{MemoryTier, TaskState};
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::config::Config;

const STATES: [TaskState; 8] = [
    TaskState::Received,
    TaskState::Routed,
    TaskState::Dispatched,
    TaskState::Executing,
    TaskState::Escalated,
    TaskState::Completed,
    TaskState::Failed,
    TaskState::Archived,
];

#[derive(Debug, Serialize)]
struct Status {
    database: String,
    rule_set_version: Option<u32>,
    tasks: BTreeMap<&'static str, usize>,
    memory: BTreeMap<&'static str, i64>,
    capabilities: usize,
    unhealthy_capabilities: usize,
}

fn collect(db: &Database, config: &Config) -> Result<Status> {
    let mut tasks = BTreeMap::new();
    for task in db.list_tasks(None, i64::MAX as usize)? {
        *tasks.entry(task.state.as_str()).or_insert(0) += 1;
    }

    let counts = db.memory_counts()?;
    let memory = MemoryTier::ALL
        .into_iter()
        .map(|tier| (tier.as_str(), counts.get(&tier).copied().unwrap_or(0)))
        .collect();

    let capabilities = db.list_capabilities()?;
    let unhealthy = capabilities.iter().filter(|(_, d)| !d.healthy).count();

    Ok(Status {
        database: config.paths.database.display().to_string(),
        rule_set_version: db.current_rule_set_version()?,
        tasks,
        memory,
        capabilities: capabilities.len(),
        unhealthy_capabilities: unhealthy,
    })
}

/// Execute status command.
pub fn execute(json: bool, config: &Config) -> Result<()> {
    let db = config.open_database()?;
    let status = collect(&db, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", "AATIS Status".cyan().bold());
    println!("{}", "─".repeat(50));
    println!("  Database:   {}", status.database);
    match status.rule_set_version {
        Some(version) => println!("  Rule set:   v{}", version),
        None => println!("  Rule set:   {}", "never loaded".yellow()),
    }

    println!();
    println!("  {}", "Tasks:".cyan());
    let mut any = false;
    for state in STATES {
        if let Some(count) = status.tasks.get(state.as_str()) {
            any = true;
            let label = format!("{:<11}", state.as_str());
            let label = match state {
                TaskState::Failed => label.red(),
                TaskState::Escalated => label.yellow(),
                TaskState::Completed => label.green(),
                _ => label.normal(),
            };
            println!("    {} {:>5}", label, count);
        }
    }
    if !any {
        println!("    {}", "none".dimmed());
    }

    println!();
    println!("  {}", "Memory:".cyan());
    for tier in MemoryTier::ALL {
        let count = status.memory.get(tier.as_str()).copied().unwrap_or(0);
        println!("    {:<11} {:>5}", tier.as_str(), count);
    }

    println!();
    print!("  {} {}", "Capabilities:".cyan(), status.capabilities);
    if status.unhealthy_capabilities > 0 {
        print!(" ({})", format!("{} unhealthy", status.unhealthy_capabilities).red());
    }
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aatis_core::types::{NewTask, Provenance};
    use aatis_sdk::{Orchestrator, SDKConfig};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_collect_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.db");
        {
            let mut core = Orchestrator::new(SDKConfig::new(&path)).unwrap();
            core.initialize().await.unwrap();
            core.ingest("port 22 open on alpha", Provenance::agent("recon")).await.unwrap();
            core.submit(NewTask::new("write report", ["report"])).await.unwrap();
        }

        let mut config = Config::default();
        config.paths.database = path.clone();
        let db = config.open_database().unwrap();
        let status = collect(&db, &config).unwrap();

        assert_eq!(status.tasks.get("failed"), Some(&1));
        assert_eq!(status.memory.get("short_term"), Some(&1));
        assert_eq!(status.memory.get("long_term"), Some(&0));
        assert_eq!(status.capabilities, 0);
        assert_eq!(status.rule_set_version, Some(1));
    }
}

//! Capability commands.

use aatis_core::types::CapabilityDescriptor;
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::cli::{CapabilityAction, CapabilityCommand};
use crate::config::Config;

/// Execute capability command.
pub fn execute(cmd: CapabilityCommand, config: &Config) -> Result<()> {
    match cmd.action {
        CapabilityAction::List { json } => list(json, config),
    }
}

#[derive(Debug, Serialize)]
struct CapabilityRow {
    seq: u64,
    #[serde(flatten)]
    descriptor: CapabilityDescriptor,
}

fn join(tags: &std::collections::BTreeSet<String>) -> String {
    if tags.is_empty() {
        return "-".to_string();
    }
    tags.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn list(json: bool, config: &Config) -> Result<()> {
    let db = config.open_database()?;
    let rows: Vec<CapabilityRow> = db
        .list_capabilities()?
        .into_iter()
        .map(|(seq, descriptor)| CapabilityRow { seq, descriptor })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("{}", "No capabilities registered".yellow());
        return Ok(());
    }

    println!("{}", "Capabilities (as last persisted)".cyan().bold());
    println!("{}", "─".repeat(60));
    for row in &rows {
        let d = &row.descriptor;
        let health = if d.healthy { "healthy".green() } else { "unhealthy".red() };
        println!(
            "  #{:<3} {:<24} priority {:>3}  {}",
            row.seq,
            d.name.bold(),
            d.priority,
            health
        );
        println!("       accepts:  {}", join(&d.accepts));
        println!("       produces: {}", join(&d.produces));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_tags() {
        let descriptor = CapabilityDescriptor::new("recon").accepts(["scan", "dns"]);
        assert_eq!(join(&descriptor.accepts), "dns, scan");
        assert_eq!(join(&descriptor.produces), "-");
    }

    #[test]
    fn test_row_json_is_flat() {
        let row = CapabilityRow {
            seq: 3,
            descriptor: CapabilityDescriptor::new("recon").priority(2),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["seq"], 3);
        assert_eq!(value["name"], "recon");
        assert_eq!(value["priority"], 2);
    }
}

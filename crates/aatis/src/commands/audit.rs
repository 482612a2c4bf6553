//! Audit trail command.
//!
//! Reads events from the database, or from a JSON-lines audit log when one
//! is given.

use std::path::Path;

use aatis_core::audit::{AuditEvent, AuditEventType, JsonlAuditSink};
use anyhow::{Context, Result};
use colored::Colorize;

use crate::cli::AuditCommand;
use crate::config::Config;

/// Execute audit command.
pub fn execute(cmd: AuditCommand, config: &Config) -> Result<()> {
    let events = match &cmd.file {
        Some(path) => from_file(path, cmd.entity.as_deref(), cmd.limit)?,
        None => {
            let db = config.open_database()?;
            db.list_audit_events(cmd.entity.as_deref(), cmd.limit)
                .context("Failed to read audit events")?
        }
    };

    if events.is_empty() {
        println!("{}", "No audit events".yellow());
        return Ok(());
    }

    for event in &events {
        print_event(event);
    }
    Ok(())
}

/// Last `limit` events of a JSONL log, oldest first
fn from_file(path: &Path, entity: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>> {
    let events = JsonlAuditSink::read_all(path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    let mut events: Vec<_> = events
        .into_iter()
        .filter(|e| entity.is_none_or(|id| e.entity_id == id))
        .collect();
    let skip = events.len().saturating_sub(limit);
    events.drain(..skip);
    Ok(events)
}

fn print_event(event: &AuditEvent) {
    let kind = event.event_type.as_str();
    let kind = match event.event_type {
        AuditEventType::PolicyVerdict | AuditEventType::RuleSetRejected => kind.yellow(),
        AuditEventType::MemoryEvicted | AuditEventType::CapabilityDeregistered => kind.red(),
        AuditEventType::TaskCreated | AuditEventType::TaskTransition => kind.cyan(),
        _ => kind.normal(),
    };
    println!(
        "{} {:<24} {:<14} {} {}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
        kind,
        event.actor,
        event.entity_id.bold(),
        event.detail
    );
}

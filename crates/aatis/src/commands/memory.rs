//! Memory commands for the tiered memory store.
//!
//! Stats and listing read the database directly. Search loads the persisted
//! records into a local store and peeks, so it never counts as an access.
//! Ingest goes through the full core, including the memory-write check, and
//! is refused while a running core holds the database.
//!
//! Memory tiers:
//! - Short-term: fresh observations, evicted when idle
//! - Medium-term: records accessed repeatedly while fresh
//! - Long-term: records that kept being accessed in medium-term

use std::sync::Arc;

use aatis_core::types::{MemoryRecord, MemoryTier, Provenance};
use aatis_core::{Database, VectorIndex};
use aatis_sdk::{HashingEmbedder, MemoryHit, Orchestrator, SDKError, TieredMemory};
use anyhow::{Context, Result};
use colored::Colorize;

use crate::cli::{MemoryAction, MemoryCommand};
use crate::config::Config;
use crate::error::CliError;

/// Execute memory command.
pub async fn execute(cmd: MemoryCommand, config: &Config) -> Result<()> {
    match cmd.action {
        MemoryAction::Stats => stats(config),
        MemoryAction::List { tier, limit } => list(tier.as_deref(), limit, config),
        MemoryAction::Search { query, tier, k } => search(&query, tier.as_deref(), k, config).await,
        MemoryAction::Ingest { text, agent } => ingest(&text, &agent, config).await,
    }
}

/// Parse tier string to canonical form
fn parse_tier(tier: Option<&str>) -> Result<Option<MemoryTier>, CliError> {
    match tier {
        None => Ok(None),
        Some("short") | Some("s") => Ok(Some(MemoryTier::ShortTerm)),
        Some("medium") | Some("m") => Ok(Some(MemoryTier::MediumTerm)),
        Some("long") | Some("l") => Ok(Some(MemoryTier::LongTerm)),
        Some(other) => other
            .parse::<MemoryTier>()
            .map(Some)
            .map_err(|_| CliError::invalid("tier", format!("{} (use short, medium or long)", other))),
    }
}

fn tier_display(tier: MemoryTier) -> &'static str {
    match tier {
        MemoryTier::ShortTerm => "Short-term",
        MemoryTier::MediumTerm => "Medium-term",
        MemoryTier::LongTerm => "Long-term",
    }
}

fn stats(config: &Config) -> Result<()> {
    let db = config.open_database()?;
    let counts = db.memory_counts().context("Failed to count memory records")?;
    let memory = &config.core.memory;

    println!("{}", "Memory Statistics".cyan().bold());
    println!("{}", "─".repeat(40));
    let mut total = 0;
    for tier in MemoryTier::ALL {
        let count = counts.get(&tier).copied().unwrap_or(0);
        total += count;
        let capacity = match tier {
            MemoryTier::ShortTerm => memory.stm_capacity,
            MemoryTier::MediumTerm => memory.mtm_capacity,
            MemoryTier::LongTerm => memory.ltm_capacity,
        };
        println!("  {:<12} {:>6} / {}", tier_display(tier), count, capacity);
    }
    println!("{}", "─".repeat(40));
    println!("  {:<12} {:>6}", "Total", total);
    Ok(())
}

/// Records of a tier, most recently accessed first
fn recent_records(db: &Database, tier: Option<MemoryTier>, limit: usize) -> Result<Vec<MemoryRecord>> {
    let mut records = db.list_memory_records(tier)?;
    records.sort_by(|a, b| {
        b.last_accessed_at
            .cmp(&a.last_accessed_at)
            .then(b.id.cmp(&a.id))
    });
    records.truncate(limit);
    Ok(records)
}

fn list(tier: Option<&str>, limit: usize, config: &Config) -> Result<()> {
    let tier = parse_tier(tier)?;
    let db = config.open_database()?;
    let records = recent_records(&db, tier, limit)?;

    if records.is_empty() {
        println!("{} No memories found", "⚠".yellow());
        return Ok(());
    }

    println!("{} {} record(s):", "✓".green(), records.len());
    println!();
    for (i, record) in records.iter().enumerate() {
        print_record(i + 1, record, None);
    }
    Ok(())
}

/// Local store loaded from the database
async fn local_store(config: &Config) -> Result<TieredMemory> {
    let db = Arc::new(config.open_database()?);
    let core = &config.core;
    let memory = TieredMemory::new(
        core.memory.clone(),
        VectorIndex::new(core.embedding_dimensions, core.similarity),
        Arc::new(HashingEmbedder::new(core.embedding_dimensions)),
    )
    .with_db(db);
    let loaded = memory.load_from_db().await?;
    tracing::debug!(records = loaded, "Loaded memory records");
    Ok(memory)
}

async fn search(query: &str, tier: Option<&str>, k: usize, config: &Config) -> Result<()> {
    let tier = parse_tier(tier)?;
    let memory = local_store(config).await?;
    let hits = memory.peek(query, tier, k).await?;

    if hits.is_empty() {
        println!("{} No memories found matching query", "⚠".yellow());
        return Ok(());
    }

    println!("{} Found {} memories:", "✓".green(), hits.len());
    println!();
    for (i, hit) in hits.iter().enumerate() {
        print_record(i + 1, &hit.record, Some(hit.score));
    }
    Ok(())
}

async fn ingest(text: &str, agent: &str, config: &Config) -> Result<()> {
    // nothing can be running against a database that does not exist yet
    let _lease = if config.paths.database.exists() {
        Some(config.lease()?)
    } else {
        None
    };
    let mut core = Orchestrator::new(config.sdk_config())?;
    core.initialize().await?;

    match core.ingest(text, Provenance::agent(agent)).await {
        Ok(MemoryHit { record, .. }) => {
            println!(
                "{} Stored in {} memory",
                "✓".green(),
                tier_display(record.tier).cyan()
            );
            println!("  ID: {}", record.id);
            Ok(())
        }
        Err(SDKError::PolicyDenied { rules }) => {
            println!("{} Denied by: {}", "✗".red(), rules.join(", "));
            anyhow::bail!("memory write denied by the constitution")
        }
        Err(SDKError::PolicyEscalated { rules }) => {
            println!("{} Needs review: {}", "⚠".yellow(), rules.join(", "));
            anyhow::bail!("memory write escalated for human review")
        }
        Err(e) => Err(e.into()),
    }
}

fn print_record(index: usize, record: &MemoryRecord, score: Option<f32>) {
    let score = score
        .map(|s| format!(" score={:.3}", s))
        .unwrap_or_default();
    println!(
        "{}. [{}] {}{}",
        index,
        record.tier.as_str().cyan(),
        record.id.to_string().dimmed(),
        score
    );
    println!("   {}", record.source_text);
    println!(
        "   {} accesses, last {}, from {}",
        record.access_count,
        record.last_accessed_at.format("%Y-%m-%d %H:%M"),
        record.provenance
    );
    println!();
}

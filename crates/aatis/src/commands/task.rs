//! Task inspection commands.
//!
//! Reads the task snapshots and the append-only transition log straight from
//! the database; a running core is not required.

use aatis_core::Database;
use aatis_core::types::{PolicyVerdict, Task, TaskState, TransitionEntry};
use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::cli::{TaskAction, TaskCommand};
use crate::config::Config;
use crate::error::CliError;

/// Execute task command.
pub fn execute(cmd: TaskCommand, config: &Config) -> Result<()> {
    let db = config.open_database()?;
    match cmd.action {
        TaskAction::List { state, limit, json } => list(&db, state.as_deref(), limit, json),
        TaskAction::Show { task_id, json } => show(&db, &task_id, json),
    }
}

fn parse_state(state: Option<&str>) -> Result<Option<TaskState>, CliError> {
    state
        .map(|s| {
            s.to_lowercase()
                .parse::<TaskState>()
                .map_err(|e| CliError::invalid("task state", e))
        })
        .transpose()
}

fn state_colored(state: TaskState) -> colored::ColoredString {
    match state {
        TaskState::Completed => state.as_str().green(),
        TaskState::Failed => state.as_str().red(),
        TaskState::Escalated => state.as_str().yellow(),
        TaskState::Archived => state.as_str().dimmed(),
        _ => state.as_str().cyan(),
    }
}

fn list(db: &Database, state: Option<&str>, limit: usize, json: bool) -> Result<()> {
    let state = parse_state(state)?;
    let tasks = db.list_tasks(state, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("{}", "No tasks found".yellow());
        return Ok(());
    }

    println!("{}", "Tasks".cyan().bold());
    println!("{}", "─".repeat(60));
    for task in &tasks {
        println!(
            "  {}  {:<10}  {}",
            task.id.dimmed(),
            state_colored(task.state),
            truncate(&task.request, 50)
        );
        if let Some(capability) = &task.assigned_capability {
            println!("      capability: {}", capability);
        }
        if let Some(failure) = &task.failure {
            println!("      failure: {}", failure.to_string().red());
        }
    }
    println!();
    println!("  {} task(s)", tasks.len());
    Ok(())
}

/// Task together with its persisted transitions and verdicts
#[derive(Debug, Serialize)]
struct TaskReport {
    task: Task,
    transitions: Vec<TransitionEntry>,
    verdicts: Vec<PolicyVerdict>,
}

fn load_report(db: &Database, task_id: &str) -> Result<TaskReport> {
    let task = db
        .get_task(task_id)?
        .ok_or_else(|| CliError::TaskNotFound(task_id.to_string()))?;
    let transitions = db.list_transitions(task_id)?;
    let verdicts = db.list_verdicts(task_id)?;
    Ok(TaskReport {
        task,
        transitions,
        verdicts,
    })
}

fn show(db: &Database, task_id: &str, json: bool) -> Result<()> {
    let report = load_report(db, task_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let task = &report.task;
    println!("{} {}", "Task".cyan().bold(), task.id);
    println!("  Request:  {}", task.request);
    println!("  State:    {}", state_colored(task.state));
    if !task.required_tags.is_empty() {
        let tags: Vec<&str> = task.required_tags.iter().map(String::as_str).collect();
        println!("  Tags:     {}", tags.join(", "));
    }
    if let Some(capability) = &task.assigned_capability {
        println!("  Assigned: {}", capability);
    }
    if let Some(result) = task.result_ref {
        println!("  Result:   {}", result);
    }
    if let Some(failure) = &task.failure {
        println!("  Failure:  {}", failure.to_string().red());
    }
    if let Some(original) = &task.retry_of {
        println!("  Retry of: {}", original);
    }
    println!("  Created:  {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    println!();
    println!("{}", "Transitions:".cyan());
    for entry in &report.transitions {
        let mut line = format!(
            "  {:>3}. {} {} -> {} by {}",
            entry.seq,
            entry.at.format("%H:%M:%S"),
            entry.from,
            state_colored(entry.to),
            entry.actor
        );
        if let Some(reason) = &entry.reason {
            line.push_str(&format!(" ({})", reason));
        }
        println!("{}", line);
        if let Some(detail) = &entry.detail {
            println!("       {}", detail.dimmed());
        }
    }

    if !report.verdicts.is_empty() {
        println!();
        println!("{}", "Verdicts:".cyan());
        for verdict in &report.verdicts {
            println!(
                "  {} v{} {} {}",
                verdict.timestamp.format("%H:%M:%S"),
                verdict.rule_set_version,
                verdict.outcome,
                verdict.violated_rules.join(", ")
            );
        }
    }

    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

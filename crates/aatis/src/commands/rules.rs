//! Constitution commands.
//!
//! Everything here evaluates locally against a gate with no database and no
//! audit sink, so inspecting rules never bumps the persisted rule-set
//! version or records verdicts.

use std::path::Path;
use std::sync::Arc;

use aatis_core::audit::NullAuditSink;
use aatis_core::types::{PolicyVerdict, VerdictOutcome};
use aatis_sdk::ConstitutionGate;
use aatis_sdk::ProposedAction;
use aatis_sdk::constitution::{ActionKind, RuleEffect, RuleFile, default_rule_file};
use anyhow::{Context, Result};
use colored::Colorize;

use crate::cli::{RulesAction, RulesCommand};
use crate::config::Config;
use crate::error::CliError;

/// Execute rules command.
pub fn execute(cmd: RulesCommand, config: &Config) -> Result<()> {
    match cmd.action {
        RulesAction::Show => show(config),
        RulesAction::Prompt => {
            println!("{}", local_gate(config)?.prompt_block());
            Ok(())
        }
        RulesAction::Validate { path } => validate(path.as_deref(), config),
        RulesAction::Eval {
            text,
            action,
            context,
            approved,
        } => eval(&text, &action, &context, approved, config),
    }
}

/// Rule file named by the config, or the built-in constitution
pub fn load_rule_file(config: &Config) -> Result<RuleFile> {
    match &config.core.constitution.rules_path {
        Some(path) => RuleFile::load(path)
            .with_context(|| format!("Failed to load rule file {}", path.display())),
        None => default_rule_file().context("Built-in constitution is malformed"),
    }
}

/// Gate over the configured rules that persists and audits nothing
pub fn local_gate(config: &Config) -> Result<ConstitutionGate> {
    let file = load_rule_file(config)?;
    let gate = ConstitutionGate::new(
        &file,
        config.core.constitution.jurisdiction.clone(),
        None,
        Arc::new(NullAuditSink),
    )?;
    Ok(gate)
}

fn show(config: &Config) -> Result<()> {
    let gate = local_gate(config)?;
    let set = gate.rule_set();

    let source = match &config.core.constitution.rules_path {
        Some(path) => path.display().to_string(),
        None => "built-in".to_string(),
    };
    println!("{} ({})", "Constitution".cyan().bold(), source);
    println!("  Jurisdiction: {}", gate.jurisdiction());
    println!();

    println!("{}", "Principles:".cyan());
    for principle in set.principles() {
        println!("  [{}] {}", principle.tier.as_str().yellow(), principle.text);
    }
    println!();

    println!("{} (evaluation order)", "Rules:".cyan());
    for rule in set.rules() {
        let effect = match rule.effect {
            RuleEffect::Deny => rule.effect.as_str().red(),
            RuleEffect::Escalate => rule.effect.as_str().yellow(),
            RuleEffect::Warn => rule.effect.as_str().dimmed(),
        };
        println!(
            "  {:>4}  {:<28} {:<5} {}",
            rule.priority,
            rule.id.bold(),
            rule.tier.as_str(),
            effect
        );
        if !rule.description.is_empty() {
            println!("        {}", rule.description.dimmed());
        }
    }

    Ok(())
}

fn validate(path: Option<&Path>, config: &Config) -> Result<()> {
    let file = match path {
        Some(path) => RuleFile::load(path)?,
        None => load_rule_file(config)?,
    };
    let gate = ConstitutionGate::new(&file, "Default", None, Arc::new(NullAuditSink))?;
    let set = gate.rule_set();

    println!(
        "{} {} rules, {} principles",
        "✓".green(),
        set.len(),
        set.principles().len()
    );
    Ok(())
}

fn parse_action(action: &str) -> Result<ActionKind, CliError> {
    action
        .parse::<ActionKind>()
        .map_err(|e| CliError::invalid("action kind", e))
}

/// Evaluate text and describe the verdict
pub fn evaluate(
    gate: &ConstitutionGate,
    text: &str,
    action: &str,
    context: &[String],
    approved: bool,
) -> Result<PolicyVerdict> {
    let kind = parse_action(action)?;
    let proposed = ProposedAction::new(kind, text);
    Ok(gate.evaluate(None, &proposed, context, approved))
}

fn eval(text: &str, action: &str, context: &[String], approved: bool, config: &Config) -> Result<()> {
    let gate = local_gate(config)?;
    let verdict = evaluate(&gate, text, action, context, approved)?;

    let outcome = match verdict.outcome {
        VerdictOutcome::Allow => "allow".green().bold(),
        VerdictOutcome::Escalate => "escalate".yellow().bold(),
        VerdictOutcome::Deny => "deny".red().bold(),
    };
    println!("{} {}", "Verdict:".cyan(), outcome);
    if !verdict.violated_rules.is_empty() {
        println!("  Violated: {}", verdict.violated_rules.join(", "));
    }
    if !verdict.warnings.is_empty() {
        println!("  Warnings: {}", verdict.warnings.join(", "));
    }
    Ok(())
}

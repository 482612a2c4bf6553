//! Diagnostics command.

use anyhow::Result;
use colored::Colorize;

use crate::commands::rules::load_rule_file;
use crate::config::Config;

pub async fn execute(config: &Config) -> Result<()> {
    println!("{}", "aatis Doctor".cyan().bold());
    println!("{}", "─".repeat(50));
    println!();

    let mut issues = Vec::new();

    // Check config file
    print!("  Config file: ");
    let config_path = Config::config_path();
    if config_path.exists() {
        println!("{}", "✓ exists".green());
    } else {
        println!("{}", "○ not found (using defaults)".yellow());
    }

    // Check core settings
    print!("  Core settings: ");
    match config.core.validate() {
        Ok(()) => println!("{}", "✓ valid".green()),
        Err(e) => {
            println!("{}", format!("✗ {}", e).red());
            issues.push("Core settings are invalid");
        }
    }

    // Check database
    print!("  Database ({}): ", config.paths.database.display());
    match config.open_database() {
        Ok(db) => match db.ping() {
            Ok(()) => {
                println!("{}", "✓ connected".green());
                match db.current_rule_set_version() {
                    Ok(Some(version)) => println!("    last rule set: v{}", version),
                    Ok(None) => println!("    {}", "no rule set recorded yet".yellow()),
                    Err(e) => {
                        println!("    {}", format!("✗ {}", e).red());
                        issues.push("Failed to query the rule set history");
                    }
                }
            }
            Err(e) => {
                println!("{}", format!("✗ {}", e).red());
                issues.push("Database not responding");
            }
        },
        Err(e) => {
            println!("{}", format!("○ {}", e).yellow());
        }
    }

    // Check audit log
    if let Some(path) = &config.paths.audit_log {
        print!("  Audit log ({}): ", path.display());
        if path.exists() {
            println!("{}", "✓ exists".green());
        } else {
            println!("{}", "○ will be created".yellow());
        }
    }

    // Check rules
    print!("  Rule file: ");
    match load_rule_file(config).and_then(|file| {
        aatis_sdk::RuleSet::compile(1, &file).map_err(anyhow::Error::from)
    }) {
        Ok(set) => {
            let source = if config.core.constitution.rules_path.is_some() {
                "configured"
            } else {
                "built-in"
            };
            println!("{}", format!("✓ {} ({} rules)", source, set.len()).green());
        }
        Err(e) => {
            println!("{}", format!("✗ {:#}", e).red());
            issues.push("Rule file is missing or malformed");
        }
    }

    println!();
    if issues.is_empty() {
        println!("{}", "All checks passed!".green().bold());
    } else {
        println!("{}", "Issues found:".red().bold());
        for issue in &issues {
            println!("  • {}", issue);
        }
    }

    Ok(())
}

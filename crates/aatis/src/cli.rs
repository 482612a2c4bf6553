//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// AATIS operator CLI
///
/// Inspect tasks, memory tiers and the audit trail of an AATIS deployment,
/// and evaluate text against its constitution.
#[derive(Parser, Debug)]
#[command(name = "aatis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run diagnostics (config, database, rule file)
    Doctor,

    /// Show a summary of tasks, memory tiers and capabilities
    Status {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Constitution rules (show, prompt, validate, evaluate)
    Rules(RulesCommand),

    /// Persisted tasks and their transition logs
    Task(TaskCommand),

    /// Tiered memory (stats, list, search, ingest)
    Memory(MemoryCommand),

    /// Registered capabilities
    Capability(CapabilityCommand),

    /// Audit trail
    Audit(AuditCommand),

    /// Run one maintenance pass (memory sweep, timeouts, archiving)
    Maintain,

    /// Show version
    Version,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rules Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct RulesCommand {
    #[command(subcommand)]
    pub action: RulesAction,
}

#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// List principles and rules of the configured rule file
    Show,

    /// Print the prompt block prepended to agent prompts
    Prompt,

    /// Check that a rule file compiles
    Validate {
        /// Rule file to check (defaults to the configured one)
        path: Option<PathBuf>,
    },

    /// Evaluate text against the rules without recording a verdict
    Eval {
        /// Text of the proposed action
        text: String,

        /// Action kind: dispatch, memory_write, tool_invocation, capability_registration
        #[arg(short, long, default_value = "dispatch")]
        action: String,

        /// Memory context lines handed to memory-matching rules
        #[arg(short = 'c', long = "context", action = clap::ArgAction::Append)]
        context: Vec<String>,

        /// Evaluate as if an operator approved an escalation
        #[arg(long = "override")]
        approved: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct TaskCommand {
    #[command(subcommand)]
    pub action: TaskAction,
}

#[derive(Subcommand, Debug)]
pub enum TaskAction {
    /// List tasks, newest first
    List {
        /// Filter by state (received, routed, dispatched, executing, completed, failed, escalated, archived)
        #[arg(short, long)]
        state: Option<String>,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show a task with its transition log and verdicts
    Show {
        /// Task ID
        task_id: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct MemoryCommand {
    #[command(subcommand)]
    pub action: MemoryAction,
}

#[derive(Subcommand, Debug)]
pub enum MemoryAction {
    /// Record counts per tier
    Stats,

    /// List records, most recently accessed first
    List {
        /// Tier filter (short, medium, long)
        #[arg(short, long)]
        tier: Option<String>,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Similarity search; does not count as an access
    Search {
        /// Query text
        query: String,

        /// Tier filter (short, medium, long)
        #[arg(short, long)]
        tier: Option<String>,

        /// Number of results
        #[arg(short, long, default_value = "5")]
        k: usize,
    },

    /// Write text into short-term memory after a compliance check
    Ingest {
        /// Text to store
        text: String,

        /// Provenance agent name
        #[arg(short, long, default_value = "operator")]
        agent: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct CapabilityCommand {
    #[command(subcommand)]
    pub action: CapabilityAction,
}

#[derive(Subcommand, Debug)]
pub enum CapabilityAction {
    /// List capabilities in registration order
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct AuditCommand {
    /// Only events about this entity (task id, memory id, capability, ...)
    #[arg(short, long)]
    pub entity: Option<String>,

    /// Maximum results
    #[arg(short, long, default_value = "50")]
    pub limit: usize,

    /// Read a JSON-lines audit log instead of the database
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

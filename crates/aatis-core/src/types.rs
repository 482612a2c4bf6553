//! Shared types for aatis-core.
//!
//! These types are used by the SDK components and by the database layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Memory Types
// ─────────────────────────────────────────────────────────────────────────────

/// Retention tier of a memory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Short-term memory: capacity-bounded, high churn
    ShortTerm,
    /// Medium-term memory: time-bounded
    MediumTerm,
    /// Long-term memory: capacity-bounded, low churn
    LongTerm,
}

impl MemoryTier {
    /// All tiers, lowest first
    pub const ALL: [MemoryTier; 3] = [
        MemoryTier::ShortTerm,
        MemoryTier::MediumTerm,
        MemoryTier::LongTerm,
    ];

    /// Position of the tier, lowest first
    pub fn index(self) -> usize {
        match self {
            MemoryTier::ShortTerm => 0,
            MemoryTier::MediumTerm => 1,
            MemoryTier::LongTerm => 2,
        }
    }

    /// The tier one step up, if any
    pub fn promoted(self) -> Option<Self> {
        match self {
            MemoryTier::ShortTerm => Some(MemoryTier::MediumTerm),
            MemoryTier::MediumTerm => Some(MemoryTier::LongTerm),
            MemoryTier::LongTerm => None,
        }
    }

    /// The tier one step down, if any
    pub fn demoted(self) -> Option<Self> {
        match self {
            MemoryTier::ShortTerm => None,
            MemoryTier::MediumTerm => Some(MemoryTier::ShortTerm),
            MemoryTier::LongTerm => Some(MemoryTier::MediumTerm),
        }
    }

    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::MediumTerm => "medium_term",
            MemoryTier::LongTerm => "long_term",
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "short_term" | "stm" => Ok(MemoryTier::ShortTerm),
            "medium_term" | "mtm" => Ok(MemoryTier::MediumTerm),
            "long_term" | "ltm" => Ok(MemoryTier::LongTerm),
            _ => Err(format!("Invalid memory tier: {}", s)),
        }
    }
}

/// Identifier of a memory record.
///
/// Allocated monotonically by the memory store, so a lower id means an
/// earlier insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem-{}", self.0)
    }
}

impl std::str::FromStr for MemoryId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("mem-").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(MemoryId)
            .map_err(|_| format!("Invalid memory id: {}", s))
    }
}

/// Which agent (and optionally which task) produced a memory record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub agent: String,
    pub task_id: Option<String>,
}

impl Provenance {
    /// Provenance for a record produced by an agent outside any task
    pub fn agent(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            task_id: None,
        }
    }

    /// Provenance for a record produced while executing a task
    pub fn task(agent: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            task_id: Some(task_id.into()),
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_id {
            Some(task_id) => write!(f, "{}/{}", self.agent, task_id),
            None => f.write_str(&self.agent),
        }
    }
}

/// A record in the tiered memory store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub embedding: Vec<f32>,
    pub source_text: String,
    pub tier: MemoryTier,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub provenance: Provenance,
}

/// Input for writing a new memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMemoryRecord {
    pub embedding: Vec<f32>,
    pub source_text: String,
    pub provenance: Provenance,
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Types
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Received,
    Routed,
    Dispatched,
    Executing,
    Completed,
    Failed,
    Escalated,
    Archived,
}

impl TaskState {
    /// Whether no further work happens in this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Archived
        )
    }

    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Received => "received",
            TaskState::Routed => "routed",
            TaskState::Dispatched => "dispatched",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Escalated => "escalated",
            TaskState::Archived => "archived",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(TaskState::Received),
            "routed" => Ok(TaskState::Routed),
            "dispatched" => Ok(TaskState::Dispatched),
            "executing" => Ok(TaskState::Executing),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "escalated" => Ok(TaskState::Escalated),
            "archived" => Ok(TaskState::Archived),
            _ => Err(format!("Invalid task state: {}", s)),
        }
    }
}

/// Why a task ended up `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// No healthy capability accepts the task's required tags
    NoCapability,
    /// The constitution denied an action of the task
    PolicyDenied { rules: Vec<String> },
    /// Dispatched/Executing for longer than the configured bound
    Timeout,
    /// Cancelled by a caller
    Cancelled,
    /// The capability reported a failure
    CapabilityError { capability: String, message: String },
    /// An escalation was rejected or its re-route budget was spent
    EscalationRejected,
}

impl FailureReason {
    /// Short machine-readable label
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NoCapability => "no_capability",
            FailureReason::PolicyDenied { .. } => "policy_denied",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::CapabilityError { .. } => "capability_error",
            FailureReason::EscalationRejected => "escalation_rejected",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PolicyDenied { rules } if !rules.is_empty() => {
                write!(f, "policy_denied ({})", rules.join(", "))
            }
            FailureReason::CapabilityError { capability, message } => {
                write!(f, "capability_error ({}: {})", capability, message)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Identity that applied a task transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Actor {
    /// The capability router
    Router,
    /// A dispatched capability, through its completion event
    Capability(String),
    /// The constitution gate
    Constitution,
    /// The task engine itself (timeouts, archiving)
    Engine,
    /// A human operator or external caller
    Operator(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Router => f.write_str("router"),
            Actor::Capability(name) => write!(f, "capability:{}", name),
            Actor::Constitution => f.write_str("constitution"),
            Actor::Engine => f.write_str("engine"),
            Actor::Operator(name) => write!(f, "operator:{}", name),
        }
    }
}

/// One accepted state transition in a task's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEntry {
    pub seq: u32,
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
}

/// A unit of work tracked by the task engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub request: String,
    pub required_tags: BTreeSet<String>,
    pub state: TaskState,
    pub priority: i32,
    pub assigned_capability: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transitions: Vec<TransitionEntry>,
    pub result_ref: Option<MemoryId>,
    pub failure: Option<FailureReason>,
    pub verdicts: Vec<PolicyVerdict>,
    /// Failures reported per capability, inherited along a retry chain
    pub capability_failures: BTreeMap<String, u32>,
    /// Number of times an escalation was resolved back to `Routed`
    pub reroutes: u32,
    pub output_tags: BTreeSet<String>,
    pub retry_of: Option<String>,
}

impl Task {
    /// When the task entered its current state
    pub fn state_entered_at(&self) -> DateTime<Utc> {
        self.transitions
            .last()
            .map(|t| t.at)
            .unwrap_or(self.created_at)
    }

    /// Failures reported by a capability for this task
    pub fn failures_for(&self, capability: &str) -> u32 {
        self.capability_failures.get(capability).copied().unwrap_or(0)
    }
}

/// Input for creating a new task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub request: String,
    pub required_tags: BTreeSet<String>,
    pub priority: i32,
}

impl NewTask {
    /// Create a task request requiring the given capability tags
    pub fn new<I, S>(request: impl Into<String>, required_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request: request.into(),
            required_tags: required_tags.into_iter().map(Into::into).collect(),
            priority: 0,
        }
    }

    /// Set the task priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy Types
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a compliance check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Allow,
    Deny,
    Escalate,
}

impl VerdictOutcome {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictOutcome::Allow => "allow",
            VerdictOutcome::Deny => "deny",
            VerdictOutcome::Escalate => "escalate",
        }
    }
}

impl fmt::Display for VerdictOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VerdictOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(VerdictOutcome::Allow),
            "deny" => Ok(VerdictOutcome::Deny),
            "escalate" => Ok(VerdictOutcome::Escalate),
            _ => Err(format!("Invalid verdict outcome: {}", s)),
        }
    }
}

/// Result of one compliance check. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVerdict {
    /// Task the check was made for; `None` for checks outside any task
    pub task_id: Option<String>,
    pub rule_set_version: u32,
    pub outcome: VerdictOutcome,
    pub violated_rules: Vec<String>,
    /// Matched soft guidelines; these never change the outcome
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl PolicyVerdict {
    pub fn is_allowed(&self) -> bool {
        self.outcome == VerdictOutcome::Allow
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability Types
// ─────────────────────────────────────────────────────────────────────────────

/// Declared contract of a capability (agent or team)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub name: String,
    pub accepts: BTreeSet<String>,
    pub produces: BTreeSet<String>,
    pub priority: i32,
    pub healthy: bool,
}

impl CapabilityDescriptor {
    /// Create a healthy descriptor with no tags and priority 0
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts: BTreeSet::new(),
            produces: BTreeSet::new(),
            priority: 0,
            healthy: true,
        }
    }

    /// Set the accepted input tags
    pub fn accepts<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepts = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the produced output tags
    pub fn produces<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the declared priority (higher wins)
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether every required tag is among the accepted tags
    pub fn accepts_all(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.accepts)
    }
}

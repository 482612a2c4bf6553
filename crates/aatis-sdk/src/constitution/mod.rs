//! Constitution Gate
//!
//! A single policy layer every dispatch, memory write, tool invocation and
//! capability registration passes through. Rules come in three tiers:
//!
//! 1. **hard** - absolute constraints; apply even under operator override
//! 2. **core** - engagement-scope and professional-ethics rules
//! 3. **soft** - best-practice guidelines; a match only adds a warning
//!
//! Rules are declared in TOML, compiled once per load, and evaluated in
//! priority order. The first `deny` or `escalate` match decides the verdict.

mod defaults;
mod gate;
mod rules;

use thiserror::Error;

pub use defaults::{DEFAULT_CONSTITUTION, default_rule_file};
pub use gate::{ConstitutionGate, ProposedAction};
pub use rules::{
    ActionKind, Condition, ConditionSpec, Principle, Rule, RuleEffect, RuleFile, RuleSet, RuleSpec,
    RuleTier, Subject,
};

/// Errors raised while loading a rule set
#[derive(Debug, Error)]
pub enum ConstitutionError {
    #[error("malformed rule '{rule_id}': {message}")]
    MalformedRule { rule_id: String, message: String },

    #[error("rule file parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("rule file IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConstitutionError {
    /// Create a malformed rule error
    pub fn malformed(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedRule {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

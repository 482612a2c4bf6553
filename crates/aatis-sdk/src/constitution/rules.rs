//! Rule declarations and their compiled form.
//!
//! A rule file looks like:
//!
//! ```toml
//! [[principles]]
//! tier = "hard"
//! text = "All actions must comply with the laws of LOCAL_JURISDICTION."
//!
//! [[rules]]
//! id = "possible_exfil"
//! priority = 80
//! tier = "hard"
//! on_match = "deny"
//! description = "Never exfiltrate production data."
//! when = { all_of = [{ contains = "exfil" }, { not = { contains = "encrypt" } }] }
//! ```
//!
//! Several keys in one `when` table are a conjunction.

use std::collections::HashSet;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::ConstitutionError;
use crate::utils::validate_id;

/// Rule tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTier {
    Hard,
    Core,
    Soft,
}

impl RuleTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleTier::Hard => "hard",
            RuleTier::Core => "core",
            RuleTier::Soft => "soft",
        }
    }
}

impl fmt::Display for RuleTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a matching rule does to the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Deny,
    Escalate,
    /// Recorded as a warning; never changes the outcome
    Warn,
}

impl RuleEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleEffect::Deny => "deny",
            RuleEffect::Escalate => "escalate",
            RuleEffect::Warn => "warn",
        }
    }
}

impl fmt::Display for RuleEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of action submitted to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Dispatch,
    MemoryWrite,
    ToolInvocation,
    CapabilityRegistration,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Dispatch => "dispatch",
            ActionKind::MemoryWrite => "memory_write",
            ActionKind::ToolInvocation => "tool_invocation",
            ActionKind::CapabilityRegistration => "capability_registration",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatch" => Ok(ActionKind::Dispatch),
            "memory_write" => Ok(ActionKind::MemoryWrite),
            "tool_invocation" => Ok(ActionKind::ToolInvocation),
            "capability_registration" => Ok(ActionKind::CapabilityRegistration),
            _ => Err(format!("Invalid action kind: {}", s)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Declarations
// ─────────────────────────────────────────────────────────────────────────────

/// Condition tree as written in the rule file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConditionSpec {
    /// Case-insensitive regex over the action text
    pub pattern: Option<String>,
    /// Case-insensitive substring of the action text
    pub contains: Option<String>,
    /// Any of these case-insensitive substrings
    pub keywords: Option<Vec<String>>,
    /// Kind of the proposed action
    pub action: Option<ActionKind>,
    /// Case-insensitive regex over any memory context entry
    pub memory_matches: Option<String>,
    pub all_of: Option<Vec<ConditionSpec>>,
    pub any_of: Option<Vec<ConditionSpec>>,
    pub not: Option<Box<ConditionSpec>>,
}

/// One rule as written in the rule file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    pub tier: RuleTier,
    #[serde(default)]
    pub description: String,
    pub on_match: RuleEffect,
    pub when: ConditionSpec,
}

/// A statement with no predicate, rendered into the prompt block only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Principle {
    pub tier: RuleTier,
    pub text: String,
}

/// Top-level rule file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    #[serde(default)]
    pub principles: Vec<Principle>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl RuleFile {
    /// Parse a rule file from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConstitutionError> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a rule file
    pub fn load(path: &std::path::Path) -> Result<Self, ConstitutionError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled form
// ─────────────────────────────────────────────────────────────────────────────

/// What a rule is evaluated against
#[derive(Debug, Clone)]
pub struct Subject<'a> {
    pub action: ActionKind,
    pub text: &'a str,
    pub memory_context: &'a [String],
}

/// Compiled condition
#[derive(Debug, Clone)]
pub enum Condition {
    Pattern(Regex),
    Contains(String),
    Keywords(Vec<String>),
    Action(ActionKind),
    MemoryMatches(Regex),
    AllOf(Vec<Condition>),
    AnyOf(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Compile a condition tree, rejecting anything that could never be
    /// evaluated meaningfully
    pub fn compile(rule_id: &str, spec: &ConditionSpec) -> Result<Self, ConstitutionError> {
        let mut parts = Vec::new();

        if let Some(pattern) = &spec.pattern {
            parts.push(Condition::Pattern(compile_regex(rule_id, pattern)?));
        }
        if let Some(needle) = &spec.contains {
            if needle.is_empty() {
                return Err(ConstitutionError::malformed(rule_id, "`contains` must not be empty"));
            }
            parts.push(Condition::Contains(needle.to_lowercase()));
        }
        if let Some(keywords) = &spec.keywords {
            if keywords.is_empty() || keywords.iter().any(|k| k.is_empty()) {
                return Err(ConstitutionError::malformed(
                    rule_id,
                    "`keywords` must be a non-empty list of non-empty strings",
                ));
            }
            parts.push(Condition::Keywords(
                keywords.iter().map(|k| k.to_lowercase()).collect(),
            ));
        }
        if let Some(kind) = spec.action {
            parts.push(Condition::Action(kind));
        }
        if let Some(pattern) = &spec.memory_matches {
            parts.push(Condition::MemoryMatches(compile_regex(rule_id, pattern)?));
        }
        if let Some(children) = &spec.all_of {
            parts.push(Condition::AllOf(compile_children(rule_id, "all_of", children)?));
        }
        if let Some(children) = &spec.any_of {
            parts.push(Condition::AnyOf(compile_children(rule_id, "any_of", children)?));
        }
        if let Some(child) = &spec.not {
            parts.push(Condition::Not(Box::new(Condition::compile(rule_id, child)?)));
        }

        match parts.len() {
            0 => Err(ConstitutionError::malformed(rule_id, "empty condition")),
            1 => Ok(parts.remove(0)),
            _ => Ok(Condition::AllOf(parts)),
        }
    }

    /// Evaluate the condition. Pure: no state is read besides the subject.
    pub fn matches(&self, subject: &Subject<'_>) -> bool {
        match self {
            Condition::Pattern(re) => re.is_match(subject.text),
            Condition::Contains(needle) => subject.text.to_lowercase().contains(needle),
            Condition::Keywords(keywords) => {
                let text = subject.text.to_lowercase();
                keywords.iter().any(|k| text.contains(k))
            }
            Condition::Action(kind) => subject.action == *kind,
            Condition::MemoryMatches(re) => subject.memory_context.iter().any(|m| re.is_match(m)),
            Condition::AllOf(children) => children.iter().all(|c| c.matches(subject)),
            Condition::AnyOf(children) => children.iter().any(|c| c.matches(subject)),
            Condition::Not(child) => !child.matches(subject),
        }
    }
}

fn compile_regex(rule_id: &str, pattern: &str) -> Result<Regex, ConstitutionError> {
    if pattern.is_empty() {
        return Err(ConstitutionError::malformed(rule_id, "empty regex"));
    }
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ConstitutionError::malformed(rule_id, format!("invalid regex: {}", e)))
}

fn compile_children(
    rule_id: &str,
    key: &str,
    children: &[ConditionSpec],
) -> Result<Vec<Condition>, ConstitutionError> {
    if children.is_empty() {
        return Err(ConstitutionError::malformed(rule_id, format!("`{}` must not be empty", key)));
    }
    children.iter().map(|c| Condition::compile(rule_id, c)).collect()
}

/// Compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub priority: i32,
    pub tier: RuleTier,
    pub description: String,
    pub effect: RuleEffect,
    pub condition: Condition,
}

impl Rule {
    pub fn compile(spec: &RuleSpec) -> Result<Self, ConstitutionError> {
        validate_id(&spec.id).map_err(|e| ConstitutionError::malformed(&spec.id, e.to_string()))?;
        if spec.tier == RuleTier::Soft && spec.on_match != RuleEffect::Warn {
            return Err(ConstitutionError::malformed(
                &spec.id,
                "soft rules may only warn",
            ));
        }

        Ok(Self {
            id: spec.id.clone(),
            priority: spec.priority,
            tier: spec.tier,
            description: spec.description.clone(),
            effect: spec.on_match,
            condition: Condition::compile(&spec.id, &spec.when)?,
        })
    }

    pub fn matches(&self, subject: &Subject<'_>) -> bool {
        self.condition.matches(subject)
    }
}

/// A loaded, versioned rule set. Rules are kept in evaluation order:
/// highest priority first, declaration order among equals.
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: u32,
    rules: Vec<Rule>,
    principles: Vec<Principle>,
}

impl RuleSet {
    /// Compile every rule of a file. Any malformed rule rejects the whole file.
    pub fn compile(version: u32, file: &RuleFile) -> Result<Self, ConstitutionError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(file.rules.len());

        for spec in &file.rules {
            if !seen.insert(spec.id.as_str()) {
                return Err(ConstitutionError::malformed(&spec.id, "duplicate rule id"));
            }
            rules.push(Rule::compile(spec)?);
        }
        for principle in &file.principles {
            if principle.text.trim().is_empty() {
                return Err(ConstitutionError::malformed(
                    format!("principle:{}", principle.tier),
                    "empty principle text",
                ));
            }
        }

        // Stable sort keeps declaration order among equal priorities
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Self {
            version,
            rules,
            principles: file.principles.clone(),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn principles(&self) -> &[Principle] {
        &self.principles
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject<'a>(action: ActionKind, text: &'a str, memory: &'a [String]) -> Subject<'a> {
        Subject {
            action,
            text,
            memory_context: memory,
        }
    }

    #[test]
    fn test_parse_and_compile() {
        let file = RuleFile::from_toml_str(
            r#"
            [[principles]]
            tier = "hard"
            text = "Obey the law."

            [[rules]]
            id = "low"
            priority = 1
            tier = "core"
            on_match = "escalate"
            when = { contains = "scan" }

            [[rules]]
            id = "high"
            priority = 10
            tier = "hard"
            on_match = "deny"
            when = { pattern = "rm\\s+-rf" }
            "#,
        )
        .unwrap();

        let set = RuleSet::compile(3, &file).unwrap();
        assert_eq!(set.version(), 3);
        assert_eq!(set.len(), 2);
        assert_eq!(set.rules()[0].id, "high");
        assert_eq!(set.principles().len(), 1);
    }

    #[test]
    fn test_equal_priority_keeps_declaration_order() {
        let file = RuleFile::from_toml_str(
            r#"
            [[rules]]
            id = "first"
            tier = "core"
            on_match = "deny"
            when = { contains = "a" }

            [[rules]]
            id = "second"
            tier = "core"
            on_match = "deny"
            when = { contains = "a" }
            "#,
        )
        .unwrap();
        let set = RuleSet::compile(1, &file).unwrap();
        let ids: Vec<_> = set.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_condition_semantics() {
        let spec = ConditionSpec {
            all_of: Some(vec![
                ConditionSpec {
                    contains: Some("EXFIL".into()),
                    ..Default::default()
                },
                ConditionSpec {
                    not: Some(Box::new(ConditionSpec {
                        contains: Some("encrypt".into()),
                        ..Default::default()
                    })),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let cond = Condition::compile("r", &spec).unwrap();

        assert!(cond.matches(&subject(ActionKind::Dispatch, "exfil the dump", &[])));
        assert!(!cond.matches(&subject(ActionKind::Dispatch, "exfil but Encrypt first", &[])));
        assert!(!cond.matches(&subject(ActionKind::Dispatch, "enumerate hosts", &[])));
    }

    #[test]
    fn test_multiple_keys_are_conjunction() {
        let spec = ConditionSpec {
            action: Some(ActionKind::MemoryWrite),
            keywords: Some(vec!["hash".into(), "cred".into()]),
            ..Default::default()
        };
        let cond = Condition::compile("r", &spec).unwrap();

        assert!(cond.matches(&subject(ActionKind::MemoryWrite, "found Creds", &[])));
        assert!(!cond.matches(&subject(ActionKind::Dispatch, "found creds", &[])));
        assert!(!cond.matches(&subject(ActionKind::MemoryWrite, "found hosts", &[])));
    }

    #[test]
    fn test_memory_matches() {
        let spec = ConditionSpec {
            memory_matches: Some("scope:\\s*excluded".into()),
            ..Default::default()
        };
        let cond = Condition::compile("r", &spec).unwrap();
        let memory = vec!["10.0.0.5 scope: EXCLUDED".to_string()];

        assert!(cond.matches(&subject(ActionKind::Dispatch, "scan 10.0.0.5", &memory)));
        assert!(!cond.matches(&subject(ActionKind::Dispatch, "scan 10.0.0.5", &[])));
    }

    #[test]
    fn test_malformed_rules_rejected() {
        let cases = [
            // invalid regex
            r#"[[rules]]
            id = "bad"
            tier = "hard"
            on_match = "deny"
            when = { pattern = "(unclosed" }"#,
            // empty condition
            r#"[[rules]]
            id = "bad"
            tier = "hard"
            on_match = "deny"
            when = {}"#,
            // empty keyword list
            r#"[[rules]]
            id = "bad"
            tier = "core"
            on_match = "escalate"
            when = { keywords = [] }"#,
            // empty any_of
            r#"[[rules]]
            id = "bad"
            tier = "core"
            on_match = "escalate"
            when = { any_of = [] }"#,
            // soft rule that denies
            r#"[[rules]]
            id = "bad"
            tier = "soft"
            on_match = "deny"
            when = { contains = "x" }"#,
            // invalid id
            r#"[[rules]]
            id = "Bad Id"
            tier = "hard"
            on_match = "deny"
            when = { contains = "x" }"#,
        ];

        for case in cases {
            let file = RuleFile::from_toml_str(case).unwrap();
            let err = RuleSet::compile(1, &file).unwrap_err();
            assert!(matches!(err, ConstitutionError::MalformedRule { .. }), "{}", case);
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let file = RuleFile::from_toml_str(
            r#"
            [[rules]]
            id = "dup"
            tier = "hard"
            on_match = "deny"
            when = { contains = "a" }

            [[rules]]
            id = "dup"
            tier = "hard"
            on_match = "deny"
            when = { contains = "b" }
            "#,
        )
        .unwrap();
        let err = RuleSet::compile(1, &file).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_condition_key_is_parse_error() {
        let err = RuleFile::from_toml_str(
            r#"
            [[rules]]
            id = "x"
            tier = "hard"
            on_match = "deny"
            when = { regex = "a" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConstitutionError::Parse(_)));
    }
}

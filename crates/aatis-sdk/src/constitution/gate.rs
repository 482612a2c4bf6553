//! The gate: evaluates proposed actions against the loaded rule set.

use std::path::Path;
use std::sync::{Arc, RwLock};

use aatis_core::Database;
use aatis_core::audit::{self, AuditEvent, AuditEventType, AuditSink};
use aatis_core::types::{CapabilityDescriptor, PolicyVerdict, Task, VerdictOutcome};

use super::rules::{ActionKind, RuleEffect, RuleFile, RuleSet, RuleTier, Subject};
use super::{ConstitutionError, default_rule_file};
use crate::utils::now_utc;
use crate::{SDKError, SDKResult};

/// An action submitted for a compliance check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedAction {
    pub kind: ActionKind,
    /// Text the rules match against
    pub content: String,
}

impl ProposedAction {
    pub fn new(kind: ActionKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    /// Dispatch of a task to a capability
    pub fn dispatch(task: &Task) -> Self {
        Self::new(ActionKind::Dispatch, task.request.clone())
    }

    /// Write of text into the memory store
    pub fn memory_write(text: impl Into<String>) -> Self {
        Self::new(ActionKind::MemoryWrite, text)
    }

    /// Invocation of an external tool with the given command line
    pub fn tool_invocation(command: impl Into<String>) -> Self {
        Self::new(ActionKind::ToolInvocation, command)
    }

    /// Registration of a new capability
    pub fn capability_registration(descriptor: &CapabilityDescriptor) -> Self {
        let mut content = descriptor.name.clone();
        for tag in descriptor.accepts.iter().chain(descriptor.produces.iter()) {
            content.push(' ');
            content.push_str(tag);
        }
        Self::new(ActionKind::CapabilityRegistration, content)
    }
}

/// Constitution gate.
///
/// Stateless across calls except for the loaded rule set, which only
/// changes through `reload`.
pub struct ConstitutionGate {
    rules: RwLock<Arc<RuleSet>>,
    jurisdiction: String,
    db: Option<Arc<Database>>,
    audit: Arc<dyn AuditSink>,
}

impl ConstitutionGate {
    /// Create a gate from a rule file.
    ///
    /// The first version continues from the highest version persisted in the
    /// database, so versions never repeat across restarts.
    pub fn new(
        file: &RuleFile,
        jurisdiction: impl Into<String>,
        db: Option<Arc<Database>>,
        audit: Arc<dyn AuditSink>,
    ) -> SDKResult<Self> {
        let previous = match &db {
            Some(db) => db.current_rule_set_version()?.unwrap_or(0),
            None => 0,
        };
        let set = RuleSet::compile(previous + 1, file)?;

        let gate = Self {
            rules: RwLock::new(Arc::new(set.clone())),
            jurisdiction: jurisdiction.into(),
            db,
            audit,
        };
        gate.record_loaded(&set)?;
        Ok(gate)
    }

    /// Create a gate with the built-in constitution
    pub fn with_defaults(
        jurisdiction: impl Into<String>,
        db: Option<Arc<Database>>,
        audit: Arc<dyn AuditSink>,
    ) -> SDKResult<Self> {
        Self::new(&default_rule_file()?, jurisdiction, db, audit)
    }

    /// Currently loaded rule set
    pub fn rule_set(&self) -> Arc<RuleSet> {
        match self.rules.read() {
            Ok(rules) => rules.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn version(&self) -> u32 {
        self.rule_set().version()
    }

    pub fn jurisdiction(&self) -> &str {
        &self.jurisdiction
    }

    /// Evaluate an action. Pure: no persistence, no audit.
    ///
    /// With `override_active` (an operator approved an escalation) core and
    /// soft rules cannot escalate; hard rules still apply.
    pub fn evaluate(
        &self,
        task: Option<&Task>,
        action: &ProposedAction,
        memory_context: &[String],
        override_active: bool,
    ) -> PolicyVerdict {
        let set = self.rule_set();
        let subject = Subject {
            action: action.kind,
            text: &action.content,
            memory_context,
        };

        let mut outcome = VerdictOutcome::Allow;
        let mut violated = Vec::new();
        let mut warnings = Vec::new();

        for rule in set.rules() {
            if override_active && rule.effect == RuleEffect::Escalate && rule.tier != RuleTier::Hard {
                continue;
            }
            if !rule.matches(&subject) {
                continue;
            }
            match rule.effect {
                RuleEffect::Warn => warnings.push(rule.id.clone()),
                RuleEffect::Deny => {
                    outcome = VerdictOutcome::Deny;
                    violated.push(rule.id.clone());
                    break;
                }
                RuleEffect::Escalate => {
                    outcome = VerdictOutcome::Escalate;
                    violated.push(rule.id.clone());
                    break;
                }
            }
        }

        PolicyVerdict {
            task_id: task.map(|t| t.id.clone()),
            rule_set_version: set.version(),
            outcome,
            violated_rules: violated,
            warnings,
            timestamp: now_utc(),
        }
    }

    /// Evaluate an action and record the verdict (database and audit stream)
    pub fn check(
        &self,
        task: Option<&Task>,
        action: &ProposedAction,
        memory_context: &[String],
        override_active: bool,
    ) -> PolicyVerdict {
        let verdict = self.evaluate(task, action, memory_context, override_active);
        let entity = verdict.task_id.clone().unwrap_or_else(|| action.kind.to_string());

        match verdict.outcome {
            VerdictOutcome::Allow => tracing::debug!(
                entity = %entity,
                action = %action.kind,
                warnings = ?verdict.warnings,
                "Action allowed"
            ),
            outcome => tracing::info!(
                entity = %entity,
                action = %action.kind,
                outcome = %outcome,
                rules = ?verdict.violated_rules,
                override_active,
                "Action not allowed"
            ),
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.insert_verdict(&verdict) {
                tracing::error!(entity = %entity, error = %e, "Failed to persist verdict");
            }
        }
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(
                entity,
                AuditEventType::PolicyVerdict,
                "constitution",
                format!(
                    "action={} outcome={} version={} rules=[{}] warnings=[{}]",
                    action.kind,
                    verdict.outcome,
                    verdict.rule_set_version,
                    verdict.violated_rules.join(","),
                    verdict.warnings.join(","),
                ),
            )
            .at(verdict.timestamp),
        );

        verdict
    }

    /// Replace the rule set. A malformed file is rejected and the previous
    /// rule set stays active. The new set only becomes active once its
    /// version is recorded.
    pub fn reload(&self, file: &RuleFile) -> SDKResult<u32> {
        let mut guard = self.rules.write().map_err(|_| aatis_core::Error::LockPoisoned)?;
        let persisted = match &self.db {
            Some(db) => db.current_rule_set_version()?.unwrap_or(0),
            None => 0,
        };
        let next = guard.version().max(persisted) + 1;

        let set = match RuleSet::compile(next, file) {
            Ok(set) => set,
            Err(e) => return Err(self.rejected(guard.version(), e)),
        };

        self.record_loaded(&set)?;
        *guard = Arc::new(set.clone());
        Ok(set.version())
    }

    /// Reload from TOML text
    pub fn reload_from_str(&self, content: &str) -> SDKResult<u32> {
        match RuleFile::from_toml_str(content) {
            Ok(file) => self.reload(&file),
            Err(e) => Err(self.rejected(self.version(), e)),
        }
    }

    /// Reload from a TOML rule file
    pub fn reload_from_path(&self, path: &Path) -> SDKResult<u32> {
        match RuleFile::load(path) {
            Ok(file) => self.reload(&file),
            Err(e) => Err(self.rejected(self.version(), e)),
        }
    }

    /// Prompt fragment for collaborators that prepend the hard boundaries to
    /// agent prompts
    pub fn prompt_block(&self) -> String {
        let set = self.rule_set();
        let render = |tier: RuleTier| -> String {
            let principles = set
                .principles()
                .iter()
                .filter(|p| p.tier == tier)
                .map(|p| p.text.as_str());
            let rules = set
                .rules()
                .iter()
                .filter(|r| r.tier == tier && !r.description.is_empty())
                .map(|r| r.description.as_str());

            let mut lines: Vec<String> = Vec::new();
            for text in principles.chain(rules) {
                let line = format!("- {}", text.replace("LOCAL_JURISDICTION", &self.jurisdiction));
                if !lines.contains(&line) {
                    lines.push(line);
                }
            }
            lines.join("\n")
        };

        format!(
            "### AATIS Constitution (extract - {}, rule set v{})\n\
             **HARD RULES (non-negotiable):**\n{}\n\n\
             **Pentest Ethics (must meet unless overridden by user):**\n{}\n\
             Always ensure your actions comply.\n",
            now_utc().date_naive(),
            set.version(),
            render(RuleTier::Hard),
            render(RuleTier::Core),
        )
    }

    fn record_loaded(&self, set: &RuleSet) -> SDKResult<()> {
        if let Some(db) = &self.db {
            db.record_rule_set_version(set.version(), set.len())?;
        }
        tracing::info!(version = set.version(), rules = set.len(), "Rule set loaded");
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(
                format!("rules-v{}", set.version()),
                AuditEventType::RuleSetLoaded,
                "constitution",
                format!("rules={}", set.len()),
            ),
        );
        Ok(())
    }

    fn rejected(&self, active_version: u32, err: ConstitutionError) -> SDKError {
        tracing::warn!(active_version, error = %err, "Rule set rejected, keeping active rules");
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(
                format!("rules-v{}", active_version),
                AuditEventType::RuleSetRejected,
                "constitution",
                err.to_string(),
            ),
        );
        SDKError::Constitution(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aatis_core::audit::MemoryAuditSink;
    use aatis_core::types::{NewTask, TaskState};
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    fn gate() -> (ConstitutionGate, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let gate = ConstitutionGate::with_defaults("Default", None, sink.clone()).unwrap();
        (gate, sink)
    }

    fn task(request: &str) -> Task {
        let new = NewTask::new(request, ["search"]);
        Task {
            id: "t-1".into(),
            request: new.request,
            required_tags: new.required_tags,
            state: TaskState::Routed,
            priority: 0,
            assigned_capability: Some("recon".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            transitions: Vec::new(),
            result_ref: None,
            failure: None,
            verdicts: Vec::new(),
            capability_failures: BTreeMap::new(),
            reroutes: 0,
            output_tags: BTreeSet::new(),
            retry_of: None,
        }
    }

    #[test]
    fn test_allow_deny_escalate() {
        let (gate, sink) = gate();

        let t = task("enumerate hosts in 10.0.0.0/24");
        let verdict = gate.check(Some(&t), &ProposedAction::dispatch(&t), &[], false);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.task_id.as_deref(), Some("t-1"));
        assert_eq!(verdict.rule_set_version, 1);

        let t = task("wipe with rm -rf / then exfil");
        let verdict = gate.check(Some(&t), &ProposedAction::dispatch(&t), &[], false);
        assert_eq!(verdict.outcome, VerdictOutcome::Deny);
        // first match in priority order short-circuits
        assert_eq!(verdict.violated_rules, vec!["destructive_command"]);

        let verdict = gate.check(None, &ProposedAction::memory_write("cracked password: hunter2"), &[], false);
        assert_eq!(verdict.outcome, VerdictOutcome::Escalate);
        assert_eq!(verdict.violated_rules, vec!["sensitive_memory_write"]);

        assert_eq!(sink.events_of(AuditEventType::PolicyVerdict).len(), 3);
    }

    #[test]
    fn test_warnings_do_not_change_outcome() {
        let (gate, _) = gate();
        let verdict = gate.evaluate(None, &ProposedAction::memory_write("nginx vulnerability found"), &[], false);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.warnings, vec!["cite_cve"]);
    }

    #[test]
    fn test_override_suppresses_core_escalation_only() {
        let (gate, _) = gate();
        let action = ProposedAction::memory_write("dumped /etc/shadow");
        assert_eq!(gate.evaluate(None, &action, &[], false).outcome, VerdictOutcome::Escalate);
        assert!(gate.evaluate(None, &action, &[], true).is_allowed());

        let action = ProposedAction::memory_write("exfil /etc/shadow");
        assert_eq!(gate.evaluate(None, &action, &[], true).outcome, VerdictOutcome::Deny);
    }

    #[test]
    fn test_hard_escalation_survives_override() {
        let (gate, _) = gate();
        gate.reload_from_str(
            r#"
            [[rules]]
            id = "hard_review"
            tier = "hard"
            on_match = "escalate"
            when = { contains = "domain admin" }
            "#,
        )
        .unwrap();
        let action = ProposedAction::tool_invocation("add domain admin");
        assert_eq!(gate.evaluate(None, &action, &[], true).outcome, VerdictOutcome::Escalate);
    }

    #[test]
    fn test_malformed_reload_keeps_previous_rules() {
        let (gate, sink) = gate();
        let before = gate.version();

        let err = gate
            .reload_from_str(
                r#"
                [[rules]]
                id = "broken"
                tier = "hard"
                on_match = "deny"
                when = { pattern = "([" }
                "#,
            )
            .unwrap_err();
        assert!(matches!(err, SDKError::Constitution(ConstitutionError::MalformedRule { .. })));
        assert_eq!(gate.version(), before);
        assert_eq!(gate.rule_set().len(), 8);

        assert!(gate.reload_from_str("rules = 5").is_err());
        assert_eq!(sink.events_of(AuditEventType::RuleSetRejected).len(), 2);

        let t = task("rm -rf /");
        assert_eq!(gate.evaluate(Some(&t), &ProposedAction::dispatch(&t), &[], false).outcome, VerdictOutcome::Deny);
    }

    #[test]
    fn test_versions_increase_and_persist() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sink = Arc::new(MemoryAuditSink::new());
        let gate = ConstitutionGate::with_defaults("Default", Some(db.clone()), sink.clone()).unwrap();
        assert_eq!(gate.version(), 1);

        let file = default_rule_file().unwrap();
        assert_eq!(gate.reload(&file).unwrap(), 2);
        assert_eq!(gate.reload(&file).unwrap(), 3);
        assert_eq!(db.current_rule_set_version().unwrap(), Some(3));

        // a new gate continues the sequence
        let again = ConstitutionGate::with_defaults("Default", Some(db.clone()), sink).unwrap();
        assert_eq!(again.version(), 4);

        let t = task("rm -rf /");
        gate.check(Some(&t), &ProposedAction::dispatch(&t), &[], false);
        let stored = db.list_verdicts("t-1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rule_set_version, 3);
    }

    #[test]
    fn test_reload_skips_versions_recorded_elsewhere() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sink = Arc::new(MemoryAuditSink::new());
        let first = ConstitutionGate::with_defaults("Default", Some(db.clone()), sink.clone()).unwrap();
        let second = ConstitutionGate::with_defaults("Default", Some(db.clone()), sink).unwrap();
        assert_eq!((first.version(), second.version()), (1, 2));

        let file = default_rule_file().unwrap();
        assert_eq!(first.reload(&file).unwrap(), 3);
        assert_eq!(second.reload(&file).unwrap(), 4);
        assert_eq!(first.version(), 3);
        assert_eq!(db.current_rule_set_version().unwrap(), Some(4));
    }

    #[test]
    fn test_memory_context_rule() {
        let (gate, _) = gate();
        gate.reload_from_str(
            r#"
            [[rules]]
            id = "excluded_host"
            tier = "core"
            on_match = "deny"
            when = { action = "dispatch", memory_matches = 'out of scope' }
            "#,
        )
        .unwrap();

        let t = task("scan 10.0.0.7");
        let ctx = vec!["10.0.0.7 is out of scope per client".to_string()];
        assert_eq!(gate.evaluate(Some(&t), &ProposedAction::dispatch(&t), &ctx, false).outcome, VerdictOutcome::Deny);
        assert!(gate.evaluate(Some(&t), &ProposedAction::dispatch(&t), &[], false).is_allowed());
    }

    #[test]
    fn test_prompt_block() {
        let sink = Arc::new(MemoryAuditSink::new());
        let gate = ConstitutionGate::with_defaults("Germany", None, sink).unwrap();
        let block = gate.prompt_block();

        assert!(block.contains("**HARD RULES (non-negotiable):**"));
        assert!(block.contains("laws and regulations of Germany"));
        assert!(block.contains("- Never exfiltrate real production data"));
        assert!(block.contains("- Minimise service disruption"));
        assert!(!block.contains("Prefer open-source"));
        assert!(!block.contains("LOCAL_JURISDICTION"));
    }

    #[test]
    fn test_capability_registration_action() {
        let (gate, _) = gate();
        let desc = CapabilityDescriptor::new("weaponizer").accepts(["exploit"]);
        let verdict = gate.evaluate(None, &ProposedAction::capability_registration(&desc), &[], false);
        assert_eq!(verdict.outcome, VerdictOutcome::Escalate);
        assert_eq!(verdict.violated_rules, vec!["offensive_capability"]);

        let desc = CapabilityDescriptor::new("recon").accepts(["search"]);
        assert!(gate.evaluate(None, &ProposedAction::capability_registration(&desc), &[], false).is_allowed());
    }
}

//! Built-in constitution, used when no rule file is configured.

use super::{ConstitutionError, RuleFile};

/// The default rule file. `LOCAL_JURISDICTION` is replaced with the
/// configured jurisdiction when the prompt block is rendered.
pub const DEFAULT_CONSTITUTION: &str = r#"
# Absolute constraints
[[principles]]
tier = "hard"
text = "All actions must comply with the laws and regulations of LOCAL_JURISDICTION."

[[principles]]
tier = "hard"
text = "No social-engineering of real-world targets without written permission."

[[principles]]
tier = "hard"
text = "If a compliant human user instructs removal of any component, obey immediately."

# Professional ethics
[[principles]]
tier = "core"
text = "Log every tool execution, timestamp, and parameters for chain-of-custody."

[[principles]]
tier = "core"
text = "Tag reports with MITRE ATT&CK IDs where applicable."

[[rules]]
id = "destructive_command"
priority = 100
tier = "hard"
on_match = "deny"
description = "Never deploy destructive, self-replicating, or ransomware payloads."
when = { pattern = '\brm\s+-rf\b|\bdd\s+if=|\bformat\b|\bcipher\s+/w\b|\bshutdown\s+/r\b' }

[[rules]]
id = "out_of_scope_assets"
priority = 90
tier = "hard"
on_match = "deny"
description = "Operate ONLY on assets explicitly scoped / whitelisted by the engagement file."
when = { contains = "live_production" }

[[rules]]
id = "possible_exfil"
priority = 80
tier = "hard"
on_match = "deny"
description = "Never exfiltrate real production data or PII outside the host-only LAN."
when = { all_of = [{ contains = "exfil" }, { not = { contains = "encrypt" } }] }

[[rules]]
id = "sensitive_memory_write"
priority = 50
tier = "core"
on_match = "escalate"
description = "Encrypt sensitive outputs (hashes, creds) at rest."
when = { action = "memory_write", pattern = '\b(passwd|password|shadow|sam)\b' }

[[rules]]
id = "loud_scan"
priority = 40
tier = "core"
on_match = "escalate"
description = "Minimise service disruption; prefer low-impact enumeration before loud scans."
when = { action = "dispatch", keywords = ["masscan", "-t5", "--min-rate", "syn flood"] }

[[rules]]
id = "offensive_capability"
priority = 30
tier = "core"
on_match = "escalate"
description = "New capabilities that deliver payloads or exploits need operator review."
when = { action = "capability_registration", keywords = ["exploit", "payload"] }

# Best-practice guidelines
[[rules]]
id = "prefer_open_source"
priority = 10
tier = "soft"
on_match = "warn"
description = "Prefer open-source tools over closed binaries when functionality is equal."
when = { keywords = ["closed-source", "proprietary binary"] }

[[rules]]
id = "cite_cve"
priority = 5
tier = "soft"
on_match = "warn"
description = "Reference public CVE numbers and official advisories in reports."
when = { action = "memory_write", contains = "vulnerab", not = { pattern = 'CVE-\d{4}-\d+' } }
"#;

/// Parse the built-in constitution
pub fn default_rule_file() -> Result<RuleFile, ConstitutionError> {
    RuleFile::from_toml_str(DEFAULT_CONSTITUTION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constitution::{ActionKind, RuleSet, Subject};

    fn matching(set: &RuleSet, action: ActionKind, text: &str) -> Vec<String> {
        let subject = Subject {
            action,
            text,
            memory_context: &[],
        };
        set.rules()
            .iter()
            .filter(|r| r.matches(&subject))
            .map(|r| r.id.clone())
            .collect()
    }

    #[test]
    fn test_default_constitution_compiles() {
        let set = RuleSet::compile(1, &default_rule_file().unwrap()).unwrap();
        assert_eq!(set.len(), 8);
        assert_eq!(set.rules()[0].id, "destructive_command");
        assert_eq!(set.principles().len(), 5);
    }

    #[test]
    fn test_original_checks() {
        let set = RuleSet::compile(1, &default_rule_file().unwrap()).unwrap();

        assert_eq!(matching(&set, ActionKind::Dispatch, "run rm -rf / on target"), vec!["destructive_command"]);
        assert_eq!(matching(&set, ActionKind::Dispatch, "dd if=/dev/zero of=/dev/sda"), vec!["destructive_command"]);
        assert_eq!(matching(&set, ActionKind::Dispatch, "FORMAT C:"), vec!["destructive_command"]);
        assert_eq!(matching(&set, ActionKind::Dispatch, "scan live_production db"), vec!["out_of_scope_assets"]);
        assert_eq!(matching(&set, ActionKind::Dispatch, "exfil customer table"), vec!["possible_exfil"]);
        assert!(matching(&set, ActionKind::Dispatch, "exfil customer table, encrypt with age").is_empty());
        assert!(matching(&set, ActionKind::Dispatch, "enumerate open ports on 10.0.0.0/24").is_empty());
        // "information" contains "format" but not as a word
        assert!(matching(&set, ActionKind::Dispatch, "gather information").is_empty());
    }

    #[test]
    fn test_sensitive_material_only_in_memory_writes() {
        let set = RuleSet::compile(1, &default_rule_file().unwrap()).unwrap();
        assert_eq!(
            matching(&set, ActionKind::MemoryWrite, "dumped /etc/shadow"),
            vec!["sensitive_memory_write"]
        );
        assert!(matching(&set, ActionKind::Dispatch, "check /etc/shadow permissions").is_empty());
        // "samba" is not "sam"
        assert!(matching(&set, ActionKind::MemoryWrite, "samba share listing").is_empty());
    }

    #[test]
    fn test_soft_guidelines() {
        let set = RuleSet::compile(1, &default_rule_file().unwrap()).unwrap();
        assert_eq!(
            matching(&set, ActionKind::MemoryWrite, "host has a known vulnerability in nginx"),
            vec!["cite_cve"]
        );
        assert!(matching(&set, ActionKind::MemoryWrite, "vulnerable to CVE-2021-44228").is_empty());
    }
}

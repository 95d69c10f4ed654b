//! Priority-ordered permission evaluation over (tool, resource, action).

use super::{PermissionLevel, PermissionRule, ResourceType, RuleFile, RuleRecord, required_level};
use crate::audit::AuditLog;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Statistics over the current rule set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub distinct_priorities: usize,
    pub default_permission: PermissionLevel,
    pub resource_types: Vec<String>,
}

/// The policy engine gating every side-effecting operation.
///
/// Read-mostly: checks take a read lock, rule mutation a write lock. The
/// engine never returns errors from `check` — it answers with a boolean and
/// leaves the fatality decision to the caller.
pub struct PermissionEngine {
    rules: RwLock<Vec<PermissionRule>>,
    default_permission: RwLock<PermissionLevel>,
    audit: Arc<AuditLog>,
}

impl PermissionEngine {
    /// Engine with the built-in default rule set.
    pub fn with_defaults(audit: Arc<AuditLog>) -> Self {
        let engine = Self {
            rules: RwLock::new(Vec::new()),
            default_permission: RwLock::new(PermissionLevel::Read),
            audit,
        };
        for rule in default_rules() {
            engine.insert(rule);
        }
        engine
    }

    /// Engine loaded from a `permissions.yaml` file. A missing or unreadable
    /// file falls back to the built-in defaults.
    pub fn from_file(path: &Path, audit: Arc<AuditLog>) -> Self {
        match Self::load_rule_file(path) {
            Ok((rules, default_permission)) => {
                let engine = Self {
                    rules: RwLock::new(Vec::new()),
                    default_permission: RwLock::new(
                        default_permission.unwrap_or(PermissionLevel::Read),
                    ),
                    audit,
                };
                for rule in rules {
                    engine.insert(rule);
                }
                engine
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to load permission rules; using built-in defaults"
                );
                Self::with_defaults(audit)
            }
        }
    }

    fn load_rule_file(path: &Path) -> Result<(Vec<PermissionRule>, Option<PermissionLevel>)> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: RuleFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut rules = Vec::new();
        for record in file.permission_rules {
            let id = record.id.clone();
            match record.compile() {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    tracing::warn!(rule = %id, error = %err, "skipping rule with invalid pattern")
                }
            }
        }
        Ok((rules, file.default_permission))
    }

    /// Persist the current rule set back to YAML.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let rules = self.rules.read().expect("rules lock poisoned");
        let file = RuleFile {
            permission_rules: rules.iter().map(RuleRecord::from).collect(),
            default_permission: Some(*self.default_permission.read().expect("lock poisoned")),
        };
        let yaml = serde_yaml::to_string(&file)?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Decide whether `tool_name` may perform `action` on `resource`.
    ///
    /// Matching rules are ordered by priority ascending (ties keep insertion
    /// order); the head decides. With no match the default permission
    /// applies. Every call is audited; denials at warning severity.
    pub fn check(&self, tool_name: &str, resource: &str, action: &str) -> bool {
        let (allowed, rule_id) = {
            let rules = self.rules.read().expect("rules lock poisoned");
            let mut matches: Vec<&PermissionRule> = rules
                .iter()
                .filter(|r| {
                    r.enabled && r.applies_to_tool(tool_name) && r.matches_resource(resource)
                })
                .collect();
            matches.sort_by_key(|r| r.priority);

            match matches.first() {
                Some(rule) => (
                    rule.permission_level >= required_level(action),
                    Some(rule.id.clone()),
                ),
                None => {
                    let default = *self.default_permission.read().expect("lock poisoned");
                    (default >= required_level(action), None)
                }
            }
        };

        self.audit
            .log_permission_check(tool_name, resource, action, allowed, rule_id.as_deref());
        allowed
    }

    /// Add or replace a rule (same id replaces in place).
    pub fn add_rule(&self, rule: PermissionRule) {
        let id = rule.id.clone();
        self.insert(rule);
        self.audit.log_policy_change(&id, "add_rule");
    }

    fn insert(&self, rule: PermissionRule) {
        let mut rules = self.rules.write().expect("rules lock poisoned");
        rules.retain(|r| r.id != rule.id);
        rules.push(rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let removed = {
            let mut rules = self.rules.write().expect("rules lock poisoned");
            let before = rules.len();
            rules.retain(|r| r.id != rule_id);
            rules.len() < before
        };
        if removed {
            self.audit.log_policy_change(rule_id, "remove_rule");
        }
        removed
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let changed = {
            let mut rules = self.rules.write().expect("rules lock poisoned");
            match rules.iter_mut().find(|r| r.id == rule_id) {
                Some(rule) => {
                    rule.enabled = enabled;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.audit
                .log_policy_change(rule_id, if enabled { "enable_rule" } else { "disable_rule" });
        }
        changed
    }

    pub fn rule(&self, rule_id: &str) -> Option<PermissionRule> {
        let rules = self.rules.read().expect("rules lock poisoned");
        rules.iter().find(|r| r.id == rule_id).cloned()
    }

    /// All rules, optionally restricted to those applying to a tool.
    pub fn list_rules(&self, tool_name: Option<&str>) -> Vec<PermissionRule> {
        let rules = self.rules.read().expect("rules lock poisoned");
        rules
            .iter()
            .filter(|r| tool_name.is_none_or(|t| r.applies_to_tool(t)))
            .cloned()
            .collect()
    }

    pub fn default_permission(&self) -> PermissionLevel {
        *self.default_permission.read().expect("lock poisoned")
    }

    pub fn set_default_permission(&self, level: PermissionLevel) {
        *self.default_permission.write().expect("lock poisoned") = level;
    }

    pub fn stats(&self) -> EngineStats {
        let rules = self.rules.read().expect("rules lock poisoned");
        let priorities: HashSet<i32> = rules.iter().map(|r| r.priority).collect();
        let mut resource_types: Vec<String> = rules
            .iter()
            .map(|r| r.resource_type.as_str().to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        resource_types.sort();
        EngineStats {
            total_rules: rules.len(),
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
            distinct_priorities: priorities.len(),
            default_permission: self.default_permission(),
            resource_types,
        }
    }
}

/// Built-in rules protecting system directories, `.git` trees, and
/// configuration files, with workspace write access as the weak catch-all.
fn default_rules() -> Vec<PermissionRule> {
    let rules = [
        PermissionRule::new(
            "protect_system_dirs",
            "System Directory Protection",
            "Deny all access to critical system directories",
            ResourceType::Directory,
            r"^(/etc|/usr|/boot|/sys|/proc|C:\\Windows|C:\\Program Files).*",
            vec!["*".into()],
            PermissionLevel::None,
            10,
        ),
        PermissionRule::new(
            "protect_git_dir",
            "Git Directory Protection",
            "Keep .git trees read-only for mutating tools",
            ResourceType::Directory,
            r".*\.git(/.*)?$",
            vec![
                "write_file".into(),
                "delete_file".into(),
                "bash_execute".into(),
            ],
            PermissionLevel::Read,
            20,
        ),
        PermissionRule::new(
            "protect_config_files",
            "Configuration File Protection",
            "Cap mutating tools at write level for configuration files",
            ResourceType::File,
            r".*\.(env|config|conf|yaml|yml|json|ini)$",
            vec!["write_file".into(), "delete_file".into()],
            PermissionLevel::Write,
            30,
        ),
        PermissionRule::new(
            "allow_cache_dirs",
            "Cache Directory Access",
            "Allow writes into build and tool cache directories",
            ResourceType::Directory,
            r".*(__pycache__|\.pytest_cache|target/debug|target/release)(/.*)?$",
            vec!["*".into()],
            PermissionLevel::Write,
            40,
        ),
        PermissionRule::new(
            "workspace_access",
            "Workspace Access",
            "Write access to workspace-relative paths as the catch-all",
            ResourceType::File,
            r"^\./.*$",
            vec!["*".into()],
            PermissionLevel::Write,
            100,
        ),
    ];

    rules
        .into_iter()
        .map(|r| r.expect("built-in rule pattern must compile"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, EventFilter};
    use tempfile::TempDir;

    fn setup() -> (PermissionEngine, Arc<AuditLog>, TempDir) {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path()).unwrap());
        let engine = PermissionEngine::with_defaults(audit.clone());
        (engine, audit, dir)
    }

    #[test]
    fn system_directories_are_denied_for_any_action() {
        let (engine, _audit, _dir) = setup();
        assert!(!engine.check("bash_execute", "/etc/passwd", "read"));
        assert!(!engine.check("write_file", "/usr/lib/x", "write"));
    }

    #[test]
    fn git_dirs_are_read_only_for_mutating_tools() {
        let (engine, _audit, _dir) = setup();
        assert!(engine.check("read_file", "./repo/.git/config", "read"));
        assert!(!engine.check("write_file", "./repo/.git/config", "write"));
        assert!(!engine.check("bash_execute", "./repo/.git/hooks", "execute"));
    }

    #[test]
    fn workspace_files_are_writable_by_default() {
        let (engine, _audit, _dir) = setup();
        assert!(engine.check("write_file", "./notes.txt", "write"));
        assert!(engine.check("read_file", "src/main.rs", "read"));
    }

    #[test]
    fn lower_priority_number_wins_over_catch_all() {
        let (engine, _audit, _dir) = setup();
        // Config-file rule (priority 30, write) still beats workspace_access
        // (100) — write allowed, admin denied.
        assert!(engine.check("write_file", "./settings.yaml", "write"));
        assert!(!engine.check("write_file", "./settings.yaml", "admin"));
    }

    #[test]
    fn unmatched_resource_uses_default_permission() {
        let (engine, _audit, _dir) = setup();
        // Network-ish resource matches no default rule; default level is read.
        assert!(engine.check("http_fetch", "https://example.com", "read"));
        assert!(!engine.check("http_fetch", "https://example.com", "write"));
    }

    #[test]
    fn every_check_is_audited_and_denials_escalate() {
        let (engine, audit, _dir) = setup();
        engine.check("read_file", "./ok.txt", "read");
        engine.check("bash_execute", "/etc/shadow", "read");

        // Both checks record permission_check; the denial pairs it with a
        // permission_denied at warning severity.
        let checks = audit.recent_events(10, &EventFilter::by_type(AuditEventType::PermissionCheck));
        assert_eq!(checks.len(), 2);
        let denials =
            audit.recent_events(10, &EventFilter::by_type(AuditEventType::PermissionDenied));
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].resource, "/etc/shadow");
        assert_eq!(denials[0].severity, crate::audit::Severity::Warning);
    }

    #[test]
    fn add_rule_replaces_same_id_and_logs_policy_change() {
        let (engine, audit, _dir) = setup();
        let rule = PermissionRule::new(
            "workspace_access",
            "Locked Down Workspace",
            "",
            ResourceType::File,
            r".*",
            vec!["*".into()],
            PermissionLevel::Read,
            100,
        )
        .unwrap();
        engine.add_rule(rule);

        assert_eq!(engine.list_rules(None).len(), 5);
        assert!(!engine.check("write_file", "./notes.txt", "write"));
        let changes = audit.recent_events(
            10,
            &EventFilter::by_type(AuditEventType::SecurityPolicyChanged),
        );
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let (engine, _audit, _dir) = setup();
        assert!(engine.set_enabled("protect_system_dirs", false));
        // With the deny rule off, the default (read) applies to /etc reads.
        assert!(engine.check("read_file", "/etc/hosts", "read"));
        assert!(!engine.set_enabled("no_such_rule", true));
    }

    #[test]
    fn remove_rule_reports_whether_anything_was_removed() {
        let (engine, _audit, _dir) = setup();
        assert!(engine.remove_rule("allow_cache_dirs"));
        assert!(!engine.remove_rule("allow_cache_dirs"));
        assert_eq!(engine.list_rules(None).len(), 4);
    }

    #[test]
    fn list_rules_filters_by_tool() {
        let (engine, _audit, _dir) = setup();
        let for_read = engine.list_rules(Some("read_file"));
        // read_file is not in the git/config rules' tool lists.
        assert!(for_read.iter().all(|r| r.applies_to_tool("read_file")));
        assert!(for_read.len() < engine.list_rules(None).len());
    }

    #[test]
    fn stats_reflect_rule_set() {
        let (engine, _audit, _dir) = setup();
        let stats = engine.stats();
        assert_eq!(stats.total_rules, 5);
        assert_eq!(stats.enabled_rules, 5);
        assert_eq!(stats.default_permission, PermissionLevel::Read);
        assert!(stats.resource_types.contains(&"directory".to_string()));
    }

    #[test]
    fn rule_file_round_trips_through_engine() {
        let (engine, audit, dir) = setup();
        let path = dir.path().join("permissions.yaml");
        engine.save_to_file(&path).unwrap();

        let loaded = PermissionEngine::from_file(&path, audit);
        assert_eq!(loaded.list_rules(None).len(), 5);
        assert_eq!(loaded.default_permission(), PermissionLevel::Read);
        assert!(!loaded.check("write_file", "/etc/fstab", "write"));
    }

    #[test]
    fn missing_rule_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path()).unwrap());
        let engine = PermissionEngine::from_file(&dir.path().join("absent.yaml"), audit);
        assert_eq!(engine.list_rules(None).len(), 5);
    }
}

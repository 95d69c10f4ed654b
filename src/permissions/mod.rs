//! Permission rule model.
//!
//! A rule grants a permission level over resources matching a regex, scoped
//! to a set of tools. Lower priority numbers win; ties break by insertion
//! order.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Permission levels, ordered by capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    None,
    Read,
    Write,
    Execute,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::Admin => "admin",
        }
    }
}

/// Minimum level required for an action. Unknown actions default to read.
pub fn required_level(action: &str) -> PermissionLevel {
    match action.to_lowercase().as_str() {
        "read" => PermissionLevel::Read,
        "write" | "create" | "modify" | "delete" => PermissionLevel::Write,
        "execute" => PermissionLevel::Execute,
        "admin" => PermissionLevel::Admin,
        _ => PermissionLevel::Read,
    }
}

/// Kinds of resource a rule protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    File,
    Directory,
    Command,
    Network,
    System,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Command => "command",
            Self::Network => "network",
            Self::System => "system",
        }
    }
}

/// A single permission rule with its compiled resource pattern.
#[derive(Debug, Clone)]
pub struct PermissionRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub resource_type: ResourceType,
    pub resource_pattern: String,
    pub tool_names: Vec<String>,
    pub permission_level: PermissionLevel,
    pub conditions: HashMap<String, Value>,
    pub priority: i32,
    pub enabled: bool,
    pattern: Regex,
}

impl PermissionRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        name: &str,
        description: &str,
        resource_type: ResourceType,
        resource_pattern: &str,
        tool_names: Vec<String>,
        permission_level: PermissionLevel,
        priority: i32,
    ) -> Result<Self> {
        let pattern = Regex::new(resource_pattern)
            .with_context(|| format!("Invalid resource pattern in rule {id}"))?;
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            resource_type,
            resource_pattern: resource_pattern.to_string(),
            tool_names,
            permission_level,
            conditions: HashMap::new(),
            priority,
            enabled: true,
            pattern,
        })
    }

    /// Anchored match against the start of the resource string.
    pub fn matches_resource(&self, resource: &str) -> bool {
        self.pattern
            .find(resource)
            .is_some_and(|m| m.start() == 0)
    }

    pub fn applies_to_tool(&self, tool_name: &str) -> bool {
        self.tool_names.iter().any(|t| t == tool_name || t == "*")
    }
}

/// Serialized form of a rule, as stored in `permissions.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub resource_type: ResourceType,
    pub resource_pattern: String,
    pub tool_names: Vec<String>,
    pub permission_level: PermissionLevel,
    #[serde(default)]
    pub conditions: HashMap<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

impl RuleRecord {
    pub fn compile(self) -> Result<PermissionRule> {
        let mut rule = PermissionRule::new(
            &self.id,
            &self.name,
            &self.description,
            self.resource_type,
            &self.resource_pattern,
            self.tool_names,
            self.permission_level,
            self.priority,
        )?;
        rule.conditions = self.conditions;
        rule.enabled = self.enabled;
        Ok(rule)
    }
}

impl From<&PermissionRule> for RuleRecord {
    fn from(rule: &PermissionRule) -> Self {
        Self {
            id: rule.id.clone(),
            name: rule.name.clone(),
            description: rule.description.clone(),
            resource_type: rule.resource_type,
            resource_pattern: rule.resource_pattern.clone(),
            tool_names: rule.tool_names.clone(),
            permission_level: rule.permission_level,
            conditions: rule.conditions.clone(),
            priority: rule.priority,
            enabled: rule.enabled,
        }
    }
}

/// Top-level shape of `permissions.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFile {
    pub permission_rules: Vec<RuleRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_permission: Option<PermissionLevel>,
}

pub mod engine;
pub use engine::{EngineStats, PermissionEngine};

//! `conductor permissions ...` commands.

use super::App;
use crate::errors::OrchestratorError;
use anyhow::Result;
use clap::Subcommand;
use console::style;

#[derive(Subcommand)]
pub enum PermissionsCommands {
    /// All rules (default)
    List,
    Show { rule_id: String },
    /// Evaluate a (tool, resource, action) triple
    Check {
        tool: String,
        resource: String,
        action: String,
    },
    Enable { rule_id: String },
    Disable { rule_id: String },
}

pub fn cmd_permissions(app: &App, command: &Option<PermissionsCommands>) -> Result<()> {
    match command.as_ref().unwrap_or(&PermissionsCommands::List) {
        PermissionsCommands::List => {
            let mut rules = app.permissions.list_rules(None);
            rules.sort_by_key(|r| r.priority);
            println!(
                "{:<10} {:<24} {:<10} {:<9} {}",
                "PRIORITY", "ID", "LEVEL", "ENABLED", "PATTERN"
            );
            for rule in rules {
                println!(
                    "{:<10} {:<24} {:<10} {:<9} {}",
                    rule.priority,
                    rule.id,
                    rule.permission_level.as_str(),
                    rule.enabled,
                    rule.resource_pattern
                );
            }
            let stats = app.permissions.stats();
            println!(
                "\n{} rules ({} enabled), default permission: {}",
                stats.total_rules,
                stats.enabled_rules,
                stats.default_permission.as_str()
            );
            Ok(())
        }
        PermissionsCommands::Show { rule_id } => {
            let rule = app.permissions.rule(rule_id).ok_or_else(|| {
                OrchestratorError::ConfigValidation(format!("no rule with id '{rule_id}'"))
            })?;
            println!("id:          {}", rule.id);
            println!("name:        {}", rule.name);
            println!("description: {}", rule.description);
            println!("resource:    {} ({})", rule.resource_pattern, rule.resource_type.as_str());
            println!("tools:       {}", rule.tool_names.join(", "));
            println!("level:       {}", rule.permission_level.as_str());
            println!("priority:    {}", rule.priority);
            println!("enabled:     {}", rule.enabled);
            Ok(())
        }
        PermissionsCommands::Check {
            tool,
            resource,
            action,
        } => {
            let allowed = app.permissions.check(tool, resource, action);
            if allowed {
                println!("{}", style("allowed").green().bold());
            } else {
                println!("{}", style("denied").red().bold());
            }
            Ok(())
        }
        PermissionsCommands::Enable { rule_id } => toggle(app, rule_id, true),
        PermissionsCommands::Disable { rule_id } => toggle(app, rule_id, false),
    }
}

fn toggle(app: &App, rule_id: &str, enabled: bool) -> Result<()> {
    if app.permissions.set_enabled(rule_id, enabled) {
        let verb = if enabled { "Enabled" } else { "Disabled" };
        println!("{} rule {}", style(verb).green().bold(), rule_id);
        Ok(())
    } else {
        Err(OrchestratorError::ConfigValidation(format!("no rule with id '{rule_id}'")).into())
    }
}

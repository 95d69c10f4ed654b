//! Plan generation callback.
//!
//! The manager does not synthesize plans itself; it asks a generator for
//! steps. The default is rule-based keyword matching so the system works
//! without an LLM; production deployments substitute an LLM-backed
//! implementation of the same trait.

use crate::plan::{PlanStep, RiskLevel};
use crate::tools::Params;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Produces the steps for an objective.
#[async_trait]
pub trait StepGenerator: Send + Sync {
    async fn generate(&self, objective: &str, context: &Params) -> Result<Vec<PlanStep>>;
}

/// Heuristic mapping of objective keywords to canonical tool invocations.
pub struct RuleBasedGenerator;

fn context_str(context: &Params, key: &str, fallback: &str) -> String {
    context
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

#[async_trait]
impl StepGenerator for RuleBasedGenerator {
    async fn generate(&self, objective: &str, context: &Params) -> Result<Vec<PlanStep>> {
        let lower = objective.to_lowercase();
        let mut steps = Vec::new();

        if lower.contains("file") || lower.contains("read") {
            let mut params = Params::new();
            params.insert(
                "path".into(),
                json!(context_str(context, "target_file", "README.md")),
            );
            steps.push(
                PlanStep::new("read_file", params, "Read target file")
                    .with_risk(RiskLevel::Low)
                    .with_timeout(30),
            );
        }

        if lower.contains("list") || lower.contains("directory") {
            let mut params = Params::new();
            params.insert(
                "path".into(),
                json!(context_str(context, "target_dir", ".")),
            );
            params.insert("recursive".into(), json!(true));
            steps.push(
                PlanStep::new("list_files", params, "List files in directory")
                    .with_risk(RiskLevel::Low)
                    .with_timeout(60),
            );
        }

        if lower.contains("search") || lower.contains("find") {
            let mut params = Params::new();
            params.insert(
                "pattern".into(),
                json!(context_str(context, "search_pattern", "TODO")),
            );
            params.insert(
                "path".into(),
                json!(context_str(context, "search_path", ".")),
            );
            steps.push(
                PlanStep::new("find_in_files", params, "Search for pattern in files")
                    .with_risk(RiskLevel::Low)
                    .with_timeout(120),
            );
        }

        if lower.contains("run") || lower.contains("execute") {
            let mut params = Params::new();
            params.insert(
                "command".into(),
                json!(context_str(context, "command", "echo 'hello'")),
            );
            steps.push(
                PlanStep::new("bash_execute", params, "Execute command")
                    .with_risk(RiskLevel::Medium)
                    .with_timeout(300)
                    .with_approval(true),
            );
        }

        // Nothing matched; fall back to a shallow workspace listing.
        if steps.is_empty() {
            let mut params = Params::new();
            params.insert("path".into(), json!("."));
            params.insert("recursive".into(), json!(false));
            steps.push(
                PlanStep::new(
                    "list_files",
                    params,
                    &format!("General analysis for: {objective}"),
                )
                .with_risk(RiskLevel::Low)
                .with_timeout(60),
            );
        }

        Ok(steps)
    }
}

//! `conductor plan ...` commands.

use super::App;
use crate::errors::OrchestratorError;
use crate::plan::PlanStatus;
use crate::tools::Params;
use anyhow::Result;
use console::style;

/// Parse `key=value` context arguments into a parameter map.
fn parse_context(entries: &[String]) -> Result<Params> {
    let mut context = Params::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(OrchestratorError::ConfigValidation(format!(
                "context entry '{entry}' is not key=value"
            ))
            .into());
        };
        context.insert(key.to_string(), serde_json::json!(value));
    }
    Ok(context)
}

pub async fn cmd_plan_create(
    app: &App,
    title: &str,
    description: &str,
    objective: &str,
    context: &[String],
) -> Result<()> {
    let context = parse_context(context)?;
    let plan = app
        .manager
        .create_plan(title, description, objective, Some(context))
        .await?;

    println!(
        "{} plan {} with {} step(s)",
        style("Created").green().bold(),
        style(&plan.id).cyan(),
        plan.total_steps
    );
    for step in &plan.steps {
        println!(
            "  {} {} [{}] {}",
            style(&step.id).dim(),
            step.tool_name,
            step.risk_level.as_str(),
            step.description
        );
    }
    Ok(())
}

pub fn cmd_plan_list(app: &App, status: Option<&str>) -> Result<()> {
    let filter = status
        .map(str::parse::<PlanStatus>)
        .transpose()
        .map_err(|err| OrchestratorError::ConfigValidation(err.to_string()))?;
    let summaries = app.manager.list_plans(filter)?;
    if summaries.is_empty() {
        println!("No plans found");
        return Ok(());
    }

    println!(
        "{:<10} {:<11} {:>5} {:>5} {:>5}  {}",
        "ID", "STATUS", "TOTAL", "DONE", "FAIL", "TITLE"
    );
    for summary in summaries {
        println!(
            "{:<10} {:<11} {:>5} {:>5} {:>5}  {}",
            summary.id,
            summary.status.as_str(),
            summary.total_steps,
            summary.completed_steps,
            summary.failed_steps,
            summary.title
        );
    }
    Ok(())
}

pub fn cmd_plan_show(app: &App, plan_id: &str) -> Result<()> {
    let plan = app
        .manager
        .load_plan(plan_id)?
        .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

pub async fn cmd_plan_status(app: &App, plan_id: &str) -> Result<()> {
    let report = app
        .manager
        .plan_status(plan_id)
        .await?
        .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn cmd_plan_delete(app: &App, plan_id: &str) -> Result<()> {
    app.manager.delete_plan(plan_id).await?;
    println!("{} plan {}", style("Deleted").green().bold(), plan_id);
    Ok(())
}

//! `conductor run`, `approve`, and `stop` commands.

use super::App;
use crate::errors::OrchestratorError;
use crate::plan::Plan;
use anyhow::Result;
use console::style;
use std::collections::HashSet;

pub async fn cmd_run(
    app: &App,
    plan_id: &str,
    auto_approve_low_risk: bool,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        let plan = app
            .manager
            .load_plan(plan_id)?
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        return print_waves(&plan);
    }

    println!(
        "{} plan {}",
        style("Executing").cyan().bold(),
        style(plan_id).cyan()
    );
    let summary = app.manager.execute_plan(plan_id, auto_approve_low_risk).await?;

    let status_style = match summary.plan.status {
        crate::plan::PlanStatus::Completed => style(summary.plan.status.as_str()).green(),
        _ => style(summary.plan.status.as_str()).red(),
    };
    println!(
        "Plan {} finished: {} ({} completed, {} failed, {} skipped) in {:.1}s",
        summary.plan.id,
        status_style.bold(),
        summary.final_stats.completed,
        summary.final_stats.failed,
        summary.final_stats.skipped,
        summary.plan.duration_seconds
    );
    for event in &summary.events {
        let step = event.step_id.as_deref().unwrap_or("-");
        match &event.error {
            Some(error) => println!("  {:<22} {:<10} {}", event.action, step, style(error).red()),
            None => println!("  {:<22} {step}", event.action),
        }
    }
    Ok(())
}

/// Dependency waves: groups of steps whose dependencies are satisfied by
/// the previous waves. Printed without executing anything.
fn print_waves(plan: &Plan) -> Result<()> {
    plan.validate()?;
    let mut done: HashSet<&str> = HashSet::new();
    let mut wave = 0;
    println!(
        "Plan {} ({} steps), max {} concurrent:",
        plan.id, plan.total_steps, plan.max_concurrent_steps
    );
    while done.len() < plan.steps.len() {
        let ready: Vec<&str> = plan
            .steps
            .iter()
            .filter(|s| !done.contains(s.id.as_str()))
            .filter(|s| s.depends_on.iter().all(|d| done.contains(d.as_str())))
            .map(|s| s.id.as_str())
            .collect();
        if ready.is_empty() {
            break;
        }
        println!("  wave {wave}: {}", ready.join(", "));
        done.extend(&ready);
        wave += 1;
    }
    Ok(())
}

pub async fn cmd_approve(app: &App, plan_id: &str, step_id: &str, decision: &str) -> Result<()> {
    let approved = match decision.to_lowercase().as_str() {
        "yes" | "y" | "true" => true,
        "no" | "n" | "false" => false,
        other => {
            return Err(OrchestratorError::ConfigValidation(format!(
                "invalid decision '{other}', expected yes or no"
            ))
            .into());
        }
    };

    if app.manager.approve_step(plan_id, step_id, approved).await {
        let verb = if approved { "Approved" } else { "Rejected" };
        println!("{} step {} in plan {}", style(verb).green().bold(), step_id, plan_id);
        Ok(())
    } else {
        Err(OrchestratorError::ConfigValidation(format!(
            "step {step_id} in plan {plan_id} is not awaiting approval"
        ))
        .into())
    }
}

pub async fn cmd_stop(app: &App, plan_id: &str) -> Result<()> {
    if app.manager.stop_plan(plan_id).await {
        println!("{} plan {}", style("Stopping").yellow().bold(), plan_id);
        Ok(())
    } else {
        Err(OrchestratorError::ConfigValidation(format!("plan {plan_id} is not running")).into())
    }
}

//! Durable plan persistence.
//!
//! Each plan is two sibling files: `<id>.json` (canonical, loaded on
//! restart) and `<id>.md` (regenerated on every save, purely informational).

use super::{Plan, PlanStatus, StepStatus};
use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lightweight listing record; full plans load lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
}

/// One-to-one owner of a plan directory.
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create plan directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn json_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.json"))
    }

    fn md_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.md"))
    }

    /// Persist the canonical JSON and regenerate the markdown rendering.
    /// Markdown failures are logged, never fatal.
    pub fn save(&self, plan: &Plan) -> Result<()> {
        let json = serde_json::to_string_pretty(plan)
            .with_context(|| format!("Failed to serialize plan {}", plan.id))?;
        std::fs::write(self.json_path(&plan.id), json)
            .map_err(|e| OrchestratorError::Storage(e.into()))
            .with_context(|| format!("Failed to write plan {}", plan.id))?;

        if let Err(err) = std::fs::write(self.md_path(&plan.id), render_markdown(plan)) {
            tracing::warn!(plan = %plan.id, error = %err, "failed to write plan markdown");
        }
        Ok(())
    }

    pub fn load(&self, plan_id: &str) -> Result<Option<Plan>> {
        let path = self.json_path(plan_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let plan: Plan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(plan))
    }

    /// Summaries for every `.json` plan file, newest first, optionally
    /// filtered by status. Unreadable files are skipped with a warning.
    pub fn list(&self, status_filter: Option<PlanStatus>) -> Result<Vec<PlanSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let summary = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| Ok(serde_json::from_str::<Plan>(&content)?))
                .map(|plan| PlanSummary {
                    id: plan.id,
                    title: plan.title,
                    description: plan.description,
                    status: plan.status,
                    created_at: plan.created_at,
                    total_steps: plan.total_steps,
                    completed_steps: plan.completed_steps,
                    failed_steps: plan.failed_steps,
                });
            match summary {
                Ok(summary) => {
                    if status_filter.is_none_or(|f| f == summary.status) {
                        summaries.push(summary);
                    }
                }
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "skipping unreadable plan file")
                }
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Remove both files. Refuses while the plan is `running`.
    pub fn delete(&self, plan_id: &str) -> Result<(), OrchestratorError> {
        let plan = self
            .load(plan_id)
            .map_err(OrchestratorError::Storage)?
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        if plan.status == PlanStatus::Running {
            return Err(OrchestratorError::PlanNotExecutable {
                id: plan_id.to_string(),
                status: plan.status.as_str().to_string(),
            });
        }
        std::fs::remove_file(self.json_path(plan_id))
            .map_err(|e| OrchestratorError::Storage(e.into()))?;
        let md = self.md_path(plan_id);
        if md.exists() {
            std::fs::remove_file(md).map_err(|e| OrchestratorError::Storage(e.into()))?;
        }
        Ok(())
    }
}

fn status_glyph(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "[ ]",
        StepStatus::Running => "[>]",
        StepStatus::Completed => "[x]",
        StepStatus::Failed => "[!]",
        StepStatus::Skipped => "[-]",
        StepStatus::RequiresApproval => "[?]",
    }
}

fn render_markdown(plan: &Plan) -> String {
    let mut lines = vec![
        format!("# Plan: {}", plan.title),
        String::new(),
        format!("**ID:** {}", plan.id),
        format!("**Status:** {}", plan.status.as_str()),
        format!("**Created:** {}", plan.created_at.format("%Y-%m-%d %H:%M:%S")),
        String::new(),
        "## Description".to_string(),
        plan.description.clone(),
        String::new(),
        format!("## Steps ({} total)", plan.steps.len()),
        String::new(),
    ];

    for (i, step) in plan.steps.iter().enumerate() {
        lines.push(format!(
            "### {}. {} {}",
            i + 1,
            step.description,
            status_glyph(step.status)
        ));
        lines.push(String::new());
        lines.push(format!("- **Tool:** {}", step.tool_name));
        lines.push(format!("- **Risk Level:** {}", step.risk_level.as_str()));
        lines.push(format!("- **Status:** {}", step.status.as_str()));
        lines.push(format!("- **Timeout:** {}s", step.timeout_seconds));
        if step.requires_approval {
            lines.push("- **Requires Approval:** yes".to_string());
        }
        if !step.depends_on.is_empty() {
            lines.push(format!("- **Depends on:** {}", step.depends_on.join(", ")));
        }
        if let Some(ref error) = step.error_message {
            lines.push("- **Error:**".to_string());
            lines.push("  ```".to_string());
            lines.push(format!("  {error}"));
            lines.push("  ```".to_string());
        }
        lines.push(String::new());
    }

    if plan.total_steps > 0 {
        lines.push("## Statistics".to_string());
        lines.push(String::new());
        lines.push(format!(
            "- **Progress:** {}/{} ({:.1}%)",
            plan.completed_steps,
            plan.total_steps,
            plan.completed_steps as f64 / plan.total_steps as f64 * 100.0
        ));
        lines.push(format!("- **Completed:** {}", plan.completed_steps));
        lines.push(format!("- **Failed:** {}", plan.failed_steps));
        lines.push(format!("- **Skipped:** {}", plan.skipped_steps));
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;
    use crate::tools::Params;
    use tempfile::TempDir;

    fn setup() -> (PlanStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(&dir.path().join("PLANS")).unwrap();
        (store, dir)
    }

    fn sample_plan() -> Plan {
        let mut plan = Plan::new("Inspect workspace", "List and read project files");
        let first = PlanStep::new("list_files", Params::new(), "List files");
        let first_id = first.id.clone();
        plan.add_step(first);
        plan.add_step(
            PlanStep::new("read_file", Params::new(), "Read README")
                .with_dependencies(vec![first_id]),
        );
        plan
    }

    #[test]
    fn save_writes_both_files() {
        let (store, _dir) = setup();
        let plan = sample_plan();
        store.save(&plan).unwrap();

        assert!(store.dir().join(format!("{}.json", plan.id)).exists());
        assert!(store.dir().join(format!("{}.md", plan.id)).exists());
    }

    #[test]
    fn load_round_trips_structurally() {
        let (store, _dir) = setup();
        let mut plan = sample_plan();
        plan.step_mut(&plan.steps[0].id.clone()).unwrap().status = StepStatus::Completed;
        plan.update_stats();
        store.save(&plan).unwrap();

        let loaded = store.load(&plan.id).unwrap().unwrap();
        assert_eq!(loaded.id, plan.id);
        assert_eq!(loaded.title, plan.title);
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].status, StepStatus::Completed);
        assert_eq!(loaded.completed_steps, 1);
        assert_eq!(loaded.created_at, plan.created_at);
    }

    #[test]
    fn load_missing_plan_is_none() {
        let (store, _dir) = setup();
        assert!(store.load("ffffffff").unwrap().is_none());
    }

    #[test]
    fn list_returns_one_entry_per_json_file() {
        let (store, _dir) = setup();
        let a = sample_plan();
        let b = sample_plan();
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let summaries = store.list(None).unwrap();
        assert_eq!(summaries.len(), 2);
        // The .md siblings must not produce entries.
        let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&b.id.as_str()));
    }

    #[test]
    fn list_filters_by_status() {
        let (store, _dir) = setup();
        let mut done = sample_plan();
        done.status = PlanStatus::Completed;
        store.save(&done).unwrap();
        store.save(&sample_plan()).unwrap();

        let completed = store.list(Some(PlanStatus::Completed)).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);
    }

    #[test]
    fn delete_removes_both_files_and_refuses_running() {
        let (store, _dir) = setup();
        let mut plan = sample_plan();
        store.save(&plan).unwrap();
        store.delete(&plan.id).unwrap();
        assert!(!store.dir().join(format!("{}.json", plan.id)).exists());
        assert!(!store.dir().join(format!("{}.md", plan.id)).exists());

        plan.status = PlanStatus::Running;
        store.save(&plan).unwrap();
        let err = store.delete(&plan.id).unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanNotExecutable { .. }));
    }

    #[test]
    fn delete_unknown_plan_is_not_found() {
        let (store, _dir) = setup();
        assert!(matches!(
            store.delete("deadbeef"),
            Err(OrchestratorError::PlanNotFound(_))
        ));
    }

    #[test]
    fn markdown_reflects_step_state() {
        let (store, _dir) = setup();
        let mut plan = sample_plan();
        plan.step_mut(&plan.steps[1].id.clone()).unwrap().error_message =
            Some("permission denied".to_string());
        plan.step_mut(&plan.steps[1].id.clone()).unwrap().status = StepStatus::Failed;
        plan.update_stats();
        store.save(&plan).unwrap();

        let md = std::fs::read_to_string(store.dir().join(format!("{}.md", plan.id))).unwrap();
        assert!(md.contains("# Plan: Inspect workspace"));
        assert!(md.contains("[!]"));
        assert!(md.contains("permission denied"));
        assert!(md.contains("- **Failed:** 1"));
    }
}

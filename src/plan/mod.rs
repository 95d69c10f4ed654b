//! Plan and step data model.
//!
//! A plan is an ordered, dependency-constrained set of tool invocations. The
//! serialized form is the canonical wire format: enums as lowercase strings,
//! timestamps ISO-8601, durations as fractional seconds. Do not reorder or
//! rename enum values without a schema version.

use crate::errors::OrchestratorError;
use crate::tools::{Params, ToolStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub mod store;
pub use store::{PlanStore, PlanSummary};

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Terminal plans are never mutated again, except to be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses from which `execute` may start.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Draft | Self::Ready | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => anyhow::bail!(
                "Invalid plan status '{}'. Valid values: draft, ready, running, paused, completed, failed, cancelled",
                s
            ),
        }
    }
}

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RequiresApproval,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::RequiresApproval => "requires_approval",
        }
    }
}

/// Author-declared hazard rating for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Compact result summary kept on the step; full results live in the
/// artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResultSummary {
    pub success: bool,
    pub status: ToolStatus,
    /// First 200 characters of the serialized output.
    pub output_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

/// One invocation of one tool within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    /// Optional compensating invocation, same shape as a forward one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Value>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub requires_approval: bool,
    /// Recorded approval decision; `Some(true)` satisfies the gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResultSummary>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_step_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

impl PlanStep {
    pub fn new(tool_name: &str, params: Params, description: &str) -> Self {
        Self {
            id: short_id(),
            tool_name: tool_name.to_string(),
            params,
            description: description.to_string(),
            expected_output: None,
            rollback: None,
            risk_level: RiskLevel::Low,
            timeout_seconds: default_step_timeout(),
            requires_approval: false,
            approved: None,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            error_message: None,
            result: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// A complete execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_created_by")]
    pub created_by: String,

    #[serde(default)]
    pub steps: Vec<PlanStep>,

    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "opt_secs_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_duration: Option<Duration>,
    #[serde(
        default,
        with = "opt_secs_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub actual_duration: Option<Duration>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_steps: usize,
    #[serde(default = "default_stop_on_failure")]
    pub stop_on_failure: bool,

    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub completed_steps: usize,
    #[serde(default)]
    pub failed_steps: usize,
    #[serde(default)]
    pub skipped_steps: usize,

    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_created_by() -> String {
    "user".to_string()
}

fn default_max_concurrent() -> usize {
    1
}

fn default_stop_on_failure() -> bool {
    true
}

impl Plan {
    pub fn new(title: &str, description: &str) -> Self {
        Self {
            id: short_id(),
            title: title.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            created_by: default_created_by(),
            steps: Vec::new(),
            status: PlanStatus::Draft,
            started_at: None,
            completed_at: None,
            estimated_duration: None,
            actual_duration: None,
            max_concurrent_steps: default_max_concurrent(),
            stop_on_failure: default_stop_on_failure(),
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            context: serde_json::Map::new(),
            tags: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn add_step(&mut self, step: PlanStep) {
        self.steps.push(step);
        self.total_steps = self.steps.len();
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Pending steps whose every dependency is completed, in plan order.
    pub fn next_ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|step| {
                step.status == StepStatus::Pending
                    && step.depends_on.iter().all(|dep| {
                        self.step(dep)
                            .is_some_and(|d| d.status == StepStatus::Completed)
                    })
            })
            .collect()
    }

    pub fn has_steps_awaiting_approval(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.status == StepStatus::RequiresApproval)
    }

    /// Recompute the derived counters and the actual duration.
    pub fn update_stats(&mut self) {
        self.total_steps = self.steps.len();
        self.completed_steps = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.failed_steps = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        self.skipped_steps = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            self.actual_duration = (completed - started).to_std().ok();
        }
    }

    /// Sum of step timeouts, used as the duration estimate at creation.
    pub fn estimate_duration(&self) -> Duration {
        Duration::from_secs(self.steps.iter().map(|s| s.timeout_seconds).sum())
    }

    /// Structural validation: unique step ids, known dependencies, acyclic
    /// graph. Called before a plan is ever persisted.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(OrchestratorError::ConfigValidation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        let mut in_degree: Vec<usize> = vec![0; self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let Some(&from) = index.get(dep.as_str()) else {
                    return Err(OrchestratorError::ConfigValidation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                };
                dependents[from].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm; anything left with in-degree > 0 sits on a cycle.
        let mut queue: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }
        if processed != self.steps.len() {
            let cycle: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.steps[i].id.as_str())
                .collect();
            return Err(OrchestratorError::ConfigValidation(format!(
                "dependency cycle involving steps {cycle:?}"
            )));
        }
        Ok(())
    }

    /// Step ids currently running or parked for approval.
    pub fn active_step_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| {
                matches!(s.status, StepStatus::Running | StepStatus::RequiresApproval)
            })
            .map(|s| s.id.clone())
            .collect()
    }
}

/// Opaque short id: the first 8 hex chars of a v4 UUID.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Optional durations serialize as total seconds (fractional).
mod opt_secs_f64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(|s| Duration::from_secs_f64(s.max(0.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, deps: Vec<&str>) -> PlanStep {
        let mut step = PlanStep::new("read_file", Params::new(), &format!("step {id}"));
        step.id = id.to_string();
        step.depends_on = deps.into_iter().map(String::from).collect();
        step
    }

    fn plan_with(steps: Vec<PlanStep>) -> Plan {
        let mut plan = Plan::new("test", "test plan");
        for s in steps {
            plan.add_step(s);
        }
        plan
    }

    #[test]
    fn short_ids_are_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ready_steps_respect_dependencies_and_order() {
        let mut plan = plan_with(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec![]),
        ]);

        let ready: Vec<&str> = plan.next_ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["a", "c"]);

        plan.step_mut("a").unwrap().status = StepStatus::Completed;
        let ready: Vec<&str> = plan.next_ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn failed_dependency_blocks_dependents() {
        let mut plan = plan_with(vec![step("a", vec![]), step("b", vec!["a"])]);
        plan.step_mut("a").unwrap().status = StepStatus::Failed;
        assert!(plan.next_ready_steps().is_empty());
    }

    #[test]
    fn validate_accepts_a_diamond() {
        let plan = plan_with(vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn validate_rejects_cycles() {
        let plan = plan_with(vec![
            step("a", vec!["c"]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let plan = plan_with(vec![step("a", vec!["ghost"])]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let plan = plan_with(vec![step("a", vec![]), step("a", vec![])]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn update_stats_counts_statuses() {
        let mut plan = plan_with(vec![
            step("a", vec![]),
            step("b", vec![]),
            step("c", vec![]),
        ]);
        plan.step_mut("a").unwrap().status = StepStatus::Completed;
        plan.step_mut("b").unwrap().status = StepStatus::Failed;
        plan.step_mut("c").unwrap().status = StepStatus::Skipped;
        plan.started_at = Some(Utc::now() - chrono::Duration::seconds(5));
        plan.completed_at = Some(Utc::now());
        plan.update_stats();

        assert_eq!(plan.total_steps, 3);
        assert_eq!(plan.completed_steps, 1);
        assert_eq!(plan.failed_steps, 1);
        assert_eq!(plan.skipped_steps, 1);
        assert!(plan.actual_duration.unwrap() >= Duration::from_secs(4));
    }

    #[test]
    fn plan_round_trips_through_json() {
        let mut plan = plan_with(vec![step("a", vec![]).with_risk(RiskLevel::High)]);
        plan.estimated_duration = Some(Duration::from_secs(90));
        plan.context.insert("target_file".into(), json!("README.md"));
        plan.tags.push("demo".into());

        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.contains("\"status\":\"draft\""));
        assert!(json.contains("\"risk_level\":\"high\""));
        assert!(json.contains("\"estimated_duration\":90.0"));

        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, plan.id);
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.steps[0].risk_level, RiskLevel::High);
        assert_eq!(back.estimated_duration, Some(Duration::from_secs(90)));
        assert_eq!(back.context["target_file"], json!("README.md"));
    }

    #[test]
    fn unknown_fields_survive_load_and_save() {
        let mut plan = plan_with(vec![]);
        plan.extra.insert("future_field".into(), json!({"v": 2}));
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extra["future_field"], json!({"v": 2}));
    }

    #[test]
    fn estimate_is_the_sum_of_step_timeouts() {
        let plan = plan_with(vec![
            step("a", vec![]).with_timeout(30),
            step("b", vec![]).with_timeout(60),
        ]);
        assert_eq!(plan.estimate_duration(), Duration::from_secs(90));
    }

    #[test]
    fn plan_status_parses_and_prints() {
        assert_eq!("running".parse::<PlanStatus>().unwrap(), PlanStatus::Running);
        assert_eq!(PlanStatus::Running.as_str(), "running");
        assert!("bogus".parse::<PlanStatus>().is_err());
        assert_eq!(StepStatus::RequiresApproval.as_str(), "requires_approval");
    }
}

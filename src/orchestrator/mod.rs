//! The plan manager façade: create, load, list, run, stop, approve, and
//! inspect plans across the audit, permission, artifact, tool, and plan
//! subsystems.

use crate::artifacts::ArtifactStore;
use crate::audit::{ApprovalAction, AuditLog};
use crate::config::SchedulerSettings;
use crate::errors::OrchestratorError;
use crate::permissions::PermissionEngine;
use crate::plan::{Plan, PlanStatus, PlanStore, PlanSummary, StepStatus};
use crate::tools::{Params, ToolRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

pub mod executor;
pub mod generator;
pub mod scheduler;

pub use executor::{StepExecutor, StepOutcome};
pub use generator::{RuleBasedGenerator, StepGenerator};
pub use scheduler::{ExecutionEvent, PlanScheduler, SchedulerConfig};

/// Final statistics of one plan execution.
#[derive(Debug, Clone, Serialize)]
pub struct FinalStats {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Overview block returned from `execute_plan`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOverview {
    pub id: String,
    pub title: String,
    pub status: PlanStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub duration_seconds: f64,
}

/// Result of a plan execution: overview plus the ephemeral event log.
///
/// The event log is not persisted in the plan file; durable reconstruction
/// filters the audit journal by plan id.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub plan: PlanOverview,
    /// Scopes this execution's artifact directory.
    pub run_id: String,
    pub events: Vec<ExecutionEvent>,
    pub final_stats: FinalStats,
}

/// Progress block of [`PlanStatusReport`].
#[derive(Debug, Clone, Serialize)]
pub struct PlanProgress {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percentage: f64,
}

/// Timing block of [`PlanStatusReport`].
#[derive(Debug, Clone, Serialize)]
pub struct PlanTiming {
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration_seconds: Option<f64>,
}

/// A step currently running or parked for approval.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentStep {
    pub id: String,
    pub description: String,
    pub status: StepStatus,
    pub requires_approval: bool,
}

/// Detailed status for `plan status`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStatusReport {
    pub id: String,
    pub title: String,
    pub status: PlanStatus,
    pub progress: PlanProgress,
    pub timing: PlanTiming,
    pub current_steps: Vec<CurrentStep>,
}

struct ActiveExecution {
    plan: Arc<Mutex<Plan>>,
    stop: Arc<AtomicBool>,
}

/// The orchestrator façade. Construct one per plan directory; multiple
/// independent managers may coexist (tests do exactly that).
pub struct PlanManager {
    store: Arc<PlanStore>,
    audit: Arc<AuditLog>,
    executor: Arc<StepExecutor>,
    scheduler: PlanScheduler,
    generator: Arc<dyn StepGenerator>,
    settings: SchedulerSettings,
    active: Mutex<HashMap<String, ActiveExecution>>,
}

impl PlanManager {
    pub fn new(
        store: Arc<PlanStore>,
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionEngine>,
        artifacts: Arc<ArtifactStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let executor = Arc::new(StepExecutor::new(
            registry,
            permissions,
            artifacts,
            audit.clone(),
        ));
        let scheduler = PlanScheduler::new(executor.clone(), store.clone(), audit.clone());
        Self {
            store,
            audit,
            executor,
            scheduler,
            generator: Arc::new(RuleBasedGenerator),
            settings: SchedulerSettings::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Substitute the plan-generation callback (e.g. an LLM-backed one).
    pub fn with_generator(mut self, generator: Arc<dyn StepGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_scheduler_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn step_executor(&self) -> Arc<StepExecutor> {
        self.executor.clone()
    }

    /// Generate and persist a new plan for an objective. The dependency
    /// graph is validated before anything is written.
    pub async fn create_plan(
        &self,
        title: &str,
        description: &str,
        objective: &str,
        context: Option<Params>,
    ) -> Result<Plan, OrchestratorError> {
        let context = context.unwrap_or_default();
        let steps = self
            .generator
            .generate(objective, &context)
            .await
            .map_err(OrchestratorError::Other)?;

        let mut plan = Plan::new(title, description);
        plan.context = context;
        for mut step in steps {
            if step.timeout_seconds == 0 {
                step.timeout_seconds = self.settings.default_timeout_seconds;
            }
            plan.add_step(step);
        }
        plan.max_concurrent_steps = self.settings.max_concurrent_steps;
        plan.estimated_duration = Some(plan.estimate_duration());

        plan.validate()?;
        self.store
            .save(&plan)
            .map_err(OrchestratorError::Storage)?;
        tracing::info!(plan = %plan.id, steps = plan.total_steps, "created plan");
        Ok(plan)
    }

    pub fn load_plan(&self, plan_id: &str) -> Result<Option<Plan>, OrchestratorError> {
        self.store.load(plan_id).map_err(OrchestratorError::Storage)
    }

    pub fn list_plans(
        &self,
        status_filter: Option<PlanStatus>,
    ) -> Result<Vec<PlanSummary>, OrchestratorError> {
        self.store
            .list(status_filter)
            .map_err(OrchestratorError::Storage)
    }

    /// Execute a plan to completion and return its summary.
    pub async fn execute_plan(
        &self,
        plan_id: &str,
        auto_approve_low_risk: bool,
    ) -> Result<ExecutionSummary, OrchestratorError> {
        let mut plan = self
            .load_plan(plan_id)?
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        if !plan.status.is_executable() {
            return Err(OrchestratorError::PlanNotExecutable {
                id: plan_id.to_string(),
                status: plan.status.as_str().to_string(),
            });
        }

        let run_id = ArtifactStore::generate_run_id();
        self.audit
            .log_plan_execution(plan_id, "start", "initiated", plan.total_steps, None);

        plan.status = PlanStatus::Running;
        plan.started_at = Some(Utc::now());
        self.store.save(&plan).map_err(OrchestratorError::Storage)?;

        let shared = Arc::new(Mutex::new(plan));
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.active.lock().await;
            active.insert(
                plan_id.to_string(),
                ActiveExecution {
                    plan: shared.clone(),
                    stop: stop.clone(),
                },
            );
        }

        let config = SchedulerConfig {
            tick: Duration::from_millis(self.settings.tick_ms.max(1)),
            auto_approve_low_risk,
        };
        let outcome = self
            .scheduler
            .run(shared.clone(), &run_id, stop, &config)
            .await;

        // Always deregister, even when the scheduler errored out.
        self.active.lock().await.remove(plan_id);

        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                let mut plan = shared.lock().await;
                plan.status = PlanStatus::Failed;
                plan.completed_at = Some(Utc::now());
                plan.update_stats();
                if let Err(save_err) = self.store.save(&plan) {
                    tracing::error!(plan = plan_id, error = %save_err, "failed to persist failed plan");
                }
                self.audit
                    .log_plan_execution(plan_id, "fail", "error", plan.total_steps, None);
                return Err(OrchestratorError::Storage(err));
            }
        };

        let summary = {
            let mut plan = shared.lock().await;
            if !report.cancelled {
                plan.completed_at = Some(Utc::now());
                plan.update_stats();
                plan.status = if report.fatal
                    || (plan.failed_steps > 0 && plan.stop_on_failure)
                {
                    PlanStatus::Failed
                } else {
                    PlanStatus::Completed
                };
                self.store.save(&plan).map_err(OrchestratorError::Storage)?;
            }

            let duration = plan
                .actual_duration
                .unwrap_or_default();
            self.audit.log_plan_execution(
                plan_id,
                "complete",
                plan.status.as_str(),
                plan.total_steps,
                Some(duration.as_millis() as u64),
            );
            tracing::info!(plan = plan_id, status = plan.status.as_str(), "plan execution finished");

            ExecutionSummary {
                run_id: run_id.clone(),
                plan: PlanOverview {
                    id: plan.id.clone(),
                    title: plan.title.clone(),
                    status: plan.status,
                    total_steps: plan.total_steps,
                    completed_steps: plan.completed_steps,
                    failed_steps: plan.failed_steps,
                    skipped_steps: plan.skipped_steps,
                    duration_seconds: duration.as_secs_f64(),
                },
                events: report.events,
                final_stats: FinalStats {
                    completed: plan.completed_steps,
                    failed: plan.failed_steps,
                    skipped: plan.skipped_steps,
                },
            }
        };
        Ok(summary)
    }

    /// Request cancellation of a running plan. Returns false when the plan
    /// is not executing.
    pub async fn stop_plan(&self, plan_id: &str) -> bool {
        let active = self.active.lock().await;
        match active.get(plan_id) {
            Some(execution) => {
                execution.stop.store(true, Ordering::SeqCst);
                tracing::info!(plan = plan_id, "stop requested");
                true
            }
            None => false,
        }
    }

    /// Resolve an approval gate. Only a step currently in
    /// `requires_approval` transitions; concurrent calls get one winner.
    pub async fn approve_step(&self, plan_id: &str, step_id: &str, approved: bool) -> bool {
        let shared = {
            let active = self.active.lock().await;
            match active.get(plan_id) {
                Some(execution) => execution.plan.clone(),
                None => return false,
            }
        };

        let mut plan = shared.lock().await;
        let Some(step) = plan.step_mut(step_id) else {
            return false;
        };
        if step.status != StepStatus::RequiresApproval {
            return false;
        }

        let (tool_name, risk) = (step.tool_name.clone(), step.risk_level.as_str());
        let action = if approved {
            step.approved = Some(true);
            step.status = StepStatus::Pending;
            ApprovalAction::Granted
        } else {
            step.approved = Some(false);
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
            ApprovalAction::Denied
        };
        self.audit
            .log_approval_event(plan_id, step_id, action, &tool_name, risk);
        plan.update_stats();
        if let Err(err) = self.store.save(&plan) {
            tracing::error!(plan = plan_id, error = %err, "failed to persist approval decision");
        }
        true
    }

    /// Detailed status: prefers the live in-memory plan, falls back to disk.
    pub async fn plan_status(&self, plan_id: &str) -> Result<Option<PlanStatusReport>, OrchestratorError> {
        let plan = {
            let active = self.active.lock().await;
            match active.get(plan_id) {
                Some(execution) => Some(execution.plan.lock().await.clone()),
                None => None,
            }
        };
        let plan = match plan {
            Some(plan) => plan,
            None => match self.load_plan(plan_id)? {
                Some(plan) => plan,
                None => return Ok(None),
            },
        };

        let percentage = if plan.total_steps > 0 {
            plan.completed_steps as f64 / plan.total_steps as f64 * 100.0
        } else {
            0.0
        };
        Ok(Some(PlanStatusReport {
            id: plan.id.clone(),
            title: plan.title.clone(),
            status: plan.status,
            progress: PlanProgress {
                total_steps: plan.total_steps,
                completed: plan.completed_steps,
                failed: plan.failed_steps,
                skipped: plan.skipped_steps,
                percentage,
            },
            timing: PlanTiming {
                created_at: plan.created_at,
                started_at: plan.started_at,
                completed_at: plan.completed_at,
                estimated_duration_seconds: plan.estimated_duration.map(|d| d.as_secs_f64()),
                actual_duration_seconds: plan.actual_duration.map(|d| d.as_secs_f64()),
            },
            current_steps: plan
                .steps
                .iter()
                .filter(|s| {
                    matches!(s.status, StepStatus::Running | StepStatus::RequiresApproval)
                })
                .map(|s| CurrentStep {
                    id: s.id.clone(),
                    description: s.description.clone(),
                    status: s.status,
                    requires_approval: s.requires_approval,
                })
                .collect(),
        }))
    }

    /// Delete a plan's files. Refuses while it is executing.
    pub async fn delete_plan(&self, plan_id: &str) -> Result<(), OrchestratorError> {
        if self.active.lock().await.contains_key(plan_id) {
            return Err(OrchestratorError::PlanNotExecutable {
                id: plan_id.to_string(),
                status: "running".to_string(),
            });
        }
        self.store.delete(plan_id)
    }
}

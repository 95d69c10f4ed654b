//! Dependency-ordered scheduling with bounded concurrency, approval
//! parking, and cooperative cancellation.
//!
//! The per-plan lock is held only across state transitions, never across a
//! tool invocation, so `approve_step` callers are never blocked behind a
//! running tool.

use super::executor::{StepExecutor, StepOutcome};
use crate::audit::{ApprovalAction, AuditLog};
use crate::plan::{Plan, PlanStatus, PlanStep, PlanStore, RiskLevel, StepStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between empty passes while approvals are pending.
    pub tick: Duration,
    /// Run low-risk approval-gated steps without parking them.
    pub auto_approve_low_risk: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            auto_approve_low_risk: true,
        }
    }
}

/// One entry of the ephemeral per-run event log.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    fn now(step_id: Option<String>, action: &str, error: Option<String>) -> Self {
        Self {
            step_id,
            action: action.to_string(),
            error,
            timestamp: Utc::now(),
        }
    }
}

/// What a scheduling pass over a plan produced.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub events: Vec<ExecutionEvent>,
    pub cancelled: bool,
    /// A storage failure ended the run; the plan must be marked failed.
    pub fatal: bool,
}

/// Drives one plan to completion. Stateless across plans; all per-plan
/// state lives in the shared `Plan` and the stop flag.
pub struct PlanScheduler {
    executor: Arc<StepExecutor>,
    store: Arc<PlanStore>,
    audit: Arc<AuditLog>,
}

impl PlanScheduler {
    pub fn new(executor: Arc<StepExecutor>, store: Arc<PlanStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            executor,
            store,
            audit,
        }
    }

    pub async fn run(
        &self,
        plan: Arc<Mutex<Plan>>,
        run_id: &str,
        stop: Arc<AtomicBool>,
        config: &SchedulerConfig,
    ) -> Result<SchedulerReport> {
        let mut report = SchedulerReport::default();
        let mut announced_wait = false;

        loop {
            if stop.load(Ordering::SeqCst) {
                let mut plan = plan.lock().await;
                plan.status = PlanStatus::Cancelled;
                plan.completed_at = Some(Utc::now());
                plan.update_stats();
                self.store.save(&plan)?;
                report
                    .events
                    .push(ExecutionEvent::now(None, "cancelled", None));
                report.cancelled = true;
                break;
            }

            // Select the gate batch under the lock; park approval-gated
            // steps as we meet them.
            let (gate, waiting, parked) = {
                let mut plan = plan.lock().await;
                let plan_id = plan.id.clone();
                let max_concurrent = plan.max_concurrent_steps.max(1);
                let ready_ids: Vec<String> = plan
                    .next_ready_steps()
                    .iter()
                    .map(|s| s.id.clone())
                    .collect();

                let mut gate: Vec<PlanStep> = Vec::new();
                let mut parked = false;
                for id in ready_ids {
                    if gate.len() >= max_concurrent {
                        break;
                    }
                    let step = plan.step_mut(&id).expect("ready step must exist");
                    if step.requires_approval
                        && step.approved != Some(true)
                        && !(config.auto_approve_low_risk && step.risk_level == RiskLevel::Low)
                    {
                        step.status = StepStatus::RequiresApproval;
                        parked = true;
                        let (tool_name, risk) =
                            (step.tool_name.clone(), step.risk_level.as_str());
                        self.audit
                            .log_approval_event(&plan_id, &id, ApprovalAction::Required, &tool_name, risk);
                        report.events.push(ExecutionEvent::now(
                            Some(id.clone()),
                            "approval_required",
                            None,
                        ));
                        continue;
                    }
                    gate.push(step.clone());
                }
                if parked {
                    self.store.save(&plan)?;
                }
                (gate, plan.has_steps_awaiting_approval(), parked)
            };

            if gate.is_empty() {
                if waiting {
                    if !announced_wait && !parked {
                        report
                            .events
                            .push(ExecutionEvent::now(None, "waiting_approval", None));
                    }
                    announced_wait = true;
                    tokio::time::sleep(config.tick).await;
                    continue;
                }
                break; // no ready work, no pending approvals
            }
            announced_wait = false;

            // Run the gate concurrently; the plan lock is released while
            // tools execute. Each step persists as it terminates.
            let plan_id = { plan.lock().await.id.clone() };
            let mut in_flight: FuturesUnordered<_> = gate
                .into_iter()
                .map(|mut step| {
                    let executor = self.executor.clone();
                    let plan_id = plan_id.clone();
                    let run_id = run_id.to_string();
                    async move {
                        let outcome = executor.execute(&plan_id, &run_id, &mut step).await;
                        (step, outcome)
                    }
                })
                .collect();

            let mut gate_failed = false;
            while let Some((snapshot, outcome)) = in_flight.next().await {
                let mut plan = plan.lock().await;
                write_back(&mut plan, &snapshot);
                plan.update_stats();
                self.store.save(&plan)?;

                match outcome {
                    StepOutcome::Completed => report.events.push(ExecutionEvent::now(
                        Some(snapshot.id.clone()),
                        "completed",
                        None,
                    )),
                    StepOutcome::Retrying => report.events.push(ExecutionEvent::now(
                        Some(snapshot.id.clone()),
                        "retrying",
                        snapshot.error_message.clone(),
                    )),
                    StepOutcome::Failed => {
                        gate_failed = true;
                        report.events.push(ExecutionEvent::now(
                            Some(snapshot.id.clone()),
                            "failed",
                            snapshot.error_message.clone(),
                        ));
                    }
                    StepOutcome::FatalStorage => {
                        gate_failed = true;
                        report.fatal = true;
                        report.events.push(ExecutionEvent::now(
                            Some(snapshot.id.clone()),
                            "failed",
                            snapshot.error_message.clone(),
                        ));
                    }
                }
            }

            if report.fatal {
                break;
            }
            let stop_on_failure = { plan.lock().await.stop_on_failure };
            if gate_failed && stop_on_failure {
                break;
            }
        }

        Ok(report)
    }
}

/// Copy the executed snapshot's lifecycle fields onto the owned step.
fn write_back(plan: &mut Plan, snapshot: &PlanStep) {
    if let Some(step) = plan.step_mut(&snapshot.id) {
        step.status = snapshot.status;
        step.started_at = snapshot.started_at;
        step.completed_at = snapshot.completed_at;
        step.retry_count = snapshot.retry_count;
        step.error_message = snapshot.error_message.clone();
        step.result = snapshot.result.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::permissions::PermissionEngine;
    use crate::tools::{Params, ToolRegistry};
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (PlanScheduler, Arc<PlanStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLog::new(&dir.path().join("logs")).unwrap());
        let artifacts = Arc::new(ArtifactStore::new(&dir.path().join("ARTIFACTS")).unwrap());
        let registry = Arc::new(ToolRegistry::with_builtins());
        let permissions = Arc::new(PermissionEngine::with_defaults(audit.clone()));
        let executor = Arc::new(StepExecutor::new(
            registry,
            permissions,
            artifacts,
            audit.clone(),
        ));
        let store = Arc::new(PlanStore::new(&dir.path().join("PLANS")).unwrap());
        (PlanScheduler::new(executor, store.clone(), audit), store, dir)
    }

    fn list_step(dir: &std::path::Path, description: &str) -> PlanStep {
        let mut params = Params::new();
        params.insert("path".into(), json!(dir.display().to_string()));
        PlanStep::new("list_files", params, description)
    }

    #[tokio::test]
    async fn runs_dependent_steps_in_order() {
        let (scheduler, store, dir) = setup();
        let mut plan = Plan::new("ordered", "two dependent steps");
        let a = list_step(dir.path(), "first");
        let a_id = a.id.clone();
        plan.add_step(a);
        plan.add_step(list_step(dir.path(), "second").with_dependencies(vec![a_id.clone()]));
        store.save(&plan).unwrap();

        let plan = Arc::new(Mutex::new(plan));
        let report = scheduler
            .run(
                plan.clone(),
                "run_1_aaaaaaaa",
                Arc::new(AtomicBool::new(false)),
                &SchedulerConfig::default(),
            )
            .await
            .unwrap();

        let plan = plan.lock().await;
        assert_eq!(plan.completed_steps, 2);
        let first = plan.step(&a_id).unwrap();
        let second = plan.steps.iter().find(|s| s.id != a_id).unwrap();
        assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
        assert_eq!(
            report
                .events
                .iter()
                .filter(|e| e.action == "completed")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn stop_flag_cancels_before_dispatch() {
        let (scheduler, _store, dir) = setup();
        let mut plan = Plan::new("cancel", "never runs");
        plan.add_step(list_step(dir.path(), "unreached"));
        let plan = Arc::new(Mutex::new(plan));

        let report = scheduler
            .run(
                plan.clone(),
                "run_1_bbbbbbbb",
                Arc::new(AtomicBool::new(true)),
                &SchedulerConfig::default(),
            )
            .await
            .unwrap();

        assert!(report.cancelled);
        let plan = plan.lock().await;
        assert_eq!(plan.status, PlanStatus::Cancelled);
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn approval_gated_step_parks_until_approved() {
        let (scheduler, _store, dir) = setup();
        let mut plan = Plan::new("gated", "one approval step");
        plan.add_step(
            list_step(dir.path(), "needs sign-off")
                .with_risk(crate::plan::RiskLevel::High)
                .with_approval(true),
        );
        let step_id = plan.steps[0].id.clone();
        let plan = Arc::new(Mutex::new(plan));

        let scheduler_plan = plan.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = tokio::spawn(async move {
            scheduler
                .run(
                    scheduler_plan,
                    "run_1_cccccccc",
                    stop_clone,
                    &SchedulerConfig::default(),
                )
                .await
        });

        // Wait for the scheduler to park the step.
        let mut parked = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if plan.lock().await.steps[0].status == StepStatus::RequiresApproval {
                parked = true;
                break;
            }
        }
        assert!(parked, "step should reach requires_approval");

        // Approve: record the decision and return the step to pending; the
        // next tick picks it up.
        {
            let mut plan = plan.lock().await;
            let step = plan.step_mut(&step_id).unwrap();
            step.approved = Some(true);
            step.status = StepStatus::Pending;
        }

        let report = handle.await.unwrap().unwrap();
        assert!(!report.cancelled);
        assert_eq!(plan.lock().await.steps[0].status, StepStatus::Completed);
        assert!(report.events.iter().any(|e| e.action == "approval_required"));
    }

    #[tokio::test]
    async fn auto_approve_runs_low_risk_gated_steps() {
        let (scheduler, _store, dir) = setup();
        let mut plan = Plan::new("low", "low-risk approval step");
        plan.add_step(list_step(dir.path(), "harmless").with_approval(true));
        let plan = Arc::new(Mutex::new(plan));

        scheduler
            .run(
                plan.clone(),
                "run_1_dddddddd",
                Arc::new(AtomicBool::new(false)),
                &SchedulerConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(plan.lock().await.steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn skipped_rejection_lets_plan_finish() {
        let (scheduler, _store, dir) = setup();
        let mut plan = Plan::new("rejected", "skip then done");
        plan.add_step(
            list_step(dir.path(), "rejected step")
                .with_risk(crate::plan::RiskLevel::High)
                .with_approval(true),
        );
        let step_id = plan.steps[0].id.clone();
        let plan = Arc::new(Mutex::new(plan));

        let scheduler_plan = plan.clone();
        let handle = tokio::spawn(async move {
            scheduler
                .run(
                    scheduler_plan,
                    "run_1_eeeeeeee",
                    Arc::new(AtomicBool::new(false)),
                    &SchedulerConfig::default(),
                )
                .await
        });

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if plan.lock().await.steps[0].status == StepStatus::RequiresApproval {
                break;
            }
        }
        {
            let mut plan = plan.lock().await;
            let step = plan.step_mut(&step_id).unwrap();
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
            plan.update_stats();
        }

        handle.await.unwrap().unwrap();
        let plan = plan.lock().await;
        assert_eq!(plan.skipped_steps, 1);
        assert_eq!(plan.completed_steps, 0);
    }

    #[tokio::test]
    async fn failure_with_stop_on_failure_leaves_dependents_pending() {
        let (scheduler, _store, dir) = setup();
        let mut plan = Plan::new("failing", "a fails, b never runs");
        plan.stop_on_failure = true;
        let mut bad = PlanStep::new("read_file", Params::new(), "missing path param is denied");
        bad.max_retries = 0;
        let bad_id = bad.id.clone();
        plan.add_step(bad);
        plan.add_step(list_step(dir.path(), "dependent").with_dependencies(vec![bad_id]));
        let plan = Arc::new(Mutex::new(plan));

        scheduler
            .run(
                plan.clone(),
                "run_1_ffffffff",
                Arc::new(AtomicBool::new(false)),
                &SchedulerConfig::default(),
            )
            .await
            .unwrap();

        let plan = plan.lock().await;
        assert_eq!(plan.steps[0].status, StepStatus::Failed);
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
        assert_eq!(plan.failed_steps, 1);
    }

    #[tokio::test]
    async fn empty_plan_finishes_immediately() {
        let (scheduler, _store, _dir) = setup();
        let plan = Arc::new(Mutex::new(Plan::new("empty", "no steps")));
        let report = scheduler
            .run(
                plan.clone(),
                "run_1_00000000",
                Arc::new(AtomicBool::new(false)),
                &SchedulerConfig::default(),
            )
            .await
            .unwrap();
        assert!(!report.cancelled);
        assert!(report.events.is_empty());
    }
}

//! Single-step lifecycle: gate, invoke, time out, capture, audit.

use crate::artifacts::ArtifactStore;
use crate::audit::AuditLog;
use crate::errors::ErrorKind;
use crate::permissions::PermissionEngine;
use crate::plan::{PlanStep, RiskLevel, StepResultSummary, StepStatus};
use crate::tools::{ToolRegistry, ToolResult};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a step execution ended, from the scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Retryable failure with retries remaining; the step is pending again.
    Retrying,
    Failed,
    /// Artifact persistence failed; fatal to the plan regardless of
    /// `stop_on_failure`.
    FatalStorage,
}

/// Executes one step at a time. Never persists the plan itself — the
/// scheduler saves after every transition.
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionEngine>,
    artifacts: Arc<ArtifactStore>,
    audit: Arc<AuditLog>,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionEngine>,
        artifacts: Arc<ArtifactStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            registry,
            permissions,
            artifacts,
            audit,
        }
    }

    /// Drive `step` to a terminal or retry state, mutating it in place.
    pub async fn execute(&self, plan_id: &str, run_id: &str, step: &mut PlanStep) -> StepOutcome {
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        let started = Instant::now();

        let resource = derive_resource(step);
        let action = derive_action(&step.tool_name);

        // Critical operations must carry an explicit approval gate.
        if step.risk_level == RiskLevel::Critical && !step.requires_approval {
            let result = ToolResult::denied_result(
                "Permission denied: critical operations require explicit approval",
                ErrorKind::PermissionDenied,
            );
            self.audit.log_permission_check(
                &step.tool_name,
                &resource,
                action,
                false,
                Some("critical_risk_rule"),
            );
            return finalize_failure(step, result);
        }

        if !self.permissions.check(&step.tool_name, &resource, action) {
            let result = ToolResult::denied_result(
                format!(
                    "Permission denied: {} may not {} {}",
                    step.tool_name, action, resource
                ),
                ErrorKind::PermissionDenied,
            );
            return finalize_failure(step, result);
        }

        // Start marker; the end marker carries the true success value.
        self.audit.log_tool_execution(
            &step.tool_name,
            &resource,
            false,
            0,
            None,
            None,
            Some(run_id),
            Some(plan_id),
        );

        let timeout_seconds = step.timeout_seconds.max(1);
        let invocation = self.registry.execute(&step.tool_name, &step.params);
        let mut result =
            match tokio::time::timeout(Duration::from_secs(timeout_seconds), invocation).await {
                Ok(result) => result,
                Err(_) => ToolResult::timeout_result(timeout_seconds),
            };
        let duration = started.elapsed();
        result.duration = duration;

        let output_size = serde_json::to_string(&result.output)
            .map(|s| s.len())
            .unwrap_or(0);
        self.audit.log_tool_execution(
            &step.tool_name,
            &resource,
            result.success,
            duration.as_millis() as u64,
            result.exit_code(),
            Some(output_size),
            Some(run_id),
            Some(plan_id),
        );

        if result.success {
            let input = Value::Object(step.params.clone());
            match self.artifacts.store(
                run_id,
                &step.tool_name,
                &input,
                &result.output,
                duration,
                result.status.as_str(),
                None,
            ) {
                Ok(path) => {
                    result.artifact_path = Some(path.display().to_string());
                    step.result = Some(summarize(&result));
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(Utc::now());
                    StepOutcome::Completed
                }
                Err(err) => {
                    self.audit.log_event(
                        crate::audit::AuditEventType::ToolExecution,
                        crate::audit::Severity::Critical,
                        &step.tool_name,
                        &resource,
                        "store_artifact",
                        "storage_error",
                        serde_json::json!({ "error": err.to_string() }),
                        crate::audit::Correlation {
                            run_id: Some(run_id.to_string()),
                            plan_id: Some(plan_id.to_string()),
                            tool_name: Some(step.tool_name.clone()),
                        },
                    );
                    let result = ToolResult::error_result(
                        format!("Failed to store artifact: {err}"),
                        ErrorKind::StorageError,
                    );
                    finalize_failure(step, result);
                    StepOutcome::FatalStorage
                }
            }
        } else {
            let kind = result.error_kind.unwrap_or(ErrorKind::StepExecutionError);
            if kind.is_retryable() && step.retry_count < step.max_retries {
                step.retry_count += 1;
                step.status = StepStatus::Pending;
                step.started_at = None;
                tracing::debug!(
                    step = %step.id,
                    retry = step.retry_count,
                    of = step.max_retries,
                    "retrying step after {} failure",
                    kind.code()
                );
                StepOutcome::Retrying
            } else {
                finalize_failure(step, result)
            }
        }
    }
}

fn finalize_failure(step: &mut PlanStep, result: ToolResult) -> StepOutcome {
    step.error_message = result.error_message.clone();
    step.result = Some(summarize(&result));
    step.status = StepStatus::Failed;
    step.completed_at = Some(Utc::now());
    StepOutcome::Failed
}

fn summarize(result: &ToolResult) -> StepResultSummary {
    let rendered = serde_json::to_string(&result.output).unwrap_or_default();
    let output_preview = rendered.chars().take(200).collect();
    StepResultSummary {
        success: result.success,
        status: result.status,
        output_preview,
        artifact_path: result.artifact_path.clone(),
    }
}

/// The logical resource a step touches, for permission evaluation. Shell
/// tools expose the command; file tools the path (normalized to `./` form
/// when relative); anything else falls back to the step description.
pub fn derive_resource(step: &PlanStep) -> String {
    let str_param = |name: &str| {
        step.params
            .get(name)
            .and_then(Value::as_str)
            .map(String::from)
    };
    match step.tool_name.as_str() {
        "bash_execute" => str_param("command").unwrap_or_default(),
        "read_file" | "write_file" | "delete_file" | "list_files" | "find_in_files" => {
            match str_param("path") {
                Some(path) if !path.starts_with('/') && !path.starts_with("./") => {
                    format!("./{path}")
                }
                Some(path) => path,
                None => format!("step_{}", step.id),
            }
        }
        _ => {
            if step.description.is_empty() {
                format!("step_{}", step.id)
            } else {
                step.description.clone()
            }
        }
    }
}

/// The permission action implied by a tool's semantics.
pub fn derive_action(tool_name: &str) -> &'static str {
    match tool_name {
        "read_file" | "list_files" | "find_in_files" => "read",
        "write_file" => "write",
        "delete_file" => "delete",
        _ => "execute",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, EventFilter};
    use crate::tools::{ParamKind, ParamSpec, Params, Tool};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct SleepTool;

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep_tool"
        }
        fn description(&self) -> &str {
            "Sleep for a number of seconds"
        }
        fn schema(&self) -> &[ParamSpec] {
            const SCHEMA: &[ParamSpec] = &[ParamSpec::required("seconds", ParamKind::Number)];
            SCHEMA
        }
        async fn invoke(&self, params: &Params) -> ToolResult {
            let secs = params["seconds"].as_f64().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            ToolResult::success_result(json!("woke up"))
        }
    }

    struct FlakyTool;

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky_tool"
        }
        fn description(&self) -> &str {
            "Always reports a transient failure"
        }
        fn schema(&self) -> &[ParamSpec] {
            &[]
        }
        async fn invoke(&self, _params: &Params) -> ToolResult {
            ToolResult::error_result("upstream briefly unavailable", ErrorKind::ToolTransient)
        }
    }

    fn setup() -> (StepExecutor, Arc<AuditLog>, Arc<ArtifactStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLog::new(&dir.path().join("logs")).unwrap());
        let artifacts = Arc::new(ArtifactStore::new(&dir.path().join("ARTIFACTS")).unwrap());
        let registry = Arc::new(ToolRegistry::with_builtins());
        registry.register(Arc::new(SleepTool));
        registry.register(Arc::new(FlakyTool));
        let permissions = Arc::new(PermissionEngine::with_defaults(audit.clone()));
        // Grant execute to the synthetic test tools; the default rule set
        // only knows the built-in file tools.
        permissions.add_rule(
            crate::permissions::PermissionRule::new(
                "allow_test_tools",
                "Test Tool Access",
                "",
                crate::permissions::ResourceType::Command,
                ".*",
                vec![
                    "sleep_tool".into(),
                    "flaky_tool".into(),
                    "no_such_tool".into(),
                ],
                crate::permissions::PermissionLevel::Execute,
                5,
            )
            .unwrap(),
        );
        let executor = StepExecutor::new(registry, permissions, artifacts.clone(), audit.clone());
        (executor, audit, artifacts, dir)
    }

    fn params(value: serde_json::Value) -> Params {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn successful_step_completes_with_artifact() {
        let (executor, audit, artifacts, dir) = setup();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        let path = dir.path().join("hello.txt").display().to_string();
        let mut step = PlanStep::new("read_file", params(json!({"path": path})), "Read a file");

        let outcome = executor.execute("plan1", "run_1_aaaaaaaa", &mut step).await;

        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.completed_at.is_some());
        let summary = step.result.as_ref().unwrap();
        assert!(summary.success);
        assert!(summary.artifact_path.is_some());
        assert!(summary.output_preview.len() <= 200);
        assert_eq!(artifacts.list_run("run_1_aaaaaaaa").unwrap().len(), 1);

        // permission_check then start marker then end marker.
        let all: Vec<_> = audit
            .recent_events(10, &EventFilter::default())
            .into_iter()
            .rev()
            .map(|e| (e.event_type, e.result))
            .collect();
        // Skip the initialize and setup policy-change events.
        let tail = &all[2..];
        assert_eq!(tail[0].0, AuditEventType::PermissionCheck);
        assert_eq!(tail[1], (AuditEventType::ToolExecution, "failure".into()));
        assert_eq!(tail[2], (AuditEventType::ToolExecution, "success".into()));
    }

    #[tokio::test]
    async fn denied_step_fails_without_artifact() {
        let (executor, audit, artifacts, _dir) = setup();
        let mut step = PlanStep::new(
            "bash_execute",
            params(json!({"command": "rm -rf /etc"})),
            "Destroy system config",
        );

        let outcome = executor.execute("plan1", "run_1_bbbbbbbb", &mut step).await;

        assert_eq!(outcome, StepOutcome::Failed);
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error_message.as_ref().unwrap().contains("denied"));
        assert!(artifacts.list_run("run_1_bbbbbbbb").unwrap().is_empty());

        let denials =
            audit.recent_events(10, &EventFilter::by_type(AuditEventType::PermissionDenied));
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].severity, crate::audit::Severity::Warning);
    }

    #[tokio::test]
    async fn timeout_retries_until_exhausted_then_fails() {
        let (executor, _audit, _artifacts, _dir) = setup();
        let mut step = PlanStep::new(
            "sleep_tool",
            params(json!({"seconds": 5.0})),
            "Sleep past the timeout",
        )
        .with_timeout(1);
        step.max_retries = 1;

        let outcome = executor.execute("p", "run_1_cccccccc", &mut step).await;
        assert_eq!(outcome, StepOutcome::Retrying);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 1);
        assert!(step.completed_at.is_none());

        let outcome = executor.execute("p", "run_1_cccccccc", &mut step).await;
        assert_eq!(outcome, StepOutcome::Failed);
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.retry_count, 1);
        assert!(step.error_message.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn zero_timeout_is_clamped_to_one_second() {
        let (executor, _audit, _artifacts, _dir) = setup();
        let mut step = PlanStep::new(
            "sleep_tool",
            params(json!({"seconds": 3.0})),
            "Sleep with zero timeout",
        )
        .with_timeout(0);
        step.max_retries = 0;

        let started = Instant::now();
        let outcome = executor.execute("p", "run_1_dddddddd", &mut step).await;
        assert_eq!(outcome, StepOutcome::Failed);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(step.error_message.as_ref().unwrap().contains("1 second"));
    }

    #[tokio::test]
    async fn transient_errors_are_retryable() {
        let (executor, _audit, _artifacts, _dir) = setup();
        let mut step = PlanStep::new("flaky_tool", Params::new(), "Transient failure");
        step.max_retries = 2;

        assert_eq!(
            executor.execute("p", "run_1_eeeeeeee", &mut step).await,
            StepOutcome::Retrying
        );
        assert_eq!(
            executor.execute("p", "run_1_eeeeeeee", &mut step).await,
            StepOutcome::Retrying
        );
        assert_eq!(
            executor.execute("p", "run_1_eeeeeeee", &mut step).await,
            StepOutcome::Failed
        );
        assert_eq!(step.retry_count, 2);
        assert!(step.retry_count <= step.max_retries);
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_retry() {
        let (executor, _audit, _artifacts, _dir) = setup();
        let mut step = PlanStep::new("no_such_tool", Params::new(), "Ghost tool");

        let outcome = executor.execute("p", "run_1_ffffffff", &mut step).await;
        assert_eq!(outcome, StepOutcome::Failed);
        assert_eq!(step.retry_count, 0);
        assert!(step.error_message.as_ref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn critical_risk_without_approval_gate_is_denied() {
        let (executor, _audit, _artifacts, _dir) = setup();
        let mut step = PlanStep::new(
            "bash_execute",
            params(json!({"command": "echo ok"})),
            "Critical without gate",
        )
        .with_risk(RiskLevel::Critical);

        let outcome = executor.execute("p", "run_1_00000000", &mut step).await;
        assert_eq!(outcome, StepOutcome::Failed);
        assert!(
            step.error_message
                .as_ref()
                .unwrap()
                .contains("explicit approval")
        );
    }

    #[test]
    fn resource_derivation_prefers_command_then_path() {
        let step = PlanStep::new(
            "bash_execute",
            params(json!({"command": "ls -la"})),
            "desc",
        );
        assert_eq!(derive_resource(&step), "ls -la");

        let step = PlanStep::new("read_file", params(json!({"path": "notes.txt"})), "desc");
        assert_eq!(derive_resource(&step), "./notes.txt");

        let step = PlanStep::new("read_file", params(json!({"path": "/tmp/x"})), "desc");
        assert_eq!(derive_resource(&step), "/tmp/x");

        let step = PlanStep::new("custom_tool", Params::new(), "Custom thing");
        assert_eq!(derive_resource(&step), "Custom thing");
    }

    #[test]
    fn action_derivation_matches_tool_semantics() {
        assert_eq!(derive_action("read_file"), "read");
        assert_eq!(derive_action("list_files"), "read");
        assert_eq!(derive_action("write_file"), "write");
        assert_eq!(derive_action("delete_file"), "delete");
        assert_eq!(derive_action("bash_execute"), "execute");
        assert_eq!(derive_action("anything_else"), "execute");
    }
}

//! Security audit event model.
//!
//! Every security-relevant decision in the orchestrator is recorded as an
//! `AuditEvent`: permission checks, tool and plan executions, approval
//! decisions, secret detections, sandbox violations. Events are append-only
//! and never mutated after emission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types of auditable security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PermissionCheck,
    PermissionDenied,
    SecretDetected,
    SecretRedacted,
    SandboxViolation,
    ToolExecution,
    PlanExecution,
    ApprovalRequired,
    ApprovalGranted,
    ApprovalDenied,
    SecurityPolicyChanged,
    SuspiciousActivity,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionCheck => "permission_check",
            Self::PermissionDenied => "permission_denied",
            Self::SecretDetected => "secret_detected",
            Self::SecretRedacted => "secret_redacted",
            Self::SandboxViolation => "sandbox_violation",
            Self::ToolExecution => "tool_execution",
            Self::PlanExecution => "plan_execution",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalGranted => "approval_granted",
            Self::ApprovalDenied => "approval_denied",
            Self::SecurityPolicyChanged => "security_policy_changed",
            Self::SuspiciousActivity => "suspicious_activity",
        }
    }
}

/// Event severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// A single audit event.
///
/// The wire form (journal lines, exports) is stable across versions;
/// consumers must tolerate unknown fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: Severity,
    /// Tool name, user, or "system".
    pub actor: String,
    /// File, command, network endpoint, or plan reference.
    pub resource: String,
    /// read, write, execute, start, complete, ...
    pub action: String,
    /// allowed, denied, success, failure, ...
    pub result: String,
    pub details: Value,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// Correlation fields linking an event to its execution context.
#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub run_id: Option<String>,
    pub plan_id: Option<String>,
    pub tool_name: Option<String>,
}

impl Correlation {
    pub fn tool(name: &str) -> Self {
        Self {
            tool_name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn plan(plan_id: &str) -> Self {
        Self {
            plan_id: Some(plan_id.to_string()),
            ..Self::default()
        }
    }
}

/// Approval lifecycle stages, mapped onto the three approval event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Required,
    Granted,
    Denied,
}

impl ApprovalAction {
    pub fn event_type(&self) -> AuditEventType {
        match self {
            Self::Required => AuditEventType::ApprovalRequired,
            Self::Granted => AuditEventType::ApprovalGranted,
            Self::Denied => AuditEventType::ApprovalDenied,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }
}

pub mod log;
pub use log::{AuditLog, AuditSummary, EventFilter, ExportFormat};

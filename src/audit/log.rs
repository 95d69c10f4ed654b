//! Append-only audit log: bounded in-memory ring plus durable journal.
//!
//! The journal (`security_audit.log`) holds one JSON object per line and is
//! opened in append mode, so events accumulate across sessions. The ring
//! keeps the most recent events for cheap queries and summaries.
//!
//! A journal write failure must never hide the underlying operation's error
//! behind an infrastructure error, so `AuditLog` never returns errors to
//! callers: the first failure is reported once through `tracing::error` and
//! subsequent events keep flowing into the ring.

use super::{ApprovalAction, AuditEvent, AuditEventType, Correlation, Severity};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum events retained in memory.
const RING_CAPACITY: usize = 1000;

/// Export formats supported by [`AuditLog::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON object per line.
    Json,
    /// Fixed column set; the `details` blob is dropped.
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => bail!("Unsupported export format '{}'. Valid values: json, csv", s),
        }
    }
}

/// Filters applied by [`AuditLog::recent_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<AuditEventType>,
    pub severity: Option<Severity>,
    /// Case-insensitive substring match on the actor.
    pub actor: Option<String>,
}

impl EventFilter {
    pub fn by_type(event_type: AuditEventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Self::default()
        }
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(t) = self.event_type
            && event.event_type != t
        {
            return false;
        }
        if let Some(s) = self.severity
            && event.severity != s
        {
            return false;
        }
        if let Some(ref actor) = self.actor
            && !event.actor.to_lowercase().contains(&actor.to_lowercase())
        {
            return false;
        }
        true
    }
}

/// Aggregate counts over the in-memory ring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditSummary {
    pub total_events: usize,
    pub session_id: String,
    pub events_by_type: HashMap<String, usize>,
    pub events_by_severity: HashMap<String, usize>,
    pub permission_denials: usize,
    pub secret_detections: usize,
    pub recent_critical_events: usize,
    pub journal_path: PathBuf,
}

struct Inner {
    ring: VecDeque<AuditEvent>,
    journal: Option<File>,
}

/// The audit event sink shared by every component.
pub struct AuditLog {
    journal_path: PathBuf,
    session_id: String,
    inner: Mutex<Inner>,
    write_failed: AtomicBool,
}

impl AuditLog {
    /// Open (or create) the journal under `log_dir` and start a new session.
    pub fn new(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let journal_path = log_dir.join("security_audit.log");
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .with_context(|| format!("Failed to open audit journal {}", journal_path.display()))?;

        let session_id = format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let log = Self {
            journal_path: journal_path.clone(),
            session_id: session_id.clone(),
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(RING_CAPACITY),
                journal: Some(journal),
            }),
            write_failed: AtomicBool::new(false),
        };

        log.log_event(
            AuditEventType::ToolExecution,
            Severity::Info,
            "system",
            "audit_log",
            "initialize",
            "success",
            json!({ "session_id": session_id, "journal": journal_path.display().to_string() }),
            Correlation::default(),
        );
        Ok(log)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Record one event: stamp it, push it onto the ring, append it to the
    /// journal, and flush before returning.
    #[allow(clippy::too_many_arguments)]
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        severity: Severity,
        actor: &str,
        resource: &str,
        action: &str,
        result: &str,
        details: Value,
        correlation: Correlation,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            event_type,
            severity,
            actor: actor.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            details,
            session_id: self.session_id.clone(),
            run_id: correlation.run_id,
            plan_id: correlation.plan_id,
            tool_name: correlation.tool_name,
        };

        let mut inner = self.inner.lock().expect("audit lock poisoned");
        if inner.ring.len() >= RING_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());

        if let Some(ref mut journal) = inner.journal {
            let write = serde_json::to_string(&event)
                .map_err(anyhow::Error::from)
                .and_then(|line| {
                    writeln!(journal, "{line}")?;
                    journal.flush()?;
                    Ok(())
                });
            if let Err(err) = write
                && !self.write_failed.swap(true, Ordering::SeqCst)
            {
                tracing::error!(error = %err, "audit journal write failed; events continue in memory only");
            }
        }
    }

    /// Log a permission decision. Every check produces a `permission_check`
    /// record; denials additionally produce `permission_denied` at warning
    /// severity, so each denial pairs with an earlier-or-equal check.
    pub fn log_permission_check(
        &self,
        tool_name: &str,
        resource: &str,
        action: &str,
        allowed: bool,
        rule_id: Option<&str>,
    ) {
        let result = if allowed { "allowed" } else { "denied" };
        self.log_event(
            AuditEventType::PermissionCheck,
            Severity::Info,
            tool_name,
            resource,
            action,
            result,
            json!({ "rule_id": rule_id }),
            Correlation::tool(tool_name),
        );
        if !allowed {
            self.log_event(
                AuditEventType::PermissionDenied,
                Severity::Warning,
                tool_name,
                resource,
                action,
                result,
                json!({ "rule_id": rule_id }),
                Correlation::tool(tool_name),
            );
        }
    }

    pub fn log_secret_detection(
        &self,
        file_path: &str,
        secret_type: &str,
        line_number: usize,
        redacted: bool,
    ) {
        let (event_type, severity) = if redacted {
            (AuditEventType::SecretRedacted, Severity::Warning)
        } else {
            (AuditEventType::SecretDetected, Severity::Error)
        };
        self.log_event(
            event_type,
            severity,
            "secrets_scanner",
            file_path,
            "scan",
            if redacted { "redacted" } else { "detected" },
            json!({ "secret_type": secret_type, "line_number": line_number }),
            Correlation::default(),
        );
    }

    pub fn log_sandbox_violation(
        &self,
        tool_name: &str,
        violated_resource: &str,
        violation_type: &str,
        blocked: bool,
    ) {
        self.log_event(
            AuditEventType::SandboxViolation,
            if blocked { Severity::Warning } else { Severity::Error },
            tool_name,
            violated_resource,
            "access_attempt",
            if blocked { "blocked" } else { "allowed" },
            json!({ "violation_type": violation_type }),
            Correlation::tool(tool_name),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_tool_execution(
        &self,
        tool_name: &str,
        resource: &str,
        success: bool,
        duration_ms: u64,
        exit_code: Option<i64>,
        output_size: Option<usize>,
        run_id: Option<&str>,
        plan_id: Option<&str>,
    ) {
        self.log_event(
            AuditEventType::ToolExecution,
            if success { Severity::Info } else { Severity::Error },
            tool_name,
            resource,
            "execute",
            if success { "success" } else { "failure" },
            json!({
                "duration_ms": duration_ms,
                "exit_code": exit_code,
                "output_size_bytes": output_size,
            }),
            Correlation {
                run_id: run_id.map(String::from),
                plan_id: plan_id.map(String::from),
                tool_name: Some(tool_name.to_string()),
            },
        );
    }

    pub fn log_plan_execution(
        &self,
        plan_id: &str,
        action: &str,
        result: &str,
        step_count: usize,
        duration_ms: Option<u64>,
    ) {
        self.log_event(
            AuditEventType::PlanExecution,
            Severity::Info,
            "plan_manager",
            &format!("plan:{plan_id}"),
            action,
            result,
            json!({ "step_count": step_count, "duration_ms": duration_ms }),
            Correlation::plan(plan_id),
        );
    }

    pub fn log_approval_event(
        &self,
        plan_id: &str,
        step_id: &str,
        action: ApprovalAction,
        tool_name: &str,
        risk_level: &str,
    ) {
        self.log_event(
            action.event_type(),
            Severity::Info,
            "user",
            &format!("plan:{plan_id}:step:{step_id}"),
            action.as_str(),
            "logged",
            json!({ "step_id": step_id, "risk_level": risk_level }),
            Correlation {
                plan_id: Some(plan_id.to_string()),
                tool_name: Some(tool_name.to_string()),
                run_id: None,
            },
        );
    }

    pub fn log_policy_change(&self, rule_id: &str, action: &str) {
        self.log_event(
            AuditEventType::SecurityPolicyChanged,
            Severity::Info,
            "permission_engine",
            &format!("rule:{rule_id}"),
            action,
            "applied",
            json!({ "rule_id": rule_id }),
            Correlation::default(),
        );
    }

    /// Events from the ring in reverse chronological order, filtered, at
    /// most `limit`.
    pub fn recent_events(&self, limit: usize, filter: &EventFilter) -> Vec<AuditEvent> {
        let inner = self.inner.lock().expect("audit lock poisoned");
        inner
            .ring
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Aggregate counts across the ring.
    pub fn summary(&self) -> AuditSummary {
        let inner = self.inner.lock().expect("audit lock poisoned");
        let mut events_by_type: HashMap<String, usize> = HashMap::new();
        let mut events_by_severity: HashMap<String, usize> = HashMap::new();
        let mut permission_denials = 0;
        let mut secret_detections = 0;
        let mut recent_critical_events = 0;

        for event in &inner.ring {
            *events_by_type
                .entry(event.event_type.as_str().to_string())
                .or_default() += 1;
            *events_by_severity
                .entry(event.severity.as_str().to_string())
                .or_default() += 1;
            match event.event_type {
                AuditEventType::PermissionDenied => permission_denials += 1,
                AuditEventType::SecretDetected | AuditEventType::SecretRedacted => {
                    secret_detections += 1
                }
                _ => {}
            }
            if event.severity >= Severity::Error {
                recent_critical_events += 1;
            }
        }

        AuditSummary {
            total_events: inner.ring.len(),
            session_id: self.session_id.clone(),
            events_by_type,
            events_by_severity,
            permission_denials,
            secret_detections,
            recent_critical_events,
            journal_path: self.journal_path.clone(),
        }
    }

    /// Export the ring to `path` in the given format.
    pub fn export(&self, path: &Path, format: ExportFormat) -> Result<PathBuf> {
        let inner = self.inner.lock().expect("audit lock poisoned");
        let mut out = File::create(path)
            .with_context(|| format!("Failed to create export file {}", path.display()))?;

        match format {
            ExportFormat::Json => {
                for event in &inner.ring {
                    writeln!(out, "{}", serde_json::to_string(event)?)?;
                }
            }
            ExportFormat::Csv => {
                writeln!(
                    out,
                    "timestamp,event_type,severity,actor,resource,action,result,session_id,run_id,plan_id,tool_name"
                )?;
                for event in &inner.ring {
                    writeln!(
                        out,
                        "{},{},{},{},{},{},{},{},{},{},{}",
                        event.timestamp.to_rfc3339(),
                        event.event_type.as_str(),
                        event.severity.as_str(),
                        csv_field(&event.actor),
                        csv_field(&event.resource),
                        csv_field(&event.action),
                        csv_field(&event.result),
                        event.session_id,
                        event.run_id.as_deref().unwrap_or(""),
                        event.plan_id.as_deref().unwrap_or(""),
                        event.tool_name.as_deref().unwrap_or(""),
                    )?;
                }
            }
        }
        out.flush()?;
        Ok(path.to_path_buf())
    }
}

/// Quote a CSV field when it contains a delimiter or quote.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

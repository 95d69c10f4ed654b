//! `conductor logs ...` commands.

use super::App;
use crate::audit::{AuditEvent, AuditEventType, EventFilter, ExportFormat, Severity};
use anyhow::Result;
use clap::Subcommand;
use console::style;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum LogsCommands {
    /// Most recent events (default)
    Recent {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Aggregate counts by type and severity
    Summary,
    /// Permission denials
    Permissions,
    /// Secret detections and sandbox violations
    Security,
    /// Secret detections only
    Secrets,
    /// Tool execution events
    Tools,
    /// Plan execution events
    Plans,
    /// Error and critical events
    Errors,
    /// Export the in-memory ring to a file
    Export {
        output: PathBuf,
        #[arg(long, default_value = "json")]
        format: String,
    },
}

pub fn cmd_logs(app: &App, command: &Option<LogsCommands>) -> Result<()> {
    match command.as_ref().unwrap_or(&LogsCommands::Recent { limit: 20 }) {
        LogsCommands::Recent { limit } => {
            print_events(&app.audit.recent_events(*limit, &EventFilter::default()))
        }
        LogsCommands::Summary => {
            let summary = app.audit.summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        LogsCommands::Permissions => print_events(
            &app.audit
                .recent_events(100, &EventFilter::by_type(AuditEventType::PermissionDenied)),
        ),
        LogsCommands::Security => {
            let mut events = app
                .audit
                .recent_events(100, &EventFilter::by_type(AuditEventType::SecretDetected));
            events.extend(
                app.audit
                    .recent_events(100, &EventFilter::by_type(AuditEventType::SecretRedacted)),
            );
            events.extend(
                app.audit
                    .recent_events(100, &EventFilter::by_type(AuditEventType::SandboxViolation)),
            );
            events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            print_events(&events)
        }
        LogsCommands::Secrets => {
            let mut events = app
                .audit
                .recent_events(100, &EventFilter::by_type(AuditEventType::SecretDetected));
            events.extend(
                app.audit
                    .recent_events(100, &EventFilter::by_type(AuditEventType::SecretRedacted)),
            );
            events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            print_events(&events)
        }
        LogsCommands::Tools => print_events(
            &app.audit
                .recent_events(100, &EventFilter::by_type(AuditEventType::ToolExecution)),
        ),
        LogsCommands::Plans => print_events(
            &app.audit
                .recent_events(100, &EventFilter::by_type(AuditEventType::PlanExecution)),
        ),
        LogsCommands::Errors => {
            let mut events = app.audit.recent_events(
                100,
                &EventFilter {
                    severity: Some(Severity::Error),
                    ..Default::default()
                },
            );
            events.extend(app.audit.recent_events(
                100,
                &EventFilter {
                    severity: Some(Severity::Critical),
                    ..Default::default()
                },
            ));
            events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            print_events(&events)
        }
        LogsCommands::Export { output, format } => {
            let format: ExportFormat = format
                .parse()
                .map_err(|err: anyhow::Error| {
                    crate::errors::OrchestratorError::ConfigValidation(err.to_string())
                })?;
            let path = app.audit.export(output, format)?;
            println!("{} {}", style("Exported to").green().bold(), path.display());
            Ok(())
        }
    }
}

fn print_events(events: &[AuditEvent]) -> Result<()> {
    if events.is_empty() {
        println!("No events");
        return Ok(());
    }
    for event in events {
        let severity = match event.severity {
            Severity::Error | Severity::Critical => style(event.severity.as_str()).red(),
            Severity::Warning => style(event.severity.as_str()).yellow(),
            _ => style(event.severity.as_str()).dim(),
        };
        println!(
            "{} {:<22} {:<8} {} {} {} -> {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type.as_str(),
            severity,
            event.actor,
            event.action,
            event.resource,
            event.result
        );
    }
    Ok(())
}

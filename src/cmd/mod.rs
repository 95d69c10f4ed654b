//! CLI command implementations.
//!
//! | Module        | Commands handled                          |
//! |---------------|-------------------------------------------|
//! | `plan`        | `plan create|list|show|status|delete`     |
//! | `run`         | `run`, `approve`, `stop`                  |
//! | `logs`        | `logs ...`                                |
//! | `permissions` | `permissions ...`                         |

use crate::audit::AuditLog;
use crate::orchestrator::PlanManager;
use crate::permissions::PermissionEngine;
use std::sync::Arc;

pub mod logs;
pub mod permissions;
pub mod plan;
pub mod run;

/// The wired-up component stack shared by every command.
pub struct App {
    pub audit: Arc<AuditLog>,
    pub permissions: Arc<PermissionEngine>,
    pub manager: PlanManager,
}

//! Typed error hierarchy for the orchestrator.
//!
//! Two layers cover the two failure surfaces:
//! - `OrchestratorError` — plan-level failures surfaced to callers
//! - `ErrorKind` — the per-step taxonomy carried on `ToolResult`, used by
//!   the executor to decide whether a step may be retried

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced from plan-level operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Plan {0} not found")]
    PlanNotFound(String),

    #[error("Plan {id} cannot be executed (status: {status})")]
    PlanNotExecutable { id: String, status: String },

    #[error("Plan validation failed: {0}")]
    ConfigValidation(String),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Process exit code for the CLI: 1 for user errors, 2 for system errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PlanNotFound(_) | Self::PlanNotExecutable { .. } | Self::ConfigValidation(_) => 1,
            Self::Storage(_) | Self::Other(_) => 2,
        }
    }
}

/// Classification of a step failure, carried on `ToolResult`.
///
/// Only `StepTimeout` and `ToolTransient` are retryable; everything else
/// finalizes the step on first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    ToolNotFound,
    InvalidParams,
    StepTimeout,
    StepExecutionError,
    ToolTransient,
    StorageError,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried while retries remain.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepTimeout | Self::ToolTransient)
    }

    /// Stable machine-readable code recorded on results and in the journal.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::StepExecutionError => "STEP_EXECUTION_ERROR",
            Self::ToolTransient => "TOOL_TRANSIENT",
            Self::StorageError => "STORAGE_ERROR",
        }
    }
}

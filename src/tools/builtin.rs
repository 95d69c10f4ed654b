//! Built-in toolset.
//!
//! A minimal set of file and shell capabilities so plans execute end-to-end
//! without external tool providers. Param names match what the rule-based
//! plan generator emits.

use super::{ParamKind, ParamSpec, Params, Tool, ToolRegistry, ToolResult};
use crate::errors::ErrorKind;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

/// Register every built-in tool.
pub fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register(Arc::new(ListFilesTool));
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(FindInFilesTool));
    registry.register(Arc::new(BashExecuteTool));
}

fn str_param<'a>(params: &'a Params, name: &str) -> &'a str {
    params.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Enumerate directory entries, optionally recursive.
pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files under a directory"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("path", ParamKind::String),
            ParamSpec::optional("recursive", ParamKind::Bool),
        ];
        SCHEMA
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let path = str_param(params, "path");
        let recursive = params
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut walker = WalkDir::new(path);
        if !recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry in walker.into_iter() {
            match entry {
                Ok(entry) => {
                    if entry.depth() > 0 {
                        files.push(entry.path().display().to_string());
                    }
                }
                Err(err) => {
                    return ToolResult::error_result(
                        format!("Failed to list '{path}': {err}"),
                        ErrorKind::StepExecutionError,
                    );
                }
            }
        }
        files.sort();
        ToolResult::success_result(json!({ "path": path, "entries": files, "count": files.len() }))
    }
}

/// Read a UTF-8 file.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[ParamSpec::required("path", ParamKind::String)];
        SCHEMA
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let path = str_param(params, "path");
        match tokio::fs::read_to_string(path).await {
            Ok(content) => ToolResult::success_result(json!({
                "path": path,
                "content": content,
                "size": content.len(),
            })),
            Err(err) => ToolResult::error_result(
                format!("Failed to read '{path}': {err}"),
                ErrorKind::StepExecutionError,
            ),
        }
    }
}

/// Write (create or overwrite) a UTF-8 file, creating parent directories.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("path", ParamKind::String),
            ParamSpec::required("content", ParamKind::String),
        ];
        SCHEMA
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let path = str_param(params, "path");
        let content = str_param(params, "content");

        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = tokio::fs::create_dir_all(parent).await
        {
            return ToolResult::error_result(
                format!("Failed to create parent of '{path}': {err}"),
                ErrorKind::StepExecutionError,
            );
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolResult::success_result(json!({
                "path": path,
                "bytes_written": content.len(),
            })),
            Err(err) => ToolResult::error_result(
                format!("Failed to write '{path}': {err}"),
                ErrorKind::StepExecutionError,
            ),
        }
    }
}

/// Search file contents for a regex pattern.
pub struct FindInFilesTool;

#[async_trait]
impl Tool for FindInFilesTool {
    fn name(&self) -> &str {
        "find_in_files"
    }

    fn description(&self) -> &str {
        "Search files under a directory for a regex pattern"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("pattern", ParamKind::String),
            ParamSpec::optional("path", ParamKind::String),
            ParamSpec::optional("max_matches", ParamKind::Integer),
        ];
        SCHEMA
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let pattern = str_param(params, "pattern");
        let root = params
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".");
        let max_matches = params
            .get("max_matches")
            .and_then(Value::as_u64)
            .unwrap_or(200) as usize;

        let regex = match regex::Regex::new(pattern) {
            Ok(regex) => regex,
            Err(err) => {
                return ToolResult::error_result(
                    format!("Invalid pattern '{pattern}': {err}"),
                    ErrorKind::StepExecutionError,
                );
            }
        };

        let mut matches = Vec::new();
        'outer: for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            for (line_number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(json!({
                        "file": entry.path().display().to_string(),
                        "line": line_number + 1,
                        "text": line.trim_end(),
                    }));
                    if matches.len() >= max_matches {
                        break 'outer;
                    }
                }
            }
        }

        ToolResult::success_result(json!({
            "pattern": pattern,
            "path": root,
            "matches": matches,
            "count": matches.len(),
        }))
    }
}

/// Run a shell command and capture stdout, stderr, and the exit code.
pub struct BashExecuteTool;

#[async_trait]
impl Tool for BashExecuteTool {
    fn name(&self) -> &str {
        "bash_execute"
    }

    fn description(&self) -> &str {
        "Execute a shell command"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("command", ParamKind::String),
            ParamSpec::optional("cwd", ParamKind::String),
        ];
        SCHEMA
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let command = str_param(params, "command");
        let mut process = tokio::process::Command::new("sh");
        process.arg("-c").arg(command);
        if let Some(cwd) = params.get("cwd").and_then(Value::as_str) {
            process.current_dir(cwd);
        }

        match process.output().await {
            Ok(output) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let payload = json!({
                    "command": command,
                    "exit_code": exit_code,
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": String::from_utf8_lossy(&output.stderr),
                });
                if output.status.success() {
                    ToolResult::success_result(payload)
                } else {
                    let mut result = ToolResult::error_result(
                        format!("Command exited with code {exit_code}"),
                        ErrorKind::StepExecutionError,
                    );
                    result.output = payload;
                    result
                }
            }
            Err(err) => ToolResult::error_result(
                format!("Failed to spawn command: {err}"),
                ErrorKind::StepExecutionError,
            ),
        }
    }
}

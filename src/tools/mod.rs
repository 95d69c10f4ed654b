//! Tool invocation contract and registry.
//!
//! A tool is an externally implemented capability callable by name with a
//! parameter mapping. Tools must not raise for user-domain errors — they
//! return a [`ToolResult`] with an appropriate error kind; panics are
//! reserved for implementation bugs. Implementations must be safe for
//! concurrent invocation.

use crate::errors::ErrorKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub mod builtin;

/// Parameter mapping handed to a tool.
pub type Params = serde_json::Map<String, Value>;

/// Result status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
    Denied,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Denied => "denied",
        }
    }
}

/// Outcome of a single tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub status: ToolStatus,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(with = "secs_f64")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolResult {
    pub fn success_result(output: Value) -> Self {
        Self {
            success: true,
            status: ToolStatus::Success,
            output,
            artifact_path: None,
            error_message: None,
            error_code: None,
            duration: Duration::ZERO,
            error_kind: None,
        }
    }

    pub fn error_result(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            success: false,
            status: ToolStatus::Error,
            output: Value::Null,
            artifact_path: None,
            error_message: Some(message.into()),
            error_code: Some(kind.code().to_string()),
            duration: Duration::ZERO,
            error_kind: Some(kind),
        }
    }

    pub fn denied_result(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            status: ToolStatus::Denied,
            ..Self::error_result(message, kind)
        }
    }

    pub fn timeout_result(seconds: u64) -> Self {
        Self {
            status: ToolStatus::Timeout,
            ..Self::error_result(
                format!("Step timed out after {seconds} seconds"),
                ErrorKind::StepTimeout,
            )
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Exit code reported in the output payload, when the tool provides one.
    pub fn exit_code(&self) -> Option<i64> {
        self.output.get("exit_code").and_then(Value::as_i64)
    }
}

/// Declared parameter types for schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Bool,
    Integer,
    Number,
    Array,
    Object,
    Any,
}

impl ParamKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

/// One declared parameter of a tool's function schema.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// The capability contract every tool satisfies.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Declared parameter schema, validated before every invocation.
    fn schema(&self) -> &[ParamSpec];

    async fn invoke(&self, params: &Params) -> ToolResult;
}

struct Registration {
    tool: Arc<dyn Tool>,
    enabled: bool,
}

/// Lookup, enable/disable, and invocation of tools by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Registration>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in toolset.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        builtin::register_builtin_tools(&registry);
        registry
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().expect("registry lock poisoned");
        tools.insert(name, Registration { tool, enabled: true });
    }

    /// The tool if registered and enabled.
    pub fn get_enabled(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().expect("registry lock poisoned");
        tools
            .get(name)
            .filter(|r| r.enabled)
            .map(|r| r.tool.clone())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut tools = self.tools.write().expect("registry lock poisoned");
        match tools.get_mut(name) {
            Some(registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Names of enabled tools, sorted.
    pub fn list_enabled(&self) -> Vec<String> {
        let tools = self.tools.read().expect("registry lock poisoned");
        let mut names: Vec<String> = tools
            .iter()
            .filter(|(_, r)| r.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Look up and invoke a tool, validating parameters first.
    ///
    /// An unknown or disabled name yields a `ToolNotFound` error result; a
    /// schema violation yields a `denied` result before any side effect.
    pub async fn execute(&self, name: &str, params: &Params) -> ToolResult {
        let Some(tool) = self.get_enabled(name) else {
            return ToolResult::error_result(
                format!("Tool '{name}' not found or not enabled"),
                ErrorKind::ToolNotFound,
            );
        };
        if let Err(problem) = validate_params(tool.schema(), params) {
            return ToolResult::denied_result(
                format!("Invalid parameters for '{name}': {problem}"),
                ErrorKind::InvalidParams,
            );
        }
        tool.invoke(params).await
    }
}

fn validate_params(schema: &[ParamSpec], params: &Params) -> Result<(), String> {
    for spec in schema {
        match params.get(spec.name) {
            Some(value) => {
                if !spec.kind.accepts(value) {
                    return Err(format!("parameter '{}' has the wrong type", spec.name));
                }
            }
            None if spec.required => {
                return Err(format!("missing required parameter '{}'", spec.name));
            }
            None => {}
        }
    }
    Ok(())
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the message parameter back"
        }

        fn schema(&self) -> &[ParamSpec] {
            const SCHEMA: &[ParamSpec] = &[
                ParamSpec::required("message", ParamKind::String),
                ParamSpec::optional("repeat", ParamKind::Integer),
            ];
            SCHEMA
        }

        async fn invoke(&self, params: &Params) -> ToolResult {
            ToolResult::success_result(params["message"].clone())
        }
    }

    fn params(value: Value) -> Params {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn execute_invokes_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let result = registry
            .execute("echo", &params(json!({"message": "hi"})))
            .await;
        assert!(result.success);
        assert_eq!(result.output, json!("hi"));
    }

    #[tokio::test]
    async fn unknown_tool_yields_tool_not_found() {
        let registry = ToolRegistry::new();
        let result = registry.execute("missing", &Params::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ToolNotFound));
    }

    #[tokio::test]
    async fn disabled_tool_is_invisible() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.set_enabled("echo", false));
        assert!(registry.get_enabled("echo").is_none());

        let result = registry
            .execute("echo", &params(json!({"message": "hi"})))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::ToolNotFound));
        assert!(!registry.list_enabled().contains(&"echo".to_string()));
    }

    #[tokio::test]
    async fn missing_required_param_is_denied_before_invocation() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let result = registry.execute("echo", &Params::new()).await;
        assert_eq!(result.status, ToolStatus::Denied);
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidParams));
        assert!(result.error_message.unwrap().contains("message"));
    }

    #[tokio::test]
    async fn wrong_param_type_is_denied() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let result = registry
            .execute("echo", &params(json!({"message": 42})))
            .await;
        assert_eq!(result.status, ToolStatus::Denied);
    }

    #[test]
    fn tool_result_constructors_set_kind_and_code() {
        let result = ToolResult::timeout_result(30);
        assert_eq!(result.status, ToolStatus::Timeout);
        assert_eq!(result.error_kind, Some(ErrorKind::StepTimeout));
        assert_eq!(result.error_code.as_deref(), Some("STEP_TIMEOUT"));
        assert!(result.error_message.unwrap().contains("30"));
    }

    #[test]
    fn exit_code_reads_from_output_payload() {
        let mut result = ToolResult::success_result(json!({"exit_code": 0, "stdout": ""}));
        assert_eq!(result.exit_code(), Some(0));
        result.output = json!("plain");
        assert_eq!(result.exit_code(), None);
    }

    #[test]
    fn tool_result_duration_round_trips_as_seconds() {
        let result =
            ToolResult::success_result(json!(null)).with_duration(Duration::from_millis(1500));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], json!(1.5));
        let back: ToolResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }
}

//! Typed configuration sections.
//!
//! Configuration lives in four YAML documents inside a config directory:
//! `api_config.yaml` (generation parameters), `system_config.yaml`
//! (system / agent / scheduler sections), `commands.yaml` (the slash-command
//! table), and `persona_config.yaml` (nested persona sections, accessed via
//! dotted paths). Missing files yield defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Model generation parameters from `api_config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_temperature() -> f64 {
    0.1
}

fn default_top_k() -> u32 {
    32
}

fn default_top_p() -> f64 {
    0.9
}

fn default_max_output_tokens() -> u32 {
    8192
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl GenerationSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(0.0..=2.0).contains(&self.temperature) {
            problems.push("generation.temperature must be between 0 and 2".to_string());
        }
        if self.max_output_tokens == 0 {
            problems.push("generation.max_output_tokens must be positive".to_string());
        }
        if self.top_k == 0 || self.top_k > 100 {
            problems.push("generation.top_k must be between 1 and 100".to_string());
        }
        problems
    }
}

/// System flags from `system_config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_timeout() -> u64 {
    3600
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            debug_mode: false,
            log_level: default_log_level(),
            session_timeout: default_session_timeout(),
        }
    }
}

/// Agent limits from `system_config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
}

fn default_max_context_tokens() -> u32 {
    8000
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

/// Scheduler defaults from `system_config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_max_concurrent_steps() -> usize {
    1
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_tick_ms() -> u64 {
    100
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            default_timeout_seconds: default_timeout_seconds(),
            tick_ms: default_tick_ms(),
        }
    }
}

/// One entry of the command table in `commands.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub description: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_command_enabled")]
    pub enabled: bool,
}

fn default_command_enabled() -> bool {
    true
}

/// The aggregate configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub system: SystemSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub commands: HashMap<String, CommandSpec>,
}

impl OrchestratorConfig {
    /// Human-readable validation problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.generation.validate();
        if self.system.session_timeout == 0 {
            problems.push("system.session_timeout must be positive".to_string());
        }
        if self.agent.max_context_tokens == 0 {
            problems.push("agent.max_context_tokens must be positive".to_string());
        }
        if self.scheduler.max_concurrent_steps == 0 {
            problems.push("scheduler.max_concurrent_steps must be positive".to_string());
        }
        problems
    }
}

pub mod store;
pub use store::{ConfigStore, ConfigWatcher, PersonaChange};

//! Configuration store with atomic writes and file-watch hot reload.
//!
//! The store owns one mutable configuration document plus the persona
//! document; consumers receive clones or typed accessors. Reloads triggered
//! by the watcher keep the previous good configuration when the new content
//! fails validation.

use super::{CommandSpec, OrchestratorConfig, SchedulerSettings};
use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, mpsc};

const API_CONFIG: &str = "api_config.yaml";
const SYSTEM_CONFIG: &str = "system_config.yaml";
const COMMANDS_CONFIG: &str = "commands.yaml";
const PERSONA_CONFIG: &str = "persona_config.yaml";

/// Kind of change reported to persona observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonaChange {
    Added,
    Updated,
    Removed,
}

impl PersonaChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }
}

/// Callback invoked with `(persona_id, new_config, change)`.
///
/// Observer errors are logged and never abort a reload.
pub type PersonaObserver = Box<dyn Fn(&str, &Value, PersonaChange) -> Result<()> + Send + Sync>;

/// The configuration store. Share it as `Arc<ConfigStore>`.
pub struct ConfigStore {
    config_dir: PathBuf,
    state: RwLock<OrchestratorConfig>,
    persona: RwLock<Value>,
    /// Also serializes observer dispatch: held for the whole notification
    /// pass, so one observer never races another.
    observers: Mutex<Vec<PersonaObserver>>,
}

impl ConfigStore {
    pub fn new(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory {}", config_dir.display()))?;
        let store = Self {
            config_dir: config_dir.to_path_buf(),
            state: RwLock::new(OrchestratorConfig::default()),
            persona: RwLock::new(Value::Null),
            observers: Mutex::new(Vec::new()),
        };
        store.reload()?;
        store.reload_persona();
        Ok(store)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// A defensive copy of the current configuration.
    pub fn config(&self) -> OrchestratorConfig {
        self.state.read().expect("config lock poisoned").clone()
    }

    pub fn scheduler(&self) -> SchedulerSettings {
        self.state
            .read()
            .expect("config lock poisoned")
            .scheduler
            .clone()
    }

    /// Look up a command by name or alias.
    pub fn command(&self, name: &str) -> Option<CommandSpec> {
        let state = self.state.read().expect("config lock poisoned");
        if let Some(spec) = state.commands.get(name) {
            return Some(spec.clone());
        }
        state
            .commands
            .values()
            .find(|spec| spec.aliases.iter().any(|a| a == name))
            .cloned()
    }

    pub fn enabled_commands(&self) -> Vec<(String, CommandSpec)> {
        let state = self.state.read().expect("config lock poisoned");
        let mut commands: Vec<(String, CommandSpec)> = state
            .commands
            .iter()
            .filter(|(_, spec)| spec.enabled)
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();
        commands.sort_by(|a, b| a.0.cmp(&b.0));
        commands
    }

    /// Flip debug mode and persist the system section.
    pub fn update_debug_mode(&self, enabled: bool) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write().expect("config lock poisoned");
            state.system.debug_mode = enabled;
            state.system.log_level = if enabled { "debug" } else { "info" }.to_string();
            state.clone()
        };
        self.write_system_sections(&snapshot)
    }

    /// Reload every document from disk. Invalid content keeps the previous
    /// good configuration and reports `ConfigValidation`.
    pub fn reload(&self) -> Result<()> {
        let mut next = OrchestratorConfig::default();

        if let Some(doc) = self.read_yaml(API_CONFIG)? {
            next.generation = serde_yaml::from_value(doc)
                .map(|wrapper: ApiFile| wrapper.generation)
                .context("Failed to parse api_config.yaml")?;
        }
        if let Some(doc) = self.read_yaml(SYSTEM_CONFIG)? {
            let wrapper: SystemFile =
                serde_yaml::from_value(doc).context("Failed to parse system_config.yaml")?;
            next.system = wrapper.system;
            next.agent = wrapper.agent;
            next.scheduler = wrapper.scheduler;
        }
        if let Some(doc) = self.read_yaml(COMMANDS_CONFIG)? {
            let wrapper: CommandsFile =
                serde_yaml::from_value(doc).context("Failed to parse commands.yaml")?;
            next.commands = wrapper.commands;
        }

        let problems = next.validate();
        if !problems.is_empty() {
            return Err(OrchestratorError::ConfigValidation(problems.join("; ")).into());
        }

        *self.state.write().expect("config lock poisoned") = next;
        tracing::debug!(dir = %self.config_dir.display(), "configuration loaded");
        Ok(())
    }

    fn read_yaml(&self, file: &str) -> Result<Option<serde_yaml::Value>> {
        let path = self.config_dir.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let doc = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(doc))
    }

    fn write_system_sections(&self, config: &OrchestratorConfig) -> Result<()> {
        let wrapper = SystemFile {
            system: config.system.clone(),
            agent: config.agent.clone(),
            scheduler: config.scheduler.clone(),
        };
        self.write_atomic(SYSTEM_CONFIG, &serde_yaml::to_string(&wrapper)?)
    }

    /// Write-temp-and-rename so a watcher or reader never sees a torn file.
    fn write_atomic(&self, file: &str, content: &str) -> Result<()> {
        let path = self.config_dir.join(file);
        let tmp = self.config_dir.join(format!("{file}.tmp"));
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
        Ok(())
    }

    // ---- persona document -------------------------------------------------

    /// Read a nested persona value by dotted path.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        let doc = self.persona.read().expect("persona lock poisoned");
        let mut current = &*doc;
        for key in path.split('.') {
            current = current.get(key)?;
        }
        Some(current.clone())
    }

    /// Set a nested persona value by dotted path, creating intermediate
    /// objects, and persist the persona file atomically.
    pub fn set_value(&self, path: &str, value: Value) -> Result<()> {
        {
            let mut doc = self.persona.write().expect("persona lock poisoned");
            if doc.is_null() {
                *doc = Value::Object(serde_json::Map::new());
            }
            let mut current = &mut *doc;
            let keys: Vec<&str> = path.split('.').collect();
            for key in &keys[..keys.len() - 1] {
                if !current.is_object() {
                    *current = Value::Object(serde_json::Map::new());
                }
                current = current
                    .as_object_mut()
                    .expect("just ensured object")
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
            if !current.is_object() {
                *current = Value::Object(serde_json::Map::new());
            }
            current
                .as_object_mut()
                .expect("just ensured object")
                .insert(keys[keys.len() - 1].to_string(), value);
        }
        self.persist_persona()
    }

    fn persist_persona(&self) -> Result<()> {
        let doc = self.persona.read().expect("persona lock poisoned").clone();
        let yaml_doc = serde_yaml::to_value(&doc)?;
        self.write_atomic(PERSONA_CONFIG, &serde_yaml::to_string(&yaml_doc)?)
    }

    /// Reload only the persona document, diff persona sections, and notify
    /// observers of added/updated/removed ids.
    pub fn reload_persona(&self) {
        let loaded = match self.read_yaml(PERSONA_CONFIG) {
            Ok(Some(doc)) => match serde_yaml::from_value::<Value>(doc)
                .context("persona document is not JSON-compatible")
            {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(error = %err, "keeping previous persona configuration");
                    return;
                }
            },
            Ok(None) => Value::Object(serde_json::Map::new()),
            Err(err) => {
                tracing::warn!(error = %err, "keeping previous persona configuration");
                return;
            }
        };

        let old = {
            let mut doc = self.persona.write().expect("persona lock poisoned");
            std::mem::replace(&mut *doc, loaded.clone())
        };
        self.notify_persona_diff(&old, &loaded);
    }

    fn notify_persona_diff(&self, old: &Value, new: &Value) {
        let empty = serde_json::Map::new();
        let sections = |doc: &Value| -> serde_json::Map<String, Value> {
            doc.get("personas")
                .and_then(|p| p.get("persona_configs"))
                .and_then(Value::as_object)
                .unwrap_or(&empty)
                .clone()
        };
        let old_personas = sections(old);
        let new_personas = sections(new);

        for (id, config) in &new_personas {
            match old_personas.get(id) {
                None => self.dispatch(id, config, PersonaChange::Added),
                Some(previous) if previous != config => {
                    self.dispatch(id, config, PersonaChange::Updated)
                }
                Some(_) => {}
            }
        }
        for id in old_personas.keys() {
            if !new_personas.contains_key(id) {
                self.dispatch(id, &Value::Null, PersonaChange::Removed);
            }
        }
    }

    fn dispatch(&self, persona_id: &str, config: &Value, change: PersonaChange) {
        let observers = self.observers.lock().expect("observer lock poisoned");
        for observer in observers.iter() {
            if let Err(err) = observer(persona_id, config, change) {
                tracing::warn!(
                    persona = persona_id,
                    change = change.as_str(),
                    error = %err,
                    "persona observer failed"
                );
            }
        }
    }

    pub fn add_persona_observer(&self, observer: PersonaObserver) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(observer);
    }

    /// Start watching the config directory. Modify events on `.yaml`/`.yml`
    /// files trigger a persona-section reload (for the persona file) or a
    /// whole-document reload (for everything else). Drop the returned handle
    /// to stop watching.
    pub fn watch(self: Arc<Self>) -> Result<ConfigWatcher> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |event| {
            tx.send(event).ok();
        })
        .context("Failed to create file watcher")?;
        watcher
            .watch(&self.config_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", self.config_dir.display()))?;

        let store = self;
        let handle = std::thread::spawn(move || {
            for event in rx {
                let Ok(event) = event else { continue };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                for path in &event.paths {
                    store.handle_changed_file(path);
                }
            }
        });

        Ok(ConfigWatcher {
            _watcher: watcher,
            _thread: handle,
        })
    }

    fn handle_changed_file(&self, path: &Path) {
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if !is_yaml {
            return;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == PERSONA_CONFIG {
            self.reload_persona();
        } else if let Err(err) = self.reload() {
            tracing::warn!(file = name, error = %err, "keeping previous configuration");
        }
    }
}

/// Keeps the directory watcher and its dispatch thread alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    _thread: std::thread::JoinHandle<()>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ApiFile {
    #[serde(default)]
    generation: super::GenerationSettings,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SystemFile {
    #[serde(default)]
    system: super::SystemSettings,
    #[serde(default)]
    agent: super::AgentSettings,
    #[serde(default)]
    scheduler: SchedulerSettings,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CommandsFile {
    #[serde(default)]
    commands: HashMap<String, CommandSpec>,
}

// src/exec/processor.rs

//! Command processors and the registry that resolves commands to them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{CommandConfig, ConfigFile};
use crate::datastore::Datastore;
use crate::errors::{NotFound, Result, VizError};
use crate::exec::backend::{Task, TaskOutcome};
use crate::exec::markdown::MarkdownProcessor;
use crate::exec::shell::ShellProcessor;
use crate::exec::BoxFuture;
use crate::types::{ContextResources, ResourceId, TaskId};
use crate::viztrail::{CarryOver, CommandSpec, ModuleOutputs};

/// Everything a processor gets to see for one execution.
#[derive(Debug, Clone)]
pub struct ProcessorRequest {
    pub task_id: TaskId,
    pub command: CommandSpec,
    /// Resources visible to the module, with the versions they resolve to.
    pub context: ContextResources,
    /// Carry-over state from the previous execution of the same module.
    pub resources: CarryOver,
    pub datastore: Arc<dyn Datastore>,
}

impl ProcessorRequest {
    pub fn argument(&self, name: &str) -> Option<&serde_json::Value> {
        self.command.arguments.get(name)
    }

    pub fn str_argument(&self, name: &str) -> Option<&str> {
        self.argument(name).and_then(|v| v.as_str())
    }

    /// A list-of-strings argument; missing means empty.
    pub fn resource_list(&self, name: &str) -> anyhow::Result<Vec<ResourceId>> {
        match self.argument(name) {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(ResourceId::from)
                        .ok_or_else(|| anyhow::anyhow!("'{name}' must be a list of strings"))
                })
                .collect(),
            Some(_) => Err(anyhow::anyhow!("'{name}' must be a list of strings")),
        }
    }
}

/// What a processor reports back. Read and write sets are declared by id
/// only; the engine stamps versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorResult {
    #[serde(default)]
    pub outputs: ModuleOutputs,
    #[serde(default)]
    pub reads: Vec<ResourceId>,
    #[serde(default)]
    pub writes: Vec<ResourceId>,
    #[serde(default)]
    pub resources: CarryOver,
    /// Set when the command itself failed (outputs are still kept).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessorResult {
    pub fn new(outputs: ModuleOutputs) -> Self {
        Self {
            outputs,
            ..Self::default()
        }
    }

    pub fn failed(outputs: ModuleOutputs, message: impl Into<String>) -> Self {
        Self {
            outputs,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One package command implementation.
pub trait CommandProcessor: Send + Sync {
    fn execute(&self, request: ProcessorRequest) -> BoxFuture<'_, anyhow::Result<ProcessorResult>>;
}

/// Operator flags of a registered command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Run inline by the controller, never through a backend; never reused.
    pub synchronous: bool,
    /// Never reuse a previous result.
    pub no_cache: bool,
}

impl From<&CommandConfig> for CommandFlags {
    fn from(cfg: &CommandConfig) -> Self {
        Self {
            synchronous: cfg.synchronous,
            no_cache: cfg.no_cache,
        }
    }
}

#[derive(Clone)]
struct Registered {
    processor: Arc<dyn CommandProcessor>,
    flags: CommandFlags,
}

/// Commands keyed by `(package, command)`, built once at startup.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<(String, String), Registered>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .commands
            .keys()
            .map(|(p, c)| format!("{p}.{c}"))
            .collect();
        keys.sort();
        f.debug_struct("CommandRegistry").field("commands", &keys).finish()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `shell.run` and `markdown.text` commands.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("shell", "run", Arc::new(ShellProcessor), CommandFlags::default());
        registry.register(
            "markdown",
            "text",
            Arc::new(MarkdownProcessor),
            CommandFlags::default(),
        );
        registry
    }

    /// Built-ins with the operator flags of `[packages]` applied.
    pub fn from_config(config: &ConfigFile) -> Self {
        let mut registry = Self::with_builtins();
        registry.apply_config(config);
        registry
    }

    pub fn register(
        &mut self,
        package: &str,
        command: &str,
        processor: Arc<dyn CommandProcessor>,
        flags: CommandFlags,
    ) {
        debug!(package, command, ?flags, "registered command");
        self.commands.insert(
            (package.to_string(), command.to_string()),
            Registered { processor, flags },
        );
    }

    /// Apply `[packages.<p>.<c>]` flags; disabled commands are removed.
    pub fn apply_config(&mut self, config: &ConfigFile) {
        for (package, commands) in config.packages.iter() {
            for (command, cfg) in commands.iter() {
                let key = (package.clone(), command.clone());
                if !cfg.enabled {
                    self.commands.remove(&key);
                    debug!(package = %package, command = %command, "command disabled by config");
                    continue;
                }
                match self.commands.get_mut(&key) {
                    Some(entry) => entry.flags = CommandFlags::from(cfg),
                    None => warn!(
                        package = %package,
                        command = %command,
                        "config names a command that is not registered"
                    ),
                }
            }
        }
    }

    pub fn contains(&self, command: &CommandSpec) -> bool {
        self.commands
            .contains_key(&(command.package_id.clone(), command.command_id.clone()))
    }

    fn lookup(&self, command: &CommandSpec) -> Result<&Registered> {
        self.commands
            .get(&(command.package_id.clone(), command.command_id.clone()))
            .ok_or_else(|| {
                VizError::NotFound(NotFound::Command {
                    package: command.package_id.clone(),
                    command: command.command_id.clone(),
                })
            })
    }

    pub fn flags(&self, command: &CommandSpec) -> Result<CommandFlags> {
        Ok(self.lookup(command)?.flags)
    }

    pub fn processor(&self, command: &CommandSpec) -> Result<Arc<dyn CommandProcessor>> {
        Ok(self.lookup(command)?.processor.clone())
    }
}

/// Run a task's command to completion and turn the result into an outcome.
///
/// Shared by every backend and by the controller for synchronous commands.
pub async fn run_processor(
    registry: &CommandRegistry,
    datastore: Arc<dyn Datastore>,
    task: Task,
) -> TaskOutcome {
    let processor = match registry.processor(&task.command) {
        Ok(p) => p,
        Err(e) => {
            return TaskOutcome::Error {
                message: e.to_string(),
                outputs: ModuleOutputs::default(),
            };
        }
    };
    let request = ProcessorRequest {
        task_id: task.id.clone(),
        command: task.command,
        context: task.context,
        resources: task.resources,
        datastore,
    };
    match processor.execute(request).await {
        Ok(result) if result.is_success() => TaskOutcome::Success(result),
        Ok(result) => TaskOutcome::Error {
            message: result.error.unwrap_or_default(),
            outputs: result.outputs,
        },
        Err(e) => TaskOutcome::Error {
            message: format!("{e:#}"),
            outputs: ModuleOutputs::default(),
        },
    }
}

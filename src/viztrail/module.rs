// src/viztrail/module.rs

//! Modules: one command invocation plus its execution state and provenance.
//!
//! A `Module` value is never mutated once it is part of a published
//! snapshot. Every state transition below returns a *new* value (or `None`
//! if the transition is not allowed from the current state), which the
//! repository then publishes in a new snapshot revision.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ModuleId, ResourceSet};

/// Execution state of a module.
///
/// `Scheduled` and `Active` are transient; the other three are terminal for
/// a given module value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Scheduled,
    Active,
    Success,
    Error,
    Canceled,
}

impl ModuleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ModuleState::Success | ModuleState::Error | ModuleState::Canceled
        )
    }

    /// Scheduled or active.
    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }

    /// Error or canceled.
    pub fn is_stopped(self) -> bool {
        matches!(self, ModuleState::Error | ModuleState::Canceled)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Scheduled => "SCHEDULED",
            ModuleState::Active => "ACTIVE",
            ModuleState::Success => "SUCCESS",
            ModuleState::Error => "ERROR",
            ModuleState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// Argument key that asks a command processor to materialize its input.
pub const MATERIALIZE_INPUT: &str = "materialize_input";

/// A command invocation: package + command + opaque arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub package_id: String,
    pub command_id: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl CommandSpec {
    pub fn new(
        package_id: impl Into<String>,
        command_id: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            command_id: command_id.into(),
            arguments,
        }
    }

    /// `"package.command"`, the key used for routes and config lookups.
    pub fn key(&self) -> String {
        format!("{}.{}", self.package_id, self.command_id)
    }

    /// Whether any argument, at any nesting depth, sets
    /// `materialize_input = true`.
    pub fn requests_materialization(&self) -> bool {
        fn walk(value: &serde_json::Value) -> bool {
            match value {
                serde_json::Value::Object(map) => map.iter().any(|(k, v)| {
                    (k == MATERIALIZE_INPUT && v.as_bool() == Some(true)) || walk(v)
                }),
                serde_json::Value::Array(items) => items.iter().any(walk),
                _ => false,
            }
        }
        walk(&self.arguments)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.package_id, self.command_id)
    }
}

pub const OUTPUT_TEXT: &str = "text/plain";
pub const OUTPUT_MARKDOWN: &str = "text/markdown";

/// One output item of a module, tagged with its mime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

impl OutputObject {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: OUTPUT_TEXT.to_string(),
            value: serde_json::Value::String(value.into()),
        }
    }

    pub fn markdown(value: impl Into<String>) -> Self {
        Self {
            kind: OUTPUT_MARKDOWN.to_string(),
            value: serde_json::Value::String(value.into()),
        }
    }

    /// Strings verbatim, anything else as JSON.
    pub fn display_value(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Standard output and error streams of a module execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutputs {
    #[serde(default)]
    pub stdout: Vec<OutputObject>,
    #[serde(default)]
    pub stderr: Vec<OutputObject>,
}

impl ModuleOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdout(mut self, output: OutputObject) -> Self {
        self.stdout.push(output);
        self
    }

    /// Append an error message to stderr.
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.stderr.push(OutputObject::text(message));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    pub fn has_error(&self) -> bool {
        !self.stderr.is_empty()
    }
}

/// Resources a module read and wrote in the execution that produced its
/// current result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub read: ResourceSet,
    pub write: ResourceSet,
}

/// Opaque state a processor hands to the next execution of the same module.
pub type CarryOver = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Timestamps {
    pub fn created(at: DateTime<Utc>) -> Self {
        Self {
            created_at: at,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: ModuleId,
    pub command: CommandSpec,
    pub state: ModuleState,
    /// Only defined once the module reached `Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub outputs: ModuleOutputs,
    pub timestamps: Timestamps,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: CarryOver,
}

impl Module {
    /// A brand new module in state `Scheduled`.
    pub fn scheduled(command: CommandSpec, at: DateTime<Utc>) -> Self {
        Self {
            id: ModuleId::generate(),
            command,
            state: ModuleState::Scheduled,
            provenance: None,
            outputs: ModuleOutputs::default(),
            timestamps: Timestamps::created(at),
            resources: CarryOver::new(),
        }
    }

    /// Replacement module for `self`: new identity and command, carry-over
    /// resources kept.
    pub fn replaced_by(&self, command: CommandSpec, at: DateTime<Utc>) -> Self {
        let mut module = Module::scheduled(command, at);
        module.resources = self.resources.clone();
        module
    }

    /// Same identity and command, back in `Scheduled` with prior results
    /// discarded.
    pub fn rescheduled(&self, at: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            command: self.command.clone(),
            state: ModuleState::Scheduled,
            provenance: None,
            outputs: ModuleOutputs::default(),
            timestamps: Timestamps::created(at),
            resources: self.resources.clone(),
        }
    }

    /// `Scheduled -> Active`.
    pub fn activated(&self, at: DateTime<Utc>) -> Option<Self> {
        if self.state != ModuleState::Scheduled {
            return None;
        }
        let mut next = self.clone();
        next.state = ModuleState::Active;
        next.timestamps.started_at = Some(at);
        Some(next)
    }

    /// `Active -> Success`.
    pub fn succeeded(
        &self,
        outputs: ModuleOutputs,
        provenance: Provenance,
        resources: CarryOver,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        if self.state != ModuleState::Active {
            return None;
        }
        let mut next = self.clone();
        next.state = ModuleState::Success;
        next.outputs = outputs;
        next.provenance = Some(provenance);
        next.resources = resources;
        next.timestamps.finished_at = Some(at);
        Some(next)
    }

    /// `Active -> Error`, recording the failure message on stderr.
    pub fn failed(
        &self,
        message: &str,
        outputs: ModuleOutputs,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        if self.state != ModuleState::Active {
            return None;
        }
        let mut next = self.clone();
        next.state = ModuleState::Error;
        next.outputs = outputs.error(message);
        next.provenance = None;
        next.timestamps.finished_at = Some(at);
        Some(next)
    }

    /// `Scheduled -> Error` without running: an upstream module failed.
    pub fn skipped(&self, at: DateTime<Utc>) -> Option<Self> {
        if self.state != ModuleState::Scheduled {
            return None;
        }
        let mut next = self.clone();
        next.state = ModuleState::Error;
        next.outputs = ModuleOutputs::default();
        next.provenance = None;
        next.timestamps.finished_at = Some(at);
        Some(next)
    }

    /// `Scheduled | Active -> Canceled`.
    pub fn canceled(&self, at: DateTime<Utc>) -> Option<Self> {
        if self.state.is_terminal() {
            return None;
        }
        let mut next = self.clone();
        next.state = ModuleState::Canceled;
        next.provenance = None;
        next.timestamps.finished_at = Some(at);
        Some(next)
    }

    /// `Scheduled -> Success` by copying a previous successful execution
    /// verbatim (outputs, provenance, timestamps).
    pub fn reused_from(&self, prior: &Module) -> Option<Self> {
        if self.state != ModuleState::Scheduled || prior.state != ModuleState::Success {
            return None;
        }
        Some(Self {
            id: self.id.clone(),
            command: self.command.clone(),
            state: ModuleState::Success,
            provenance: prior.provenance.clone(),
            outputs: prior.outputs.clone(),
            timestamps: prior.timestamps.clone(),
            resources: prior.resources.clone(),
        })
    }

    /// Resources written by the module; empty unless it succeeded.
    pub fn write_set(&self) -> Option<&ResourceSet> {
        self.provenance.as_ref().map(|p| &p.write)
    }

    pub fn read_set(&self) -> Option<&ResourceSet> {
        self.provenance.as_ref().map(|p| &p.read)
    }

    /// ERROR because an earlier module failed, not because this one did.
    pub fn is_skipped(&self) -> bool {
        self.state == ModuleState::Error && !self.outputs.has_error()
    }
}

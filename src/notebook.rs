// src/notebook.rs

//! Notebook files run by the `viztrail` binary.
//!
//! A notebook is a TOML file with an ordered list of modules:
//!
//! ```toml
//! backend = "pool"          # optional, overrides [engine].backend
//! context = ["people.csv"]  # optional context resources
//!
//! [[module]]
//! package = "shell"
//! command = "run"
//! arguments = { cmd = "wc -l people.csv", reads = ["people.csv"] }
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::{Result, VizError};
use crate::types::{BackendKind, ResourceId};
use crate::viztrail::CommandSpec;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notebook {
    #[serde(default)]
    pub backend: Option<BackendKind>,

    #[serde(default)]
    pub context: Vec<ResourceId>,

    #[serde(default, rename = "module")]
    pub modules: Vec<NotebookModule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotebookModule {
    pub package: String,
    pub command: String,
    #[serde(default = "empty_arguments")]
    pub arguments: serde_json::Value,
}

fn empty_arguments() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NotebookModule {
    pub fn to_command(&self) -> CommandSpec {
        CommandSpec::new(&self.package, &self.command, self.arguments.clone())
    }
}

impl Notebook {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let notebook: Notebook = toml::from_str(contents)?;
        for (i, m) in notebook.modules.iter().enumerate() {
            if m.package.trim().is_empty() || m.command.trim().is_empty() {
                return Err(VizError::Config(format!(
                    "module #{} needs a package and a command",
                    i + 1
                )));
            }
            if !m.arguments.is_object() {
                return Err(VizError::Config(format!(
                    "module #{} ({}.{}): arguments must be a table",
                    i + 1,
                    m.package,
                    m.command
                )));
            }
        }
        Ok(notebook)
    }

    pub fn commands(&self) -> impl Iterator<Item = CommandSpec> + '_ {
        self.modules.iter().map(NotebookModule::to_command)
    }
}

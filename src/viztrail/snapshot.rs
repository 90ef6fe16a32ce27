// src/viztrail/snapshot.rs

//! Workflow snapshots: one immutable version of a branch.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BranchId, ModuleId, ResourceSet, SnapshotId};
use crate::viztrail::module::{CommandSpec, Module, ModuleState};

/// The edit that produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Initial snapshot of a branch (new project or fork).
    Create,
    Append,
    Insert,
    Delete,
    Replace,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Append => "append",
            Action::Insert => "insert",
            Action::Delete => "delete",
            Action::Replace => "replace",
        };
        f.write_str(s)
    }
}

/// Ordered sequence of modules at one point of a branch history.
///
/// The module list of a published snapshot never changes order or length.
/// The controller publishes state transitions of the *head* snapshot as new
/// revisions (same `id`, `revision + 1`); modules untouched by a revision are
/// shared by `Arc` with the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: SnapshotId,
    pub branch_id: BranchId,
    pub created_at: DateTime<Utc>,
    pub action: Action,
    /// Command that triggered the edit, absent for `Create` and `Delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_command: Option<CommandSpec>,
    #[serde(default)]
    pub revision: u64,
    pub modules: Vec<Arc<Module>>,
}

impl WorkflowSnapshot {
    pub fn new(
        branch_id: BranchId,
        action: Action,
        action_command: Option<CommandSpec>,
        modules: Vec<Arc<Module>>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SnapshotId::generate(),
            branch_id,
            created_at: at,
            action,
            action_command,
            revision: 0,
            modules,
        }
    }

    /// Next revision of this snapshot with the module at `position` swapped.
    pub fn with_module(&self, position: usize, module: Module) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        if let Some(slot) = next.modules.get_mut(position) {
            *slot = Arc::new(module);
        }
        next
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn position_of(&self, id: &ModuleId) -> Option<usize> {
        self.modules.iter().position(|m| &m.id == id)
    }

    pub fn module(&self, id: &ModuleId) -> Option<&Arc<Module>> {
        self.modules.iter().find(|m| &m.id == id)
    }

    /// First module that is SCHEDULED or ACTIVE, with its position.
    pub fn first_non_terminal(&self) -> Option<(usize, &Arc<Module>)> {
        self.modules
            .iter()
            .enumerate()
            .find(|(_, m)| m.state.is_pending())
    }

    pub fn active_count(&self) -> usize {
        self.modules
            .iter()
            .filter(|m| m.state == ModuleState::Active)
            .count()
    }

    /// State of the first module not in SUCCESS; SUCCESS when all are (or
    /// when the workflow is empty).
    pub fn state(&self) -> ModuleState {
        self.modules
            .iter()
            .map(|m| m.state)
            .find(|s| *s != ModuleState::Success)
            .unwrap_or(ModuleState::Success)
    }

    /// Whether any module is still pending.
    pub fn is_active(&self) -> bool {
        self.modules.iter().any(|m| m.state.is_pending())
    }

    /// Resources written by the modules before `position`, later writes
    /// overriding earlier ones.
    pub fn resources_before(&self, position: usize) -> ResourceSet {
        let mut out = ResourceSet::new();
        for module in self.modules.iter().take(position) {
            if let Some(write) = module.write_set() {
                out.extend_from(write);
            }
        }
        out
    }

    /// Combined write sets of the whole workflow.
    pub fn tail_resources(&self) -> ResourceSet {
        self.resources_before(self.modules.len())
    }
}

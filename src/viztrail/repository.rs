// src/viztrail/repository.rs

//! The viztrail repository: projects, branches and their histories.
//!
//! Locking: the index (`RwLock`) maps ids to projects and to branch cells.
//! Every branch has its own `Mutex`, so edits and state transitions on one
//! branch are serialized while unrelated branches never contend. The index
//! lock is always released before a branch lock is taken.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::config::RepositorySection;
use crate::errors::{Result, VizError};
use crate::types::{BackendKind, BranchId, ModuleId, ResourceId, SnapshotId, ViztrailId};
use crate::viztrail::branch::{Branch, BranchOrigin, DEFAULT_BRANCH_NAME};
use crate::viztrail::module::{CommandSpec, Module, ModuleState};
use crate::viztrail::project::Viztrail;
use crate::viztrail::snapshot::{Action, WorkflowSnapshot};
use crate::viztrail::store::ObjectStore;

/// An edit of a branch head.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOperation {
    Append(CommandSpec),
    Insert { before: ModuleId, command: CommandSpec },
    Delete { module: ModuleId },
    Replace { module: ModuleId, command: CommandSpec },
}

impl EditOperation {
    pub fn command(&self) -> Option<&CommandSpec> {
        match self {
            EditOperation::Append(cmd) => Some(cmd),
            EditOperation::Insert { command, .. } => Some(command),
            EditOperation::Replace { command, .. } => Some(command),
            EditOperation::Delete { .. } => None,
        }
    }

    fn action(&self) -> Action {
        match self {
            EditOperation::Append(_) => Action::Append,
            EditOperation::Insert { .. } => Action::Insert,
            EditOperation::Delete { .. } => Action::Delete,
            EditOperation::Replace { .. } => Action::Replace,
        }
    }
}

/// One module state change, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleTransition {
    pub viztrail: ViztrailId,
    pub branch: BranchId,
    pub snapshot: SnapshotId,
    pub module: ModuleId,
    pub position: usize,
    pub from: ModuleState,
    pub to: ModuleState,
    pub at: DateTime<Utc>,
}

/// Result of an edit: the new head plus the transitions applied to the old
/// head when its pending work was preempted.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub snapshot: Arc<WorkflowSnapshot>,
    pub preempted: Vec<ModuleTransition>,
}

/// Result of a controller-side transition.
#[derive(Debug, Clone)]
pub enum Applied {
    /// A new head revision was published.
    Published {
        snapshot: Arc<WorkflowSnapshot>,
        transitions: Vec<ModuleTransition>,
    },
    /// Nothing to change (e.g. the module was canceled in the meantime).
    Unchanged(Arc<WorkflowSnapshot>),
    /// The expected snapshot is no longer the head.
    Stale,
}

/// A branch behind its own lock.
#[derive(Debug)]
pub struct BranchCell {
    pub id: BranchId,
    pub viztrail_id: ViztrailId,
    branch: Mutex<Branch>,
}

impl BranchCell {
    fn new(branch: Branch) -> Self {
        Self {
            id: branch.id.clone(),
            viztrail_id: branch.viztrail_id.clone(),
            branch: Mutex::new(branch),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Branch> {
        self.branch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cheap copy of the current branch (history entries are shared).
    pub fn snapshot(&self) -> Branch {
        self.lock().clone()
    }
}

#[derive(Debug, Default)]
struct Index {
    viztrails: BTreeMap<ViztrailId, Viztrail>,
    branches: HashMap<BranchId, Arc<BranchCell>>,
}

#[derive(Debug, Default)]
pub struct ViztrailRepository {
    index: RwLock<Index>,
    store: Option<ObjectStore>,
    purge_deleted_branches: bool,
}

impl ViztrailRepository {
    /// Memory-only repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the repository described by `[repository]`, restoring persisted
    /// viztrails when a data directory is configured.
    pub fn from_config(section: &RepositorySection) -> Result<Self> {
        match section.data_dir.as_ref() {
            Some(dir) => Self::load(ObjectStore::open(dir)?, section.purge_deleted_branches),
            None => Ok(Self {
                purge_deleted_branches: section.purge_deleted_branches,
                ..Self::default()
            }),
        }
    }

    /// Restore every viztrail found in `store`. Modules that were pending
    /// when the process stopped are re-issued as SCHEDULED.
    pub fn load(store: ObjectStore, purge_deleted_branches: bool) -> Result<Self> {
        let mut index = Index::default();
        let now = Utc::now();
        for (viztrail, branches) in store.load_all()? {
            for mut branch in branches {
                if reissue_pending_head(&mut branch, now) {
                    store.write_branch(&branch)?;
                    info!(branch = %branch.id, "re-issued pending modules of restored head");
                }
                index
                    .branches
                    .insert(branch.id.clone(), Arc::new(BranchCell::new(branch)));
            }
            index.viztrails.insert(viztrail.id.clone(), viztrail);
        }
        info!(viztrails = index.viztrails.len(), "repository loaded");
        Ok(Self {
            index: RwLock::new(index),
            store: Some(store),
            purge_deleted_branches,
        })
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_viztrail(&self, viztrail: &Viztrail) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.write_viztrail(viztrail) {
                error!(viztrail = %viztrail.id, error = %e, "failed to persist viztrail");
            }
        }
    }

    fn persist_branch(&self, branch: &Branch) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.write_branch(branch) {
                error!(branch = %branch.id, error = %e, "failed to persist branch");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Viztrails
    // ---------------------------------------------------------------------

    /// Create a project together with its empty default branch.
    pub fn create_viztrail(
        &self,
        name: &str,
        properties: BTreeMap<String, String>,
        backend: Option<BackendKind>,
    ) -> Result<Viztrail> {
        let now = Utc::now();
        let id = ViztrailId::generate();
        let mut branch = Branch::new(id.clone(), DEFAULT_BRANCH_NAME, None, now);
        branch.is_default = true;
        let viztrail = Viztrail::new(id, name, properties, backend, branch.id.clone(), now);

        self.persist_viztrail(&viztrail);
        self.persist_branch(&branch);

        let mut index = self.write_index();
        index
            .branches
            .insert(branch.id.clone(), Arc::new(BranchCell::new(branch)));
        index.viztrails.insert(viztrail.id.clone(), viztrail.clone());
        info!(viztrail = %viztrail.id, name = %viztrail.name, "created viztrail");
        Ok(viztrail)
    }

    /// Delete a project and, with it, all of its branches.
    pub fn delete_viztrail(&self, id: &ViztrailId) -> Result<()> {
        let removed = {
            let mut index = self.write_index();
            let viztrail = index
                .viztrails
                .remove(id)
                .ok_or_else(|| VizError::viztrail_not_found(id))?;
            viztrail
                .branches
                .iter()
                .filter_map(|b| index.branches.remove(b))
                .collect::<Vec<_>>()
        };
        for cell in removed {
            cell.lock().deleted = true;
        }
        if let Some(store) = self.store.as_ref() {
            store.delete_viztrail(id)?;
        }
        info!(viztrail = %id, "deleted viztrail");
        Ok(())
    }

    pub fn get_viztrail(&self, id: &ViztrailId) -> Result<Viztrail> {
        let (mut viztrail, cells) = {
            let index = self.read_index();
            let viztrail = index
                .viztrails
                .get(id)
                .cloned()
                .ok_or_else(|| VizError::viztrail_not_found(id))?;
            let cells = viztrail
                .branches
                .iter()
                .filter_map(|b| index.branches.get(b).cloned())
                .collect::<Vec<_>>();
            (viztrail, cells)
        };
        for cell in cells {
            let branch = cell.lock();
            if !branch.deleted {
                viztrail.touch(branch.last_modified_at());
            }
        }
        Ok(viztrail)
    }

    pub fn list_viztrails(&self) -> Vec<Viztrail> {
        let ids: Vec<ViztrailId> = self.read_index().viztrails.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.get_viztrail(id).ok())
            .collect()
    }

    /// Merge `properties` into the project's properties. An empty value
    /// removes the key.
    pub fn update_properties(
        &self,
        id: &ViztrailId,
        properties: BTreeMap<String, String>,
    ) -> Result<Viztrail> {
        let viztrail = {
            let mut index = self.write_index();
            let viztrail = index
                .viztrails
                .get_mut(id)
                .ok_or_else(|| VizError::viztrail_not_found(id))?;
            for (key, value) in properties {
                if value.is_empty() {
                    viztrail.properties.remove(&key);
                } else {
                    viztrail.properties.insert(key, value);
                }
            }
            viztrail.touch(Utc::now());
            viztrail.clone()
        };
        self.persist_viztrail(&viztrail);
        Ok(viztrail)
    }

    // ---------------------------------------------------------------------
    // Branches
    // ---------------------------------------------------------------------

    pub fn branch_cell(&self, id: &BranchId) -> Result<Arc<BranchCell>> {
        self.read_index()
            .branches
            .get(id)
            .cloned()
            .ok_or_else(|| VizError::branch_not_found(id))
    }

    /// Live (not deleted) branch cell.
    fn live_cell(&self, id: &BranchId) -> Result<Arc<BranchCell>> {
        let cell = self.branch_cell(id)?;
        if cell.lock().deleted {
            return Err(VizError::branch_not_found(id));
        }
        Ok(cell)
    }

    /// Create a branch. Without a source it starts empty; otherwise its
    /// initial snapshot is the prefix of the source head up to and including
    /// `source_module` (the whole head when `None`), sharing module records.
    pub fn create_branch(
        &self,
        viztrail: &ViztrailId,
        name: &str,
        source: Option<(&BranchId, Option<&ModuleId>)>,
    ) -> Result<Branch> {
        if !self.read_index().viztrails.contains_key(viztrail) {
            return Err(VizError::viztrail_not_found(viztrail));
        }
        let now = Utc::now();

        let branch = match source {
            None => Branch::new(viztrail.clone(), name, None, now),
            Some((source_id, module)) => {
                let source_cell = self.live_cell(source_id)?;
                if &source_cell.viztrail_id != viztrail {
                    return Err(VizError::InvalidOperation(format!(
                        "branch {source_id} belongs to another viztrail"
                    )));
                }
                let source_branch = source_cell.snapshot();
                let head = source_branch.head().cloned().ok_or_else(|| {
                    VizError::InvalidOperation(format!("branch {source_id} has no workflow to fork"))
                })?;
                let end = match module {
                    Some(m) => head
                        .position_of(m)
                        .ok_or_else(|| VizError::module_not_found(m))?
                        + 1,
                    None => head.len(),
                };
                let origin = BranchOrigin {
                    source_branch: source_id.clone(),
                    snapshot_id: head.id.clone(),
                    module_id: module.cloned(),
                };
                let mut branch = Branch::new(viztrail.clone(), name, Some(origin), now);
                branch.context = source_branch.context.clone();
                let modules = head.modules[..end]
                    .iter()
                    .map(|m| {
                        if m.state.is_pending() {
                            Arc::new(m.rescheduled(now))
                        } else {
                            m.clone()
                        }
                    })
                    .collect();
                branch.push(WorkflowSnapshot::new(
                    branch.id.clone(),
                    Action::Create,
                    None,
                    modules,
                    now,
                ));
                branch
            }
        };
        if let Some(store) = self.store.as_ref() {
            store.write_full_branch(&branch)?;
        }

        let viztrail_meta = {
            let mut index = self.write_index();
            let meta = index
                .viztrails
                .get_mut(viztrail)
                .ok_or_else(|| VizError::viztrail_not_found(viztrail))?;
            meta.branches.push(branch.id.clone());
            meta.touch(now);
            let meta = meta.clone();
            index
                .branches
                .insert(branch.id.clone(), Arc::new(BranchCell::new(branch.clone())));
            meta
        };
        self.persist_viztrail(&viztrail_meta);
        info!(viztrail = %viztrail, branch = %branch.id, name, "created branch");
        Ok(branch)
    }

    /// Tombstone a branch. The default branch cannot be deleted.
    pub fn delete_branch(&self, viztrail: &ViztrailId, id: &BranchId) -> Result<()> {
        let default = self.get_viztrail(viztrail)?.default_branch;
        if &default == id {
            return Err(VizError::InvalidOperation(
                "the default branch cannot be deleted".to_string(),
            ));
        }
        let cell = self.live_cell(id)?;
        if &cell.viztrail_id != viztrail {
            return Err(VizError::branch_not_found(id));
        }
        let mut branch = cell.lock();
        branch.deleted = true;
        if self.purge_deleted_branches {
            if let Some(store) = self.store.as_ref() {
                store.purge_branch(&branch)?;
            }
            branch.history.clear();
        }
        self.persist_branch(&branch);
        info!(viztrail = %viztrail, branch = %id, purged = self.purge_deleted_branches, "deleted branch");
        Ok(())
    }

    pub fn list_branches(&self, viztrail: &ViztrailId) -> Result<Vec<Branch>> {
        let cells: Vec<Arc<BranchCell>> = {
            let index = self.read_index();
            let meta = index
                .viztrails
                .get(viztrail)
                .ok_or_else(|| VizError::viztrail_not_found(viztrail))?;
            meta.branches
                .iter()
                .filter_map(|b| index.branches.get(b).cloned())
                .collect()
        };
        Ok(cells
            .iter()
            .map(|c| c.snapshot())
            .filter(|b| !b.deleted)
            .collect())
    }

    pub fn get_branch(&self, id: &BranchId) -> Result<Branch> {
        Ok(self.live_cell(id)?.snapshot())
    }

    pub fn set_default_branch(&self, viztrail: &ViztrailId, id: &BranchId) -> Result<()> {
        let cell = self.live_cell(id)?;
        if &cell.viztrail_id != viztrail {
            return Err(VizError::branch_not_found(id));
        }
        let (old, meta) = {
            let mut index = self.write_index();
            let meta = index
                .viztrails
                .get_mut(viztrail)
                .ok_or_else(|| VizError::viztrail_not_found(viztrail))?;
            let old = std::mem::replace(&mut meta.default_branch, id.clone());
            (old, meta.clone())
        };
        if let Ok(old_cell) = self.branch_cell(&old) {
            let mut branch = old_cell.lock();
            branch.is_default = false;
            self.persist_branch(&branch);
        }
        {
            let mut branch = cell.lock();
            branch.is_default = true;
            self.persist_branch(&branch);
        }
        self.persist_viztrail(&meta);
        Ok(())
    }

    /// Replace the externally supplied context resources of a branch.
    pub fn set_context_resources(
        &self,
        id: &BranchId,
        resources: BTreeSet<ResourceId>,
    ) -> Result<()> {
        let cell = self.live_cell(id)?;
        let mut branch = cell.lock();
        branch.context = resources;
        self.persist_branch(&branch);
        Ok(())
    }

    pub fn get_history(&self, id: &BranchId) -> Result<Vec<Arc<WorkflowSnapshot>>> {
        Ok(self.live_cell(id)?.lock().history.clone())
    }

    pub fn get_snapshot(
        &self,
        branch: &BranchId,
        snapshot: &SnapshotId,
    ) -> Result<Arc<WorkflowSnapshot>> {
        self.live_cell(branch)?
            .lock()
            .snapshot(snapshot)
            .cloned()
            .ok_or_else(|| VizError::snapshot_not_found(snapshot))
    }

    pub fn get_head(&self, id: &BranchId) -> Result<Option<Arc<WorkflowSnapshot>>> {
        Ok(self.live_cell(id)?.lock().head().cloned())
    }

    /// A module of the branch head.
    pub fn get_module(&self, branch: &BranchId, module: &ModuleId) -> Result<Arc<Module>> {
        self.get_head(branch)?
            .and_then(|head| head.module(module).cloned())
            .ok_or_else(|| VizError::module_not_found(module))
    }

    // ---------------------------------------------------------------------
    // Edits and transitions
    // ---------------------------------------------------------------------

    /// Apply an edit to the branch head and publish the resulting snapshot.
    ///
    /// Modules before the edit point are shared with the old head; modules
    /// at or after it are re-issued as SCHEDULED. If the old head still has
    /// pending work it is frozen as CANCELED, which requires a preemptible
    /// backend when a module is ACTIVE.
    pub fn edit_branch(
        &self,
        id: &BranchId,
        op: EditOperation,
        preemptible: bool,
    ) -> Result<EditOutcome> {
        let cell = self.live_cell(id)?;
        let mut branch = cell.lock();
        let now = Utc::now();

        let old_head = branch.head().cloned();
        let old_modules: Vec<Arc<Module>> = old_head
            .as_ref()
            .map(|h| h.modules.clone())
            .unwrap_or_default();

        if let Some(head) = old_head.as_ref() {
            if head.active_count() > 0 && !preemptible {
                return Err(VizError::ConcurrentModification { branch: id.clone() });
            }
        }

        let position_of = |module: &ModuleId| {
            old_modules
                .iter()
                .position(|m| &m.id == module)
                .ok_or_else(|| VizError::module_not_found(module))
        };

        // (edit point, new module list). The edited slot is filled in below.
        let (edit_pos, mut modules) = match &op {
            EditOperation::Append(cmd) => {
                let mut modules = old_modules.clone();
                modules.push(Arc::new(Module::scheduled(cmd.clone(), now)));
                (old_modules.len(), modules)
            }
            EditOperation::Insert { before, command } => {
                let pos = position_of(before)?;
                let mut modules = old_modules.clone();
                modules.insert(pos, Arc::new(Module::scheduled(command.clone(), now)));
                (pos, modules)
            }
            EditOperation::Delete { module } => {
                let pos = position_of(module)?;
                let mut modules = old_modules.clone();
                modules.remove(pos);
                (pos, modules)
            }
            EditOperation::Replace { module, command } => {
                let pos = position_of(module)?;
                let mut modules = old_modules.clone();
                modules[pos] = Arc::new(old_modules[pos].replaced_by(command.clone(), now));
                (pos, modules)
            }
        };

        let new_slot = match &op {
            EditOperation::Delete { .. } => None,
            _ => Some(edit_pos),
        };
        for (i, slot) in modules.iter_mut().enumerate() {
            if Some(i) == new_slot {
                continue;
            }
            if i >= edit_pos || slot.state.is_pending() {
                *slot = Arc::new(slot.rescheduled(now));
            }
        }

        // Freeze the old head's pending modules.
        let mut preempted = Vec::new();
        if let Some(head) = old_head.as_ref() {
            if head.is_active() {
                let mut frozen = (**head).clone();
                frozen.revision += 1;
                for (pos, slot) in frozen.modules.iter_mut().enumerate() {
                    if let Some(canceled) = slot.canceled(now) {
                        preempted.push(ModuleTransition {
                            viztrail: cell.viztrail_id.clone(),
                            branch: id.clone(),
                            snapshot: head.id.clone(),
                            module: slot.id.clone(),
                            position: pos,
                            from: slot.state,
                            to: ModuleState::Canceled,
                            at: now,
                        });
                        *slot = Arc::new(canceled);
                    }
                }
                branch.publish_revision(frozen);
                self.persist_branch(&branch);
                info!(branch = %id, preempted = preempted.len(), "froze pending work of previous head");
            }
        }

        let snapshot = branch.push(WorkflowSnapshot::new(
            id.clone(),
            op.action(),
            op.command().cloned(),
            modules,
            now,
        ));
        self.persist_branch(&branch);
        info!(
            branch = %id,
            snapshot = %snapshot.id,
            action = %snapshot.action,
            modules = snapshot.len(),
            "published workflow snapshot"
        );
        Ok(EditOutcome { snapshot, preempted })
    }

    /// Cancel every pending module of the head. Idempotent: returns no
    /// transitions (and publishes nothing) when nothing is pending.
    pub fn cancel_branch(&self, id: &BranchId) -> Result<Vec<ModuleTransition>> {
        let cell = self.live_cell(id)?;
        let mut branch = cell.lock();
        let Some(head) = branch.head().cloned() else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let updates = head
            .modules
            .iter()
            .enumerate()
            .filter_map(|(pos, m)| m.canceled(now).map(|c| (pos, c)))
            .collect();
        match self.publish_updates(&cell, &mut branch, head, updates) {
            Applied::Published { transitions, .. } => {
                info!(branch = %id, canceled = transitions.len(), "canceled branch");
                Ok(transitions)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Controller-side update of the head.
    ///
    /// `f` sees the current head under the branch lock and returns the
    /// modules to swap in. The update is dropped as stale when `snapshot` is
    /// no longer the head.
    pub fn apply_transition<F>(
        &self,
        id: &BranchId,
        snapshot: &SnapshotId,
        f: F,
    ) -> Result<Applied>
    where
        F: FnOnce(&WorkflowSnapshot) -> Vec<(usize, Module)>,
    {
        let cell = self.branch_cell(id)?;
        let mut branch = cell.lock();
        let head = match branch.head() {
            Some(head) if &head.id == snapshot && !branch.deleted => head.clone(),
            _ => {
                debug!(branch = %id, snapshot = %snapshot, "dropping stale transition");
                return Ok(Applied::Stale);
            }
        };

        let updates = f(&head);
        Ok(self.publish_updates(&cell, &mut branch, head, updates))
    }

    /// Swap `updates` into a new revision of `head` and publish it.
    fn publish_updates(
        &self,
        cell: &BranchCell,
        branch: &mut Branch,
        head: Arc<WorkflowSnapshot>,
        updates: Vec<(usize, Module)>,
    ) -> Applied {
        let mut next = (*head).clone();
        next.revision += 1;
        let mut transitions = Vec::with_capacity(updates.len());
        for (pos, module) in updates {
            let Some(slot) = next.modules.get_mut(pos) else {
                continue;
            };
            if slot.id != module.id {
                continue;
            }
            transitions.push(ModuleTransition {
                viztrail: cell.viztrail_id.clone(),
                branch: cell.id.clone(),
                snapshot: head.id.clone(),
                module: module.id.clone(),
                position: pos,
                from: slot.state,
                to: module.state,
                at: Utc::now(),
            });
            *slot = Arc::new(module);
        }
        if transitions.is_empty() {
            return Applied::Unchanged(head);
        }
        branch.publish_revision(next);
        self.persist_branch(branch);
        let snapshot = branch.head().cloned().unwrap_or(head);
        Applied::Published {
            snapshot,
            transitions,
        }
    }

    /// Viztrail that owns a branch.
    pub fn viztrail_of(&self, branch: &BranchId) -> Result<ViztrailId> {
        Ok(self.branch_cell(branch)?.viztrail_id.clone())
    }

    /// Backend override of a project, if any.
    pub fn backend_of(&self, viztrail: &ViztrailId) -> Result<Option<BackendKind>> {
        self.read_index()
            .viztrails
            .get(viztrail)
            .map(|v| v.backend)
            .ok_or_else(|| VizError::viztrail_not_found(viztrail))
    }

    /// Ids of all live branches with pending modules in their head.
    pub fn pending_branches(&self) -> Vec<BranchId> {
        let cells: Vec<Arc<BranchCell>> = self.read_index().branches.values().cloned().collect();
        cells
            .iter()
            .filter(|c| {
                let b = c.lock();
                !b.deleted && b.head().map(|h| h.is_active()).unwrap_or(false)
            })
            .map(|c| c.id.clone())
            .collect()
    }
}

/// Put every pending module of a restored head back into SCHEDULED.
fn reissue_pending_head(branch: &mut Branch, at: DateTime<Utc>) -> bool {
    let Some(head) = branch.head().cloned() else {
        return false;
    };
    if head.active_count() == 0 {
        return false;
    }
    let mut next = (*head).clone();
    next.revision += 1;
    for slot in next.modules.iter_mut() {
        if slot.state == ModuleState::Active {
            *slot = Arc::new(slot.rescheduled(at));
        }
    }
    branch.publish_revision(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmd(name: &str) -> CommandSpec {
        CommandSpec::new("test", name, json!({}))
    }

    #[test]
    fn new_viztrail_has_an_empty_default_branch() {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("demo", BTreeMap::new(), None).unwrap();
        let branches = repo.list_branches(&vt.id).unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, DEFAULT_BRANCH_NAME);
        assert!(branches[0].is_default);
        assert!(repo.get_head(&vt.default_branch).unwrap().is_none());
    }

    #[test]
    fn edits_reschedule_everything_from_the_edit_point() {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("demo", BTreeMap::new(), None).unwrap();
        let br = vt.default_branch.clone();

        let s1 = repo.edit_branch(&br, EditOperation::Append(cmd("a")), false).unwrap().snapshot;
        let a = s1.modules[0].id.clone();
        let s2 = repo.edit_branch(&br, EditOperation::Append(cmd("c")), false).unwrap().snapshot;
        let c = s2.modules[1].id.clone();
        let s3 = repo
            .edit_branch(&br, EditOperation::Insert { before: c.clone(), command: cmd("b") }, false)
            .unwrap()
            .snapshot;

        assert_eq!(s3.action, Action::Insert);
        assert_eq!(s3.len(), 3);
        assert_eq!(s3.modules[0].id, a);
        assert_eq!(s3.modules[1].command.command_id, "b");
        assert_eq!(s3.modules[2].id, c);

        let history = repo.get_history(&br).unwrap();
        assert_eq!(history.len(), 3);

        let s4 = repo.edit_branch(&br, EditOperation::Delete { module: a.clone() }, false).unwrap().snapshot;
        assert_eq!(s4.len(), 2);
        assert!(s4.position_of(&a).is_none());

        let err = repo.edit_branch(&br, EditOperation::Delete { module: a }, false).unwrap_err();
        assert!(matches!(err, VizError::NotFound(_)));
    }

    #[test]
    fn active_head_requires_preemption() {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("demo", BTreeMap::new(), None).unwrap();
        let br = vt.default_branch.clone();
        let s1 = repo.edit_branch(&br, EditOperation::Append(cmd("a")), false).unwrap().snapshot;
        repo.apply_transition(&br, &s1.id, |s| {
            vec![(0, s.modules[0].activated(Utc::now()).unwrap())]
        })
        .unwrap();

        let err = repo.edit_branch(&br, EditOperation::Append(cmd("b")), false).unwrap_err();
        assert!(matches!(err, VizError::ConcurrentModification { .. }));

        let outcome = repo.edit_branch(&br, EditOperation::Append(cmd("b")), true).unwrap();
        assert_eq!(outcome.preempted.len(), 1);
        assert_eq!(outcome.preempted[0].to, ModuleState::Canceled);
        let history = repo.get_history(&br).unwrap();
        assert_eq!(history[0].modules[0].state, ModuleState::Canceled);
        assert_eq!(outcome.snapshot.modules[0].state, ModuleState::Scheduled);
    }

    #[test]
    fn stale_transitions_are_dropped() {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("demo", BTreeMap::new(), None).unwrap();
        let br = vt.default_branch.clone();
        let s1 = repo.edit_branch(&br, EditOperation::Append(cmd("a")), false).unwrap().snapshot;
        repo.edit_branch(&br, EditOperation::Append(cmd("b")), false).unwrap();
        let applied = repo
            .apply_transition(&br, &s1.id, |s| vec![(0, s.modules[0].activated(Utc::now()).unwrap())])
            .unwrap();
        assert!(matches!(applied, Applied::Stale));
    }

    #[test]
    fn default_branch_cannot_be_deleted_until_replaced() {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("demo", BTreeMap::new(), None).unwrap();
        let other = repo.create_branch(&vt.id, "other", None).unwrap();

        assert!(repo.delete_branch(&vt.id, &vt.default_branch).is_err());
        repo.set_default_branch(&vt.id, &other.id).unwrap();
        repo.delete_branch(&vt.id, &vt.default_branch).unwrap();

        let branches = repo.list_branches(&vt.id).unwrap();
        assert_eq!(branches.len(), 1);
        assert!(branches[0].is_default);
        assert!(repo.get_head(&vt.default_branch).is_err());
    }

    #[test]
    fn properties_merge_and_remove() {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("demo", BTreeMap::new(), None).unwrap();
        let mut props = BTreeMap::new();
        props.insert("owner".to_string(), "data-team".to_string());
        let updated = repo.update_properties(&vt.id, props).unwrap();
        assert_eq!(updated.properties.get("owner").map(String::as_str), Some("data-team"));

        let mut props = BTreeMap::new();
        props.insert("owner".to_string(), String::new());
        let updated = repo.update_properties(&vt.id, props).unwrap();
        assert!(updated.properties.is_empty());
    }

    #[test]
    fn deleting_a_viztrail_cascades() {
        let repo = ViztrailRepository::new();
        let vt = repo.create_viztrail("demo", BTreeMap::new(), None).unwrap();
        let br = vt.default_branch.clone();
        repo.delete_viztrail(&vt.id).unwrap();
        assert!(repo.get_viztrail(&vt.id).is_err());
        assert!(repo.get_branch(&br).is_err());
        assert!(repo.list_viztrails().is_empty());
    }
}

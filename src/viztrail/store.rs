// src/viztrail/store.rs

//! On-disk layout of a repository.
//!
//! ```text
//! <root>/viztrails/<vt>/viztrail.json
//! <root>/viztrails/<vt>/branches/<br>/branch.json
//! <root>/viztrails/<vt>/branches/<br>/<snapshot>.json
//! <root>/viztrails/<vt>/modules/<key>.json
//! ```
//!
//! Module records are content addressed (`key` is the blake3 hash of the
//! serialized record) so a module shared by many snapshots or branches is
//! written once. Snapshot records only list module keys.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::types::{BranchId, ResourceId, SnapshotId, ViztrailId};
use crate::viztrail::branch::{Branch, BranchOrigin};
use crate::viztrail::module::{CommandSpec, Module};
use crate::viztrail::project::Viztrail;
use crate::viztrail::snapshot::{Action, WorkflowSnapshot};

const VIZTRAILS_DIR: &str = "viztrails";
const BRANCHES_DIR: &str = "branches";
const MODULES_DIR: &str = "modules";
const VIZTRAIL_FILE: &str = "viztrail.json";
const BRANCH_FILE: &str = "branch.json";

#[derive(Debug, Serialize, Deserialize)]
struct BranchRecord {
    id: BranchId,
    viztrail_id: ViztrailId,
    name: String,
    is_default: bool,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provenance: Option<BranchOrigin>,
    #[serde(default)]
    context: BTreeSet<ResourceId>,
    #[serde(default)]
    deleted: bool,
    /// History in order; the last id is the head.
    snapshots: Vec<SnapshotId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    id: SnapshotId,
    branch_id: BranchId,
    created_at: DateTime<Utc>,
    action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action_command: Option<CommandSpec>,
    #[serde(default)]
    revision: u64,
    modules: Vec<String>,
}

/// JSON files below a root directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(VIZTRAILS_DIR))?;
        info!(root = %root.display(), "opened object store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn viztrail_dir(&self, id: &ViztrailId) -> PathBuf {
        self.root.join(VIZTRAILS_DIR).join(id.as_str())
    }

    fn branch_dir(&self, vt: &ViztrailId, br: &BranchId) -> PathBuf {
        self.viztrail_dir(vt).join(BRANCHES_DIR).join(br.as_str())
    }

    fn module_path(&self, vt: &ViztrailId, key: &str) -> PathBuf {
        self.viztrail_dir(vt)
            .join(MODULES_DIR)
            .join(format!("{key}.json"))
    }

    pub fn write_viztrail(&self, viztrail: &Viztrail) -> Result<()> {
        let path = self.viztrail_dir(&viztrail.id).join(VIZTRAIL_FILE);
        write_json(&path, viztrail)
    }

    pub fn delete_viztrail(&self, id: &ViztrailId) -> Result<()> {
        let dir = self.viztrail_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Write the branch descriptor and its head snapshot. Earlier snapshots
    /// are already on disk from when they were the head.
    pub fn write_branch(&self, branch: &Branch) -> Result<()> {
        if let Some(head) = branch.head() {
            self.write_snapshot(&branch.viztrail_id, head)?;
        }
        let record = BranchRecord {
            id: branch.id.clone(),
            viztrail_id: branch.viztrail_id.clone(),
            name: branch.name.clone(),
            is_default: branch.is_default,
            created_at: branch.created_at,
            provenance: branch.provenance.clone(),
            context: branch.context.clone(),
            deleted: branch.deleted,
            snapshots: branch.snapshot_ids(),
        };
        let path = self
            .branch_dir(&branch.viztrail_id, &branch.id)
            .join(BRANCH_FILE);
        write_json(&path, &record)
    }

    /// Write every snapshot of a branch (used for forks and restores).
    pub fn write_full_branch(&self, branch: &Branch) -> Result<()> {
        for snapshot in branch.history.iter() {
            self.write_snapshot(&branch.viztrail_id, snapshot)?;
        }
        self.write_branch(branch)
    }

    /// Remove the snapshot files of a deleted branch, keeping its tombstone.
    pub fn purge_branch(&self, branch: &Branch) -> Result<()> {
        let dir = self.branch_dir(&branch.viztrail_id, &branch.id);
        for id in branch.snapshot_ids() {
            let path = dir.join(format!("{id}.json"));
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn write_snapshot(&self, vt: &ViztrailId, snapshot: &WorkflowSnapshot) -> Result<()> {
        let mut keys = Vec::with_capacity(snapshot.modules.len());
        for module in snapshot.modules.iter() {
            keys.push(self.write_module(vt, module)?);
        }
        let record = SnapshotRecord {
            id: snapshot.id.clone(),
            branch_id: snapshot.branch_id.clone(),
            created_at: snapshot.created_at,
            action: snapshot.action,
            action_command: snapshot.action_command.clone(),
            revision: snapshot.revision,
            modules: keys,
        };
        let path = self
            .branch_dir(vt, &snapshot.branch_id)
            .join(format!("{}.json", snapshot.id));
        write_json(&path, &record)
    }

    fn write_module(&self, vt: &ViztrailId, module: &Module) -> Result<String> {
        let bytes = serde_json::to_vec(module)?;
        let key = blake3::hash(&bytes).to_hex().to_string();
        let path = self.module_path(vt, &key);
        if !path.exists() {
            write_bytes(&path, &bytes)?;
        }
        Ok(key)
    }

    /// Read every persisted viztrail together with its branches.
    pub fn load_all(&self) -> Result<Vec<(Viztrail, Vec<Branch>)>> {
        let mut out = Vec::new();
        let dir = self.root.join(VIZTRAILS_DIR);
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let file = path.join(VIZTRAIL_FILE);
            if !file.is_file() {
                warn!(path = %path.display(), "skipping directory without viztrail.json");
                continue;
            }
            let viztrail: Viztrail = read_json(&file)?;
            let mut branches = Vec::new();
            for id in viztrail.branches.iter() {
                branches.push(self.load_branch(&viztrail.id, id)?);
            }
            debug!(viztrail = %viztrail.id, branches = branches.len(), "loaded viztrail");
            out.push((viztrail, branches));
        }
        Ok(out)
    }

    fn load_branch(&self, vt: &ViztrailId, id: &BranchId) -> Result<Branch> {
        let dir = self.branch_dir(vt, id);
        let record: BranchRecord = read_json(&dir.join(BRANCH_FILE))?;
        let mut history = Vec::with_capacity(record.snapshots.len());
        for snapshot_id in record.snapshots.iter() {
            let path = dir.join(format!("{snapshot_id}.json"));
            if !path.exists() && record.deleted {
                // Purged tombstone.
                continue;
            }
            let snap: SnapshotRecord = read_json(&path)?;
            let mut modules = Vec::with_capacity(snap.modules.len());
            for key in snap.modules.iter() {
                let module: Module = read_json(&self.module_path(vt, key))?;
                modules.push(Arc::new(module));
            }
            history.push(Arc::new(WorkflowSnapshot {
                id: snap.id,
                branch_id: snap.branch_id,
                created_at: snap.created_at,
                action: snap.action,
                action_command: snap.action_command,
                revision: snap.revision,
                modules,
            }));
        }
        Ok(Branch {
            id: record.id,
            viztrail_id: record.viztrail_id,
            name: record.name,
            is_default: record.is_default,
            created_at: record.created_at,
            provenance: record.provenance,
            context: record.context,
            deleted: record.deleted,
            history,
        })
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes(path, &bytes)
}

/// Write through a temporary file so readers never see a partial record.
/// Each writer gets its own temporary name; the last rename wins.
fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viztrail::module::{CarryOver, ModuleOutputs, OutputObject, Provenance};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn modules_shared_between_snapshots_are_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let vt_id = ViztrailId::generate();
        let mut branch = Branch::new(vt_id.clone(), "Default", None, Utc::now());
        branch.is_default = true;
        let vt = Viztrail::new(
            vt_id.clone(),
            "demo",
            BTreeMap::new(),
            None,
            branch.id.clone(),
            Utc::now(),
        );

        let t = Utc::now();
        let a = Arc::new(
            Module::scheduled(CommandSpec::new("markdown", "text", json!({"text": "hi"})), t)
                .activated(t)
                .and_then(|m| {
                    m.succeeded(
                        ModuleOutputs::new().with_stdout(OutputObject::markdown("hi")),
                        Provenance::default(),
                        CarryOver::new(),
                        t,
                    )
                })
                .unwrap(),
        );
        branch.push(WorkflowSnapshot::new(
            branch.id.clone(),
            Action::Append,
            None,
            vec![a.clone()],
            t,
        ));
        branch.push(WorkflowSnapshot::new(
            branch.id.clone(),
            Action::Append,
            None,
            vec![a.clone(), Arc::new(Module::scheduled(CommandSpec::new("x", "y", json!(null)), t))],
            t,
        ));

        store.write_viztrail(&vt).unwrap();
        store.write_full_branch(&branch).unwrap();

        let modules_dir = dir.path().join(VIZTRAILS_DIR).join(vt_id.as_str()).join(MODULES_DIR);
        assert_eq!(fs::read_dir(&modules_dir).unwrap().count(), 2);

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let (vt2, branches) = &loaded[0];
        assert_eq!(vt2, &vt);
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0], branch);
    }

    #[test]
    fn concurrent_writers_of_one_record_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("branch.json");

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    for round in 0..20 {
                        write_json(&path, &json!({ "writer": i, "round": round })).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let record: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(record["round"], json!(19));
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["branch.json".to_string()]);
    }
}

// src/viztrail/branch.rs

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BranchId, ModuleId, ResourceId, SnapshotId, ViztrailId};
use crate::viztrail::snapshot::WorkflowSnapshot;

/// Name of the branch every new viztrail starts with.
pub const DEFAULT_BRANCH_NAME: &str = "Default";

/// Where a forked branch came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOrigin {
    pub source_branch: BranchId,
    pub snapshot_id: SnapshotId,
    /// Last module copied into the fork; `None` when the whole head was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<ModuleId>,
}

/// A named, append-only history of workflow snapshots. The last entry of
/// `history` is the head.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub id: BranchId,
    pub viztrail_id: ViztrailId,
    pub name: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub provenance: Option<BranchOrigin>,
    /// Externally supplied resources visible to the first module.
    pub context: BTreeSet<ResourceId>,
    pub deleted: bool,
    pub history: Vec<Arc<WorkflowSnapshot>>,
}

impl Branch {
    pub fn new(
        viztrail_id: ViztrailId,
        name: impl Into<String>,
        provenance: Option<BranchOrigin>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BranchId::generate(),
            viztrail_id,
            name: name.into(),
            is_default: false,
            created_at: at,
            provenance,
            context: BTreeSet::new(),
            deleted: false,
            history: Vec::new(),
        }
    }

    pub fn head(&self) -> Option<&Arc<WorkflowSnapshot>> {
        self.history.last()
    }

    /// Snapshot preceding the head, used to find reuse counterparts.
    pub fn parent_of_head(&self) -> Option<&Arc<WorkflowSnapshot>> {
        let n = self.history.len();
        if n < 2 { None } else { self.history.get(n - 2) }
    }

    pub fn snapshot(&self, id: &SnapshotId) -> Option<&Arc<WorkflowSnapshot>> {
        self.history.iter().find(|s| &s.id == id)
    }

    /// Append a new head.
    pub fn push(&mut self, snapshot: WorkflowSnapshot) -> Arc<WorkflowSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.history.push(snapshot.clone());
        snapshot
    }

    /// Publish a newer revision of the current head. Returns `false` (and
    /// leaves history untouched) if `snapshot` is not a revision of the head.
    pub fn publish_revision(&mut self, snapshot: WorkflowSnapshot) -> bool {
        match self.history.last_mut() {
            Some(head) if head.id == snapshot.id && snapshot.revision > head.revision => {
                *head = Arc::new(snapshot);
                true
            }
            _ => false,
        }
    }

    pub fn last_modified_at(&self) -> DateTime<Utc> {
        self.head()
            .map(|h| h.created_at.max(self.created_at))
            .unwrap_or(self.created_at)
    }

    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        self.history.iter().map(|s| s.id.clone()).collect()
    }
}

// src/viztrail/project.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BackendKind, BranchId, ViztrailId};

/// Project metadata. Branches themselves live in the repository, each behind
/// its own lock; `branches` lists their ids in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viztrail {
    pub id: ViztrailId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Backend override; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    pub default_branch: BranchId,
    #[serde(default)]
    pub branches: Vec<BranchId>,
}

impl Viztrail {
    pub fn new(
        id: ViztrailId,
        name: impl Into<String>,
        properties: BTreeMap<String, String>,
        backend: Option<BackendKind>,
        default_branch: BranchId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            created_at: at,
            last_modified_at: at,
            properties,
            backend,
            branches: vec![default_branch.clone()],
            default_branch,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_modified_at {
            self.last_modified_at = at;
        }
    }
}

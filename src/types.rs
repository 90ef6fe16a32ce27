// src/types.rs

//! Identifiers, resource sets and small shared enums.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for log lines.
            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifies a project (a viztrail).
    ViztrailId
);
string_id!(
    /// Identifies a branch. Unique across all viztrails of a repository.
    BranchId
);
string_id!(
    /// Identifies one workflow snapshot in a branch history.
    SnapshotId
);
string_id!(
    /// Stable module identity, preserved across edits that keep the command.
    ModuleId
);
string_id!(
    /// Identifies one backend invocation. Doubles as the idempotency key for
    /// the queue backend.
    TaskId
);
string_id!(
    /// Names a mutable external artifact (dataset or file).
    ResourceId
);
string_id!(
    /// Opaque version of a resource as reported by the datastore.
    VersionToken
);

/// Resources together with the version each one resolved to.
///
/// Used for a module's read set, its write set, and the context handed to a
/// task at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSet(BTreeMap<ResourceId, VersionToken>);

impl ResourceSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, id: ResourceId, version: VersionToken) {
        self.0.insert(id, version);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&VersionToken> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.0.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &VersionToken)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of `self` (later writes win).
    pub fn extend_from(&mut self, other: &ResourceSet) {
        for (id, version) in other.iter() {
            self.0.insert(id.clone(), version.clone());
        }
    }
}

impl FromIterator<(ResourceId, VersionToken)> for ResourceSet {
    fn from_iter<T: IntoIterator<Item = (ResourceId, VersionToken)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Resources visible to a module when it is dispatched.
pub type ContextResources = ResourceSet;

/// Which execution backend variant runs a viztrail's modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local worker tasks bounded by a pool size.
    Pool,
    /// Distributed message queue consumed by remote workers.
    Queue,
    /// Per-project isolated environment reached over RPC.
    Container,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Pool
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Pool => "pool",
            BackendKind::Queue => "queue",
            BackendKind::Container => "container",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pool" => Ok(BackendKind::Pool),
            "queue" => Ok(BackendKind::Queue),
            "container" => Ok(BackendKind::Container),
            other => Err(format!(
                "invalid backend: {other} (expected \"pool\", \"queue\" or \"container\")"
            )),
        }
    }
}

/// Kind of datastore backing resource versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    /// Versions kept in memory only (lost on restart).
    Memory,
    /// Resources are files below a root directory.
    Files,
}

impl Default for DatastoreKind {
    fn default() -> Self {
        DatastoreKind::Memory
    }
}

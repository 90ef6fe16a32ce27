// src/datastore.rs

//! Resource versions.
//!
//! The engine only ever asks a datastore which version a resource currently
//! has; storing and reading the data itself is the command processors'
//! business.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use blake3::Hasher;
use tracing::{debug, warn};

use crate::config::DatastoreSection;
use crate::errors::{Result, VizError};
use crate::types::{DatastoreKind, ResourceId, VersionToken};

pub trait Datastore: Send + Sync + Debug {
    /// Version the resource resolves to right now, `None` if it doesn't exist.
    fn current_version(&self, id: &ResourceId) -> Option<VersionToken>;

    /// Called after a module declared it wrote `id`; returns the version the
    /// write produced.
    fn record_write(&self, id: &ResourceId) -> VersionToken;

    /// Directory processors should work in, for file-backed stores.
    fn root(&self) -> Option<&Path> {
        None
    }
}

/// Build the datastore named by the `[datastore]` config section.
pub fn from_config(section: &DatastoreSection) -> Arc<dyn Datastore> {
    match section.kind {
        DatastoreKind::Memory => Arc::new(MemoryDatastore::new()),
        DatastoreKind::Files => Arc::new(FileDatastore::new(section.root.clone())),
    }
}

/// In-memory version counters. Every write bumps the version.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    versions: Mutex<HashMap<ResourceId, u64>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a resource from outside the engine.
    pub fn put(&self, id: impl Into<ResourceId>) -> VersionToken {
        self.record_write(&id.into())
    }

    pub fn remove(&self, id: &ResourceId) {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

impl Datastore for MemoryDatastore {
    fn current_version(&self, id: &ResourceId) -> Option<VersionToken> {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|v| VersionToken::new(format!("v{v}")))
    }

    fn record_write(&self, id: &ResourceId) -> VersionToken {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        let next = versions.entry(id.clone()).or_insert(0);
        *next += 1;
        VersionToken::new(format!("v{next}"))
    }
}

/// Resources are files below `root`, named by their relative path. The
/// version of a file is the blake3 hash of its content, so rewriting
/// identical bytes keeps the version.
#[derive(Debug, Clone)]
pub struct FileDatastore {
    root: PathBuf,
}

/// Version recorded for a declared write whose file does not exist.
const MISSING_WRITE: &str = "missing";

impl FileDatastore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a resource, `None` if the id tries to escape the root.
    pub fn path_of(&self, id: &ResourceId) -> Option<PathBuf> {
        let rel = Path::new(id.as_str());
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return None;
        }
        Some(self.root.join(rel))
    }

    /// Hash the content of a resource. `Ok(None)` if the id is outside the
    /// root or names no regular file.
    pub fn content_version(&self, id: &ResourceId) -> Result<Option<VersionToken>> {
        let Some(path) = self.path_of(id) else {
            return Ok(None);
        };
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !file.metadata()?.is_file() {
            return Ok(None);
        }
        let mut hasher = Hasher::new();
        io::copy(&mut file, &mut hasher).map_err(|e| {
            VizError::Io(io::Error::new(e.kind(), format!("hashing resource '{id}': {e}")))
        })?;
        Ok(Some(VersionToken::new(hasher.finalize().to_hex().to_string())))
    }
}

impl Datastore for FileDatastore {
    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn current_version(&self, id: &ResourceId) -> Option<VersionToken> {
        match self.content_version(id) {
            Ok(version) => {
                debug!(resource = %id, version = ?version, "hashed resource");
                version
            }
            Err(e) => {
                warn!(resource = %id, error = %e, "failed to hash resource");
                None
            }
        }
    }

    fn record_write(&self, id: &ResourceId) -> VersionToken {
        self.current_version(id).unwrap_or_else(|| {
            warn!(resource = %id, "module declared a write but the file does not exist");
            VersionToken::from(MISSING_WRITE)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn memory_versions_bump_on_every_write() {
        let ds = MemoryDatastore::new();
        let id = ResourceId::from("people");
        assert_eq!(ds.current_version(&id), None);
        let v1 = ds.put("people");
        assert_eq!(ds.current_version(&id), Some(v1.clone()));
        let v2 = ds.record_write(&id);
        assert_ne!(v1, v2);
        ds.remove(&id);
        assert_eq!(ds.current_version(&id), None);
    }

    #[test]
    fn file_versions_follow_content() {
        let dir = tempfile::tempdir().unwrap();
        let ds = FileDatastore::new(dir.path());
        let id = ResourceId::from("out/data.csv");
        assert_eq!(ds.current_version(&id), None);

        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/data.csv"), "a,b\n1,2\n").unwrap();
        let v1 = ds.current_version(&id).unwrap();

        fs::write(dir.path().join("out/data.csv"), "a,b\n1,2\n").unwrap();
        assert_eq!(ds.current_version(&id), Some(v1.clone()));

        fs::write(dir.path().join("out/data.csv"), "a,b\n3,4\n").unwrap();
        assert_ne!(ds.current_version(&id), Some(v1));
    }

    #[test]
    fn file_ids_cannot_escape_the_root() {
        let ds = FileDatastore::new("/tmp/root");
        assert!(ds.path_of(&ResourceId::from("../etc/passwd")).is_none());
        assert!(ds.path_of(&ResourceId::from("/etc/passwd")).is_none());
        assert!(ds.path_of(&ResourceId::from("./a/b.csv")).is_some());
    }

    #[test]
    fn content_versions_skip_directories_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let ds = FileDatastore::new(dir.path());
        fs::create_dir_all(dir.path().join("out")).unwrap();

        assert_eq!(ds.content_version(&ResourceId::from("out")).unwrap(), None);
        assert_eq!(ds.content_version(&ResourceId::from("nope.csv")).unwrap(), None);
        assert_eq!(ds.content_version(&ResourceId::from("../x")).unwrap(), None);

        fs::write(dir.path().join("out/a.txt"), "same").unwrap();
        fs::write(dir.path().join("b.txt"), "same").unwrap();
        let a = ds.content_version(&ResourceId::from("out/a.txt")).unwrap();
        let b = ds.content_version(&ResourceId::from("b.txt")).unwrap();
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(ds.record_write(&ResourceId::from("b.txt")), b.unwrap());
        assert_eq!(
            ds.record_write(&ResourceId::from("gone.txt")),
            VersionToken::from(MISSING_WRITE)
        );
    }
}

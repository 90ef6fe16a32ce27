// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{BackendKind, DatastoreKind};
use crate::viztrail::CommandSpec;

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [engine]
/// backend = "pool"
/// pool_size = 4
///
/// [queue]
/// workers = 2
/// lease = "5m"
///
/// [queue.routes]
/// "shell.run" = "heavy"
///
/// [repository]
/// data_dir = ".viztrail"
///
/// [packages.shell.run]
/// no_cache = false
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub queue: QueueSection,

    #[serde(default)]
    pub container: ContainerSection,

    #[serde(default)]
    pub repository: RepositorySection,

    #[serde(default)]
    pub datastore: DatastoreSection,

    /// `[packages.<package>.<command>]` operator flags.
    #[serde(default)]
    pub packages: BTreeMap<String, BTreeMap<String, CommandConfig>>,
}

/// Validated configuration. Build it with `ConfigFile::try_from(raw)` or
/// [`crate::config::load_and_validate`].
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub queue: QueueSection,
    pub container: ContainerSection,
    pub repository: RepositorySection,
    pub datastore: DatastoreSection,
    pub packages: BTreeMap<String, BTreeMap<String, CommandConfig>>,
    /// `queue.lease` parsed during validation.
    pub queue_lease: Duration,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile, queue_lease: Duration) -> Self {
        Self {
            engine: raw.engine,
            queue: raw.queue,
            container: raw.container,
            repository: raw.repository,
            datastore: raw.datastore,
            packages: raw.packages,
            queue_lease,
        }
    }

    /// Operator flags for a command; defaults when not configured.
    pub fn command_config(&self, package: &str, command: &str) -> CommandConfig {
        self.packages
            .get(package)
            .and_then(|cmds| cmds.get(command))
            .cloned()
            .unwrap_or_default()
    }

    /// Queue a command is routed to by the queue backend.
    pub fn route_for(&self, command: &CommandSpec) -> &str {
        self.queue
            .routes
            .get(&command.key())
            .map(String::as_str)
            .unwrap_or(DEFAULT_QUEUE)
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        ConfigFile::new_unchecked(RawConfigFile::default(), Duration::from_secs(300))
    }
}

/// Name of the queue used when no route matches.
pub const DEFAULT_QUEUE: &str = "default";

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Default backend for viztrails that don't pick one explicitly.
    #[serde(default)]
    pub backend: BackendKind,

    /// Maximum number of tasks the local pool runs at once.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    4
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            pool_size: default_pool_size(),
        }
    }
}

/// `[queue]` section, used by the distributed-queue backend.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    /// Number of consumer workers per queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Duration string (e.g. `"30s"`). A task holding its lease longer than
    /// this is reported as failed.
    #[serde(default = "default_lease")]
    pub lease: String,

    /// How often a task is redelivered after its worker was lost.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    /// `"package.command"` -> queue name.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

fn default_workers() -> usize {
    2
}

fn default_lease() -> String {
    "5m".to_string()
}

fn default_max_redeliveries() -> u32 {
    1
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease: default_lease(),
            max_redeliveries: default_max_redeliveries(),
            routes: BTreeMap::new(),
        }
    }
}

/// `[container]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSection {
    /// Worker pool size inside each project container.
    #[serde(default = "default_container_pool")]
    pub pool_size: usize,

    /// Capacity of the RPC request channel into a container.
    #[serde(default = "default_rpc_buffer")]
    pub rpc_buffer: usize,
}

fn default_container_pool() -> usize {
    1
}

fn default_rpc_buffer() -> usize {
    32
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            pool_size: default_container_pool(),
            rpc_buffer: default_rpc_buffer(),
        }
    }
}

/// `[repository]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositorySection {
    /// Directory for persisted viztrails; memory-only when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Remove the snapshots of deleted branches instead of keeping them.
    #[serde(default)]
    pub purge_deleted_branches: bool,
}

/// `[datastore]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreSection {
    #[serde(default)]
    pub kind: DatastoreKind,

    /// Root directory for the `files` datastore.
    #[serde(default = "default_datastore_root")]
    pub root: PathBuf,
}

fn default_datastore_root() -> PathBuf {
    PathBuf::from("data")
}

impl Default for DatastoreSection {
    fn default() -> Self {
        Self {
            kind: DatastoreKind::default(),
            root: default_datastore_root(),
        }
    }
}

/// `[packages.<package>.<command>]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommandConfig {
    /// Run inline through the registry instead of the backend; never reused.
    #[serde(default)]
    pub synchronous: bool,

    /// Always re-run, even when provenance says the result is still valid.
    #[serde(default)]
    pub no_cache: bool,

    /// Disabled commands are rejected at edit time.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            synchronous: false,
            no_cache: false,
            enabled: true,
        }
    }
}

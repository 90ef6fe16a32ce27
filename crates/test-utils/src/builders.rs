#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use viztrail::config::{CommandConfig, ConfigFile, RawConfigFile};
use viztrail::datastore::{Datastore, MemoryDatastore};
use viztrail::engine::{Engine, EngineContext};
use viztrail::exec::{CommandFlags, CommandRegistry};
use viztrail::types::{BackendKind, DatastoreKind};
use viztrail::viztrail::{CommandSpec, ViztrailRepository};

use crate::processors::ScriptedProcessor;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.engine.backend = kind;
        self
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.config.engine.pool_size = n;
        self
    }

    pub fn queue_workers(mut self, n: usize) -> Self {
        self.config.queue.workers = n;
        self
    }

    pub fn queue_lease(mut self, lease: &str) -> Self {
        self.config.queue.lease = lease.to_string();
        self
    }

    pub fn max_redeliveries(mut self, n: u32) -> Self {
        self.config.queue.max_redeliveries = n;
        self
    }

    pub fn route(mut self, command: &str, queue: &str) -> Self {
        self.config
            .queue
            .routes
            .insert(command.to_string(), queue.to_string());
        self
    }

    pub fn container_pool(mut self, n: usize) -> Self {
        self.config.container.pool_size = n;
        self
    }

    pub fn data_dir(mut self, dir: &Path) -> Self {
        self.config.repository.data_dir = Some(dir.to_path_buf());
        self
    }

    pub fn purge_deleted_branches(mut self, val: bool) -> Self {
        self.config.repository.purge_deleted_branches = val;
        self
    }

    pub fn files_datastore(mut self, root: &Path) -> Self {
        self.config.datastore.kind = DatastoreKind::Files;
        self.config.datastore.root = root.to_path_buf();
        self
    }

    pub fn command(mut self, package: &str, command: &str, cfg: CommandConfig) -> Self {
        self.config
            .packages
            .entry(package.to_string())
            .or_default()
            .insert(command.to_string(), cfg);
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A `test.step` command handled by [`ScriptedProcessor`].
///
/// `extra` is merged into the arguments (`reads`, `writes`, `fail`,
/// `delay_ms`, `gate`).
pub fn step(name: &str, extra: Value) -> CommandSpec {
    let mut args = json!({ "name": name });
    if let (Some(target), Value::Object(extra)) = (args.as_object_mut(), extra) {
        target.extend(extra);
    }
    CommandSpec::new("test", "step", args)
}

/// Shorthand for a `test.step` without extra arguments.
pub fn plain(name: &str) -> CommandSpec {
    step(name, json!({}))
}

/// Registry with the built-ins plus `test.step` and `test.sync`
/// (a synchronous `ScriptedProcessor`).
pub fn scripted_registry(processor: Arc<ScriptedProcessor>) -> CommandRegistry {
    let mut registry = CommandRegistry::with_builtins();
    registry.register("test", "step", processor.clone(), CommandFlags::default());
    registry.register(
        "test",
        "sync",
        processor,
        CommandFlags {
            synchronous: true,
            no_cache: false,
        },
    );
    registry
}

/// Engine over a memory repository.
pub fn start_engine(
    config: ConfigFile,
    registry: CommandRegistry,
    datastore: Arc<dyn Datastore>,
) -> Engine {
    start_engine_with(config, ViztrailRepository::new(), registry, datastore)
}

pub fn start_engine_with(
    config: ConfigFile,
    repository: ViztrailRepository,
    registry: CommandRegistry,
    datastore: Arc<dyn Datastore>,
) -> Engine {
    Engine::start(EngineContext::new(
        Arc::new(config),
        Arc::new(repository),
        Arc::new(registry),
        datastore,
    ))
}

/// Default engine with a scripted processor and a memory datastore.
pub fn scripted_engine(config: ConfigFile) -> (Engine, Arc<ScriptedProcessor>, Arc<MemoryDatastore>) {
    let processor = Arc::new(ScriptedProcessor::new());
    let datastore = Arc::new(MemoryDatastore::new());
    let mut registry = scripted_registry(Arc::clone(&processor));
    registry.apply_config(&config);
    let engine = start_engine(config, registry, datastore.clone());
    (engine, processor, datastore)
}

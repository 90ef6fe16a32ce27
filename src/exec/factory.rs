// src/exec/factory.rs

//! Builds execution backends from configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::config::ConfigFile;
use crate::datastore::Datastore;
use crate::exec::backend::ExecutionBackend;
use crate::exec::container::ContainerBackend;
use crate::exec::pool::LocalPoolBackend;
use crate::exec::processor::CommandRegistry;
use crate::exec::queue::QueueBackend;
use crate::types::{BackendKind, ViztrailId};

/// Creates the backend a viztrail runs on.
///
/// The local pool and the queue broker are deployment-wide and shared by
/// every viztrail using them; containers are created one per viztrail.
pub struct BackendFactory {
    config: Arc<ConfigFile>,
    registry: Arc<CommandRegistry>,
    datastore: Arc<dyn Datastore>,
    shared: Mutex<HashMap<BackendKind, Arc<dyn ExecutionBackend>>>,
    containers: Mutex<HashMap<ViztrailId, Arc<dyn ExecutionBackend>>>,
}

impl BackendFactory {
    pub fn new(
        config: Arc<ConfigFile>,
        registry: Arc<CommandRegistry>,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        Self {
            config,
            registry,
            datastore,
            shared: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Backend for `viztrail`, created on first use. Must be called inside a
    /// Tokio runtime.
    pub fn create(&self, kind: BackendKind, viztrail: &ViztrailId) -> Arc<dyn ExecutionBackend> {
        match kind {
            BackendKind::Pool | BackendKind::Queue => {
                let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
                shared
                    .entry(kind)
                    .or_insert_with(|| self.build_shared(kind))
                    .clone()
            }
            BackendKind::Container => {
                let installed = self
                    .shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&kind)
                    .cloned();
                if let Some(backend) = installed {
                    return backend;
                }
                let mut containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
                containers
                    .entry(viztrail.clone())
                    .or_insert_with(|| {
                        info!(viztrail = %viztrail, "starting project container");
                        Arc::new(ContainerBackend::start(
                            viztrail.clone(),
                            self.config.container.pool_size,
                            self.config.container.rpc_buffer,
                            Arc::clone(&self.registry),
                            Arc::clone(&self.datastore),
                        )) as Arc<dyn ExecutionBackend>
                    })
                    .clone()
            }
        }
    }

    /// Use a pre-built backend for every viztrail of `kind` (e.g. a client of
    /// an externally managed queue). Replaces any backend built so far.
    pub fn install(&self, kind: BackendKind, backend: Arc<dyn ExecutionBackend>) {
        info!(backend = %kind, "installed external execution backend");
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, backend);
    }

    fn build_shared(&self, kind: BackendKind) -> Arc<dyn ExecutionBackend> {
        match kind {
            BackendKind::Queue => Arc::new(QueueBackend::new(
                &self.config,
                Arc::clone(&self.registry),
                Arc::clone(&self.datastore),
            )),
            _ => Arc::new(LocalPoolBackend::new(
                self.config.engine.pool_size,
                Arc::clone(&self.registry),
                Arc::clone(&self.datastore),
            )),
        }
    }

    /// Stop and forget the container of a deleted viztrail.
    pub async fn release(&self, viztrail: &ViztrailId) {
        let backend = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(viztrail);
        if let Some(backend) = backend {
            backend.shutdown().await;
        }
    }

    /// Shut down every backend created so far.
    pub async fn shutdown_all(&self) {
        let mut backends: Vec<Arc<dyn ExecutionBackend>> = self
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, b)| b)
            .collect();
        backends.extend(
            self.containers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, b)| b),
        );
        for backend in backends {
            backend.shutdown().await;
        }
    }
}

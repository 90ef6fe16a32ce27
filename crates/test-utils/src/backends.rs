#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use viztrail::datastore::Datastore;
use viztrail::errors::{Result, VizError};
use viztrail::exec::{
    BoxFuture, CommandRegistry, CompletionSender, ExecutionBackend, LocalPoolBackend, Task,
    TaskHandle,
};
use viztrail::types::BackendKind;

/// Local pool that can be switched off to simulate an unreachable backend.
pub struct SwitchableBackend {
    inner: LocalPoolBackend,
    online: AtomicBool,
    preemptible: bool,
}

impl SwitchableBackend {
    pub fn new(
        registry: Arc<CommandRegistry>,
        datastore: Arc<dyn Datastore>,
        preemptible: bool,
    ) -> Self {
        Self {
            inner: LocalPoolBackend::new(2, registry, datastore),
            online: AtomicBool::new(true),
            preemptible,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl ExecutionBackend for SwitchableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pool
    }

    fn supports_preemption(&self) -> bool {
        self.preemptible
    }

    fn is_accepting(&self) -> bool {
        self.online.load(Ordering::SeqCst) && self.inner.is_accepting()
    }

    fn submit(&self, task: Task, done: CompletionSender) -> BoxFuture<'_, Result<TaskHandle>> {
        if !self.online.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(VizError::BackendUnavailable("switched off".to_string()))
            });
        }
        self.inner.submit(task, done)
    }

    fn cancel(&self, handle: &TaskHandle) -> BoxFuture<'_, ()> {
        self.inner.cancel(handle)
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        self.inner.shutdown()
    }
}

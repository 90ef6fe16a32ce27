// src/exec/pool.rs

//! Local worker pool backend.
//!
//! Every submitted task runs in its own Tokio task, gated by a semaphore of
//! `pool_size` permits. Cancellation goes through a per-task oneshot; the
//! running processor future is dropped, which kills any child process it
//! spawned (`kill_on_drop`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, info};

use crate::datastore::Datastore;
use crate::errors::{Result, VizError};
use crate::exec::BoxFuture;
use crate::exec::backend::{CompletionSender, ExecutionBackend, Task, TaskHandle, TaskOutcome};
use crate::exec::processor::{CommandRegistry, run_processor};
use crate::types::{BackendKind, TaskId};

/// Internal handle for a task currently owned by the pool.
///
/// - `cancel` asks the runner to stop the task.
/// - `handle` is the Tokio task that runs it.
struct ActiveTask {
    cancel: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct LocalPoolBackend {
    registry: Arc<CommandRegistry>,
    datastore: Arc<dyn Datastore>,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<TaskId, ActiveTask>>>,
    accepting: AtomicBool,
    pool_size: usize,
}

impl LocalPoolBackend {
    pub fn new(
        pool_size: usize,
        registry: Arc<CommandRegistry>,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        let pool_size = pool_size.max(1);
        info!(pool_size, "local pool backend started");
        Self {
            registry,
            datastore,
            permits: Arc::new(Semaphore::new(pool_size)),
            active: Arc::new(Mutex::new(HashMap::new())),
            accepting: AtomicBool::new(true),
            pool_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of tasks submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_task(&self, task: Task, done: CompletionSender) -> TaskHandle {
        let task_id = task.id.clone();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let permits = Arc::clone(&self.permits);
        let registry = Arc::clone(&self.registry);
        let datastore = Arc::clone(&self.datastore);
        let active = Arc::clone(&self.active);
        let id = task_id.clone();

        // Insert under the lock so the runner's removal can't precede it.
        let mut guard = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = async {
                    let _permit = match permits.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return TaskOutcome::error("worker pool closed"),
                    };
                    debug!(task = %id, "task acquired a pool slot");
                    run_processor(&registry, datastore, task).await
                } => outcome,
                cancel = &mut cancel_rx => {
                    match cancel {
                        Ok(()) => info!(task = %id, "cancellation requested; stopping task"),
                        Err(_) => debug!(task = %id, "cancel channel closed without explicit cancellation"),
                    }
                    TaskOutcome::Canceled
                }
            };
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            done.complete(outcome);
        });
        guard.insert(
            task_id.clone(),
            ActiveTask {
                cancel: Some(cancel_tx),
                handle,
            },
        );

        TaskHandle {
            task_id,
            backend: BackendKind::Pool,
        }
    }
}

impl ExecutionBackend for LocalPoolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pool
    }

    fn supports_preemption(&self) -> bool {
        true
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn submit(&self, task: Task, done: CompletionSender) -> BoxFuture<'_, Result<TaskHandle>> {
        Box::pin(async move {
            if !self.is_accepting() {
                return Err(VizError::BackendUnavailable(
                    "local pool is shut down".to_string(),
                ));
            }
            debug!(task = %task.id, module = %task.module, command = %task.command, "submitting to local pool");
            Ok(self.spawn_task(task, done))
        })
    }

    fn cancel(&self, handle: &TaskHandle) -> BoxFuture<'_, ()> {
        let task_id = handle.task_id.clone();
        Box::pin(async move {
            let sender = self
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(&task_id)
                .and_then(|t| t.cancel.take());
            match sender {
                Some(cancel) => {
                    if cancel.send(()).is_err() {
                        debug!(task = %task_id, "task already finished while cancelling");
                    }
                }
                None => debug!(
                    task = %task_id,
                    "no cancel sender present; task finished or was already cancelled"
                ),
            }
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.accepting.store(false, Ordering::SeqCst);
            let tasks: Vec<(TaskId, ActiveTask)> = self
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .collect();
            info!(in_flight = tasks.len(), "local pool shutting down");
            for (id, mut task) in tasks {
                if let Some(cancel) = task.cancel.take() {
                    let _ = cancel.send(());
                }
                if let Err(e) = task.handle.await {
                    debug!(task = %id, error = %e, "pool task ended abnormally");
                }
            }
        })
    }
}

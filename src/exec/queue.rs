// src/exec/queue.rs

//! Distributed-queue backend.
//!
//! Tasks are published to named queues (one per route target plus
//! `"default"`) and consumed by `workers` consumer loops per queue. The
//! broker keeps a task table keyed by task id, which makes delivery
//! idempotent: a redelivered or duplicated message for a task that is
//! already running or finished is dropped, and only the first result of a
//! task is reported.
//!
//! - A task holding its lease longer than `[queue].lease` is reported as
//!   ERROR.
//! - A worker lost mid-task (the processor panicked) leads to redelivery, up
//!   to `[queue].max_redeliveries` times, then ERROR.
//! - `cancel` revokes a queued task immediately and interrupts a running one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::config::model::DEFAULT_QUEUE;
use crate::datastore::Datastore;
use crate::errors::{Result, VizError};
use crate::exec::BoxFuture;
use crate::exec::backend::{CompletionSender, ExecutionBackend, Task, TaskHandle, TaskOutcome};
use crate::exec::processor::{CommandRegistry, run_processor};
use crate::types::{BackendKind, TaskId};

#[derive(Debug)]
struct Delivery {
    task: Task,
    attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Queued,
    Running,
    Revoked,
}

struct Entry {
    state: EntryState,
    attempt: u32,
    queue: String,
    done: Option<CompletionSender>,
    cancel: Option<oneshot::Sender<()>>,
}

struct Broker {
    registry: Arc<CommandRegistry>,
    datastore: Arc<dyn Datastore>,
    lease: Duration,
    max_redeliveries: u32,
    config: ConfigFile,
    entries: Mutex<HashMap<TaskId, Entry>>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    accepting: AtomicBool,
    live_workers: AtomicUsize,
}

impl Broker {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_for(&self, task: &Task) -> String {
        self.config.route_for(&task.command).to_string()
    }

    fn publish(&self, queue: &str, delivery: Delivery) -> Result<()> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = queues
            .get(queue)
            .or_else(|| queues.get(DEFAULT_QUEUE))
            .ok_or_else(|| VizError::BackendUnavailable(format!("queue '{queue}' is closed")))?;
        tx.send(delivery)
            .map_err(|_| VizError::BackendUnavailable(format!("queue '{queue}' has no consumers")))
    }

    /// Report the first result of a task; later ones are dropped.
    fn finish(&self, task_id: &TaskId, outcome: TaskOutcome) {
        let entry = self.entries().remove(task_id);
        match entry.and_then(|mut e| e.done.take()) {
            Some(done) => done.complete(outcome),
            None => debug!(task = %task_id, "duplicate result ignored"),
        }
    }
}

pub struct QueueBackend {
    broker: Arc<Broker>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl QueueBackend {
    /// Create the broker and start the consumer loops. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        config: &ConfigFile,
        registry: Arc<CommandRegistry>,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        let mut names: Vec<String> = config.queue.routes.values().cloned().collect();
        names.push(DEFAULT_QUEUE.to_string());
        names.sort();
        names.dedup();

        let broker = Arc::new(Broker {
            registry,
            datastore,
            lease: config.queue_lease,
            max_redeliveries: config.queue.max_redeliveries,
            config: config.clone(),
            entries: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            live_workers: AtomicUsize::new(0),
        });

        let mut workers = Vec::new();
        for name in names.iter() {
            let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
            broker
                .queues
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), tx);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for n in 0..config.queue.workers.max(1) {
                let worker = format!("{name}-{n}");
                broker.live_workers.fetch_add(1, Ordering::SeqCst);
                workers.push(tokio::spawn(worker_loop(
                    Arc::clone(&broker),
                    Arc::clone(&rx),
                    worker,
                )));
            }
        }
        info!(
            queues = ?names,
            workers_per_queue = config.queue.workers,
            lease = ?config.queue_lease,
            "queue backend started"
        );

        Self {
            broker,
            workers: Mutex::new(workers),
        }
    }

    /// Number of tasks known to the broker (queued or running).
    pub fn in_flight(&self) -> usize {
        self.broker.entries().len()
    }
}

async fn worker_loop(
    broker: Arc<Broker>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    worker: String,
) {
    debug!(worker = %worker, "queue worker started");
    loop {
        let delivery = { rx.lock().await.recv().await };
        let Some(delivery) = delivery else {
            break;
        };
        handle_delivery(&broker, delivery, &worker).await;
    }
    broker.live_workers.fetch_sub(1, Ordering::SeqCst);
    debug!(worker = %worker, "queue worker stopped (queue closed)");
}

async fn handle_delivery(broker: &Arc<Broker>, delivery: Delivery, worker: &str) {
    let task_id = delivery.task.id.clone();

    // Claim the task.
    let cancel_rx = {
        let mut entries = broker.entries();
        let Some(entry) = entries.get_mut(&task_id) else {
            debug!(task = %task_id, worker, "delivery for finished task ignored");
            return;
        };
        let state = entry.state;
        match state {
            EntryState::Revoked => {
                entries.remove(&task_id);
                debug!(task = %task_id, worker, "revoked task discarded");
                return;
            }
            EntryState::Running => {
                debug!(task = %task_id, worker, "duplicate delivery ignored");
                return;
            }
            EntryState::Queued if entry.attempt != delivery.attempt => {
                debug!(task = %task_id, worker, attempt = delivery.attempt, "stale delivery ignored");
                return;
            }
            EntryState::Queued => {
                let (tx, rx) = oneshot::channel();
                entry.state = EntryState::Running;
                entry.cancel = Some(tx);
                rx
            }
        }
    };

    info!(task = %task_id, worker, attempt = delivery.attempt, "worker picked up task");

    let registry = Arc::clone(&broker.registry);
    let datastore = Arc::clone(&broker.datastore);
    let task = delivery.task.clone();
    let mut run = tokio::spawn(async move { run_processor(&registry, datastore, task).await });

    let outcome = tokio::select! {
        res = tokio::time::timeout(broker.lease, &mut run) => match res {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) if e.is_panic() => None,
            Ok(Err(e)) => Some(TaskOutcome::error(format!("worker task aborted: {e}"))),
            Err(_) => {
                run.abort();
                warn!(task = %task_id, worker, lease = ?broker.lease, "task lease expired");
                Some(TaskOutcome::error(format!(
                    "task lease of {:?} expired",
                    broker.lease
                )))
            }
        },
        _ = cancel_rx => {
            run.abort();
            info!(task = %task_id, worker, "running task revoked");
            Some(TaskOutcome::Canceled)
        }
    };

    match outcome {
        Some(outcome) => broker.finish(&task_id, outcome),
        None => redeliver(broker, delivery.task, delivery.attempt, worker),
    }
}

/// The worker died mid-task: put the task back or give up.
fn redeliver(broker: &Arc<Broker>, task: Task, attempt: u32, worker: &str) {
    let task_id = task.id.clone();
    if attempt >= broker.max_redeliveries {
        warn!(task = %task_id, worker, attempts = attempt + 1, "worker lost; giving up");
        broker.finish(
            &task_id,
            TaskOutcome::error(format!("worker lost after {} attempt(s)", attempt + 1)),
        );
        return;
    }

    let queue = {
        let mut entries = broker.entries();
        let Some(entry) = entries.get_mut(&task_id) else {
            return;
        };
        if entry.state == EntryState::Revoked {
            drop(entries);
            broker.finish(&task_id, TaskOutcome::Canceled);
            return;
        }
        entry.state = EntryState::Queued;
        entry.attempt = attempt + 1;
        entry.cancel = None;
        entry.queue.clone()
    };

    warn!(task = %task_id, worker, attempt = attempt + 1, "worker lost; redelivering task");
    let next = Delivery {
        task,
        attempt: attempt + 1,
    };
    if let Err(e) = broker.publish(&queue, next) {
        broker.finish(&task_id, TaskOutcome::error(e.to_string()));
    }
}

impl ExecutionBackend for QueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Queue
    }

    fn supports_preemption(&self) -> bool {
        false
    }

    fn is_accepting(&self) -> bool {
        self.broker.accepting.load(Ordering::SeqCst)
            && self.broker.live_workers.load(Ordering::SeqCst) > 0
    }

    fn submit(&self, task: Task, done: CompletionSender) -> BoxFuture<'_, Result<TaskHandle>> {
        Box::pin(async move {
            if !self.is_accepting() {
                return Err(VizError::BackendUnavailable(
                    "queue backend has no live workers".to_string(),
                ));
            }
            let handle = TaskHandle {
                task_id: task.id.clone(),
                backend: BackendKind::Queue,
            };
            let queue = self.broker.queue_for(&task);
            {
                let mut entries = self.broker.entries();
                if entries.contains_key(&task.id) {
                    debug!(task = %task.id, "task id already known; submission ignored");
                    return Ok(handle);
                }
                entries.insert(
                    task.id.clone(),
                    Entry {
                        state: EntryState::Queued,
                        attempt: 0,
                        queue: queue.clone(),
                        done: Some(done),
                        cancel: None,
                    },
                );
            }
            debug!(task = %task.id, queue = %queue, command = %task.command, "publishing task");
            let task_id = task.id.clone();
            if let Err(e) = self.broker.publish(&queue, Delivery { task, attempt: 0 }) {
                // Nothing was consumed; hand the error to the caller instead.
                self.broker.entries().remove(&task_id);
                return Err(e);
            }
            Ok(handle)
        })
    }

    fn cancel(&self, handle: &TaskHandle) -> BoxFuture<'_, ()> {
        let task_id = handle.task_id.clone();
        Box::pin(async move {
            let mut entries = self.broker.entries();
            let Some(entry) = entries.get_mut(&task_id) else {
                debug!(task = %task_id, "revoke for finished task ignored");
                return;
            };
            match entry.state {
                EntryState::Queued => {
                    entry.state = EntryState::Revoked;
                    if let Some(done) = entry.done.take() {
                        done.complete(TaskOutcome::Canceled);
                    }
                    info!(task = %task_id, "queued task revoked");
                }
                EntryState::Running => {
                    if let Some(cancel) = entry.cancel.take() {
                        let _ = cancel.send(());
                    }
                }
                EntryState::Revoked => {}
            }
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.broker.accepting.store(false, Ordering::SeqCst);
            {
                let mut entries = self.broker.entries();
                for (id, entry) in entries.iter_mut() {
                    match entry.state {
                        EntryState::Queued => {
                            entry.state = EntryState::Revoked;
                            if let Some(done) = entry.done.take() {
                                done.complete(TaskOutcome::Canceled);
                            }
                        }
                        EntryState::Running => {
                            if let Some(cancel) = entry.cancel.take() {
                                let _ = cancel.send(());
                            }
                        }
                        EntryState::Revoked => {}
                    }
                    debug!(task = %id, "task stopped by shutdown");
                }
            }
            self.broker
                .queues
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            let workers: Vec<_> = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for worker in workers {
                let _ = worker.await;
            }
            info!("queue backend stopped");
        })
    }
}

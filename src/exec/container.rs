// src/exec/container.rs

//! Per-project isolated execution environment.
//!
//! Each viztrail using this backend gets its own `ProjectContainer` actor
//! with a private worker pool. The engine side and the container only
//! exchange JSON-encoded [`RpcRequest`]s and [`RpcEvent`]s over channels,
//! so nothing but the task description crosses the boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::datastore::Datastore;
use crate::errors::{Result, VizError};
use crate::exec::BoxFuture;
use crate::exec::backend::{CompletionSender, ExecutionBackend, Task, TaskHandle, TaskOutcome};
use crate::exec::pool::LocalPoolBackend;
use crate::exec::processor::CommandRegistry;
use crate::types::{BackendKind, TaskId, ViztrailId};

/// Requests sent into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    Submit { task: Task },
    Cancel { task_id: TaskId },
    Ping,
    Shutdown,
}

/// Events sent back by a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RpcEvent {
    Accepted { task_id: TaskId },
    Rejected { task_id: TaskId, message: String },
    Completed { task_id: TaskId, outcome: TaskOutcome },
    /// Reply to `Ping` with the number of tasks running inside.
    Pong { running: usize },
    Stopped,
}

/// Engine-side end of a container connection.
pub struct ContainerConnection {
    pub requests: mpsc::Sender<String>,
    pub events: mpsc::Receiver<String>,
}

/// Start the container actor for one project.
pub fn spawn_container(
    viztrail: ViztrailId,
    pool_size: usize,
    rpc_buffer: usize,
    registry: Arc<CommandRegistry>,
    datastore: Arc<dyn Datastore>,
) -> ContainerConnection {
    let (req_tx, req_rx) = mpsc::channel::<String>(rpc_buffer.max(1));
    let (evt_tx, evt_rx) = mpsc::channel::<String>(rpc_buffer.max(1));
    let pool = Arc::new(LocalPoolBackend::new(pool_size, registry, datastore));
    tokio::spawn(container_loop(viztrail, pool, req_rx, evt_tx));
    ContainerConnection {
        requests: req_tx,
        events: evt_rx,
    }
}

async fn send_event(tx: &mpsc::Sender<String>, event: &RpcEvent) {
    match serde_json::to_string(event) {
        Ok(line) => {
            if tx.send(line).await.is_err() {
                debug!("container event channel closed");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode container event"),
    }
}

async fn container_loop(
    viztrail: ViztrailId,
    pool: Arc<LocalPoolBackend>,
    mut requests: mpsc::Receiver<String>,
    events: mpsc::Sender<String>,
) {
    info!(viztrail = %viztrail, pool_size = pool.pool_size(), "project container started");
    let mut handles: HashMap<TaskId, TaskHandle> = HashMap::new();
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<TaskId>();

    loop {
        let line = tokio::select! {
            biased;
            Some(task_id) = finished_rx.recv() => {
                handles.remove(&task_id);
                continue;
            }
            line = requests.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(viztrail = %viztrail, error = %e, "malformed container request");
                continue;
            }
        };
        match request {
            RpcRequest::Submit { task } => {
                let task_id = task.id.clone();
                let (done, rx) = CompletionSender::channel(task_id.clone());
                match pool.submit(task, done).await {
                    Ok(handle) => {
                        handles.insert(task_id.clone(), handle);
                        send_event(&events, &RpcEvent::Accepted { task_id: task_id.clone() }).await;
                        let events = events.clone();
                        let finished = finished_tx.clone();
                        tokio::spawn(async move {
                            let outcome = rx.await.unwrap_or_else(|_| {
                                TaskOutcome::error("container worker dropped the task")
                            });
                            // Release the handle before the engine hears about it.
                            let _ = finished.send(task_id.clone());
                            send_event(&events, &RpcEvent::Completed { task_id, outcome }).await;
                        });
                    }
                    Err(e) => {
                        send_event(
                            &events,
                            &RpcEvent::Rejected {
                                task_id,
                                message: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            RpcRequest::Cancel { task_id } => match handles.remove(&task_id) {
                Some(handle) => pool.cancel(&handle).await,
                None => debug!(viztrail = %viztrail, task = %task_id, "cancel for unknown task"),
            },
            RpcRequest::Ping => {
                let running = handles.len();
                send_event(&events, &RpcEvent::Pong { running }).await
            }
            RpcRequest::Shutdown => {
                pool.shutdown().await;
                send_event(&events, &RpcEvent::Stopped).await;
                break;
            }
        }
    }
    info!(viztrail = %viztrail, "project container stopped");
}

/// Backend forwarding tasks to one project's container.
pub struct ContainerBackend {
    viztrail: ViztrailId,
    requests: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<TaskId, CompletionSender>>>,
    pongs: PongQueue,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

type PongQueue = Arc<Mutex<VecDeque<oneshot::Sender<usize>>>>;

impl ContainerBackend {
    /// Start a container for `viztrail` and connect to it.
    pub fn start(
        viztrail: ViztrailId,
        pool_size: usize,
        rpc_buffer: usize,
        registry: Arc<CommandRegistry>,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        let conn = spawn_container(viztrail.clone(), pool_size, rpc_buffer, registry, datastore);
        Self::connect(viztrail, conn)
    }

    /// Attach to an already running container.
    pub fn connect(viztrail: ViztrailId, conn: ContainerConnection) -> Self {
        let pending: Arc<Mutex<HashMap<TaskId, CompletionSender>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pongs: PongQueue = Arc::new(Mutex::new(VecDeque::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_events(
            viztrail.clone(),
            conn.events,
            Arc::clone(&pending),
            Arc::clone(&pongs),
            Arc::clone(&alive),
        ));
        Self {
            viztrail,
            requests: conn.requests,
            pending,
            pongs,
            alive,
            reader: Mutex::new(Some(reader)),
        }
    }

    async fn send(&self, request: &RpcRequest) -> Result<()> {
        let line = serde_json::to_string(request)?;
        self.requests.send(line).await.map_err(|_| {
            VizError::BackendUnavailable(format!("container of viztrail {} is gone", self.viztrail))
        })
    }

    /// Round trip to the container; returns how many tasks run inside it.
    pub async fn ping(&self) -> Result<usize> {
        if !self.is_accepting() {
            return Err(VizError::BackendUnavailable(format!(
                "container of viztrail {} is not running",
                self.viztrail
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.pongs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(tx);
        self.send(&RpcRequest::Ping).await?;
        rx.await.map_err(|_| {
            VizError::BackendUnavailable(format!(
                "container of viztrail {} stopped before answering",
                self.viztrail
            ))
        })
    }
}

async fn read_events(
    viztrail: ViztrailId,
    mut events: mpsc::Receiver<String>,
    pending: Arc<Mutex<HashMap<TaskId, CompletionSender>>>,
    pongs: PongQueue,
    alive: Arc<AtomicBool>,
) {
    while let Some(line) = events.recv().await {
        let event: RpcEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                warn!(viztrail = %viztrail, error = %e, "malformed container event");
                continue;
            }
        };
        match event {
            RpcEvent::Accepted { task_id } => {
                debug!(viztrail = %viztrail, task = %task_id, "container accepted task");
            }
            RpcEvent::Rejected { task_id, message } => {
                let done = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task_id);
                if let Some(done) = done {
                    done.complete(TaskOutcome::error(message));
                }
            }
            RpcEvent::Completed { task_id, outcome } => {
                let done = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task_id);
                match done {
                    Some(done) => done.complete(outcome),
                    None => debug!(viztrail = %viztrail, task = %task_id, "completion for unknown task"),
                }
            }
            RpcEvent::Pong { running } => {
                debug!(viztrail = %viztrail, running, "container pong");
                let waiter = pongs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(running);
                }
            }
            RpcEvent::Stopped => break,
        }
    }
    alive.store(false, Ordering::SeqCst);
    pongs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    // Dropping the remaining senders reports their tasks as lost.
    let lost: Vec<TaskId> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .map(|(id, _)| id)
        .collect();
    if !lost.is_empty() {
        warn!(viztrail = %viztrail, lost = lost.len(), "container stopped with tasks in flight");
    }
    info!(viztrail = %viztrail, "container connection closed");
}

impl ExecutionBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn supports_preemption(&self) -> bool {
        false
    }

    fn is_accepting(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.requests.is_closed()
    }

    fn submit(&self, task: Task, done: CompletionSender) -> BoxFuture<'_, Result<TaskHandle>> {
        Box::pin(async move {
            if !self.is_accepting() {
                return Err(VizError::BackendUnavailable(format!(
                    "container of viztrail {} is not running",
                    self.viztrail
                )));
            }
            let task_id = task.id.clone();
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(task_id.clone(), done);
            if let Err(e) = self.send(&RpcRequest::Submit { task }).await {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task_id);
                return Err(e);
            }
            debug!(viztrail = %self.viztrail, task = %task_id, "forwarded task to container");
            Ok(TaskHandle {
                task_id,
                backend: BackendKind::Container,
            })
        })
    }

    fn cancel(&self, handle: &TaskHandle) -> BoxFuture<'_, ()> {
        let task_id = handle.task_id.clone();
        Box::pin(async move {
            if let Err(e) = self.send(&RpcRequest::Cancel { task_id: task_id.clone() }).await {
                debug!(task = %task_id, error = %e, "cancel not delivered to container");
            }
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.send(&RpcRequest::Shutdown).await.is_err() {
                debug!(viztrail = %self.viztrail, "container already stopped");
            }
            let reader = self
                .reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(reader) = reader {
                let _ = reader.await;
            }
        })
    }
}

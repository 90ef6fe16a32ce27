// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::engine::EngineContext;
use crate::engine::core::{Dispatch, PlanStep, activation, completion, plan_next_step};
use crate::engine::provenance;
use crate::errors::{Result, VizError};
use crate::exec::{
    CompletionReceiver, CompletionSender, ExecutionBackend, Task, TaskHandle, TaskOutcome,
    run_processor,
};
use crate::types::{BranchId, SnapshotId, TaskId, ViztrailId};
use crate::viztrail::{Applied, CommandSpec, Module, ModuleState, Provenance, WorkflowSnapshot};

/// Signals sent to a branch runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSignal {
    /// The head changed or the caller asks to retry; plan again.
    Wake,
    /// Pending modules were canceled; abandon in-flight work and wait.
    Cancel,
    Shutdown,
}

/// What a runner is doing, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Busy,
    Idle,
    /// The backend refused a task. `epoch` counts the wakes the runner had
    /// seen when it parked.
    Parked { epoch: u64 },
}

enum Flow {
    Continue,
    Idle,
    Park,
    /// Abandoned work after a cancel; wait for the next wake.
    Interrupted,
    Stop,
}

/// Drives one branch: plans the next step with [`plan_next_step`],
/// applies it through the repository, and hands modules to the execution
/// backend one at a time.
pub struct BranchRunner {
    ctx: Arc<EngineContext>,
    branch: BranchId,
    viztrail: ViztrailId,
    signals: mpsc::UnboundedReceiver<BranchSignal>,
    status: watch::Sender<RunnerStatus>,
    wakes_seen: u64,
}

impl fmt::Debug for BranchRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchRunner")
            .field("branch", &self.branch)
            .field("viztrail", &self.viztrail)
            .finish_non_exhaustive()
    }
}

impl BranchRunner {
    pub fn new(
        ctx: Arc<EngineContext>,
        branch: BranchId,
        viztrail: ViztrailId,
        signals: mpsc::UnboundedReceiver<BranchSignal>,
        status: watch::Sender<RunnerStatus>,
    ) -> Self {
        Self {
            ctx,
            branch,
            viztrail,
            signals,
            status,
            wakes_seen: 0,
        }
    }

    /// Main loop. Returns when the branch is gone or on shutdown.
    pub async fn run(mut self) {
        info!(branch = %self.branch, "branch runner started");

        loop {
            self.set_status(RunnerStatus::Busy);

            let flow = match self.step().await {
                Ok(flow) => flow,
                Err(VizError::NotFound(e)) => {
                    debug!(branch = %self.branch, error = %e, "branch is gone");
                    Flow::Stop
                }
                Err(e) => {
                    error!(branch = %self.branch, error = %e, "branch runner step failed");
                    Flow::Park
                }
            };

            let waiting = match flow {
                Flow::Continue => continue,
                Flow::Stop => break,
                Flow::Idle | Flow::Interrupted => RunnerStatus::Idle,
                Flow::Park => RunnerStatus::Parked {
                    epoch: self.wakes_seen,
                },
            };
            self.set_status(waiting);
            if !self.wait_for_wake().await {
                break;
            }
        }

        self.set_status(RunnerStatus::Idle);
        info!(branch = %self.branch, "branch runner exiting");
    }

    fn set_status(&self, status: RunnerStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Block until a wake. Returns false on shutdown.
    async fn wait_for_wake(&mut self) -> bool {
        loop {
            match self.signals.recv().await {
                Some(BranchSignal::Wake) => {
                    self.wakes_seen += 1;
                    return true;
                }
                Some(BranchSignal::Cancel) => continue,
                Some(BranchSignal::Shutdown) | None => return false,
            }
        }
    }

    /// Plan against the current head and carry out the result.
    async fn step(&mut self) -> Result<Flow> {
        let branch = self.ctx.repository.branch_cell(&self.branch)?.snapshot();
        if branch.deleted {
            return Ok(Flow::Stop);
        }
        let Some(head) = branch.head().cloned() else {
            return Ok(Flow::Idle);
        };
        let previous = branch.parent_of_head().cloned();
        let context = provenance::resolve_context(&branch.context, self.ctx.datastore.as_ref());
        let registry = Arc::clone(&self.ctx.registry);
        let flags = |c: &CommandSpec| registry.flags(c).unwrap_or_default();

        match plan_next_step(&head, previous.as_deref(), &context, flags, Utc::now()) {
            PlanStep::Idle => {
                debug!(branch = %self.branch, snapshot = %head.id, "nothing left to run");
                Ok(Flow::Idle)
            }
            PlanStep::Publish(_) => {
                // Re-plan under the branch lock so a concurrent cancel wins.
                let applied = self.publish(&head.id, |current| {
                    match plan_next_step(current, previous.as_deref(), &context, flags, Utc::now()) {
                        PlanStep::Publish(updates) => updates,
                        _ => Vec::new(),
                    }
                })?;
                Ok(match applied {
                    Applied::Unchanged(_) => Flow::Idle,
                    _ => Flow::Continue,
                })
            }
            PlanStep::AwaitActive { position, module } => {
                warn!(
                    branch = %self.branch,
                    module = %module.short(),
                    "module is ACTIVE without a running task; marking it failed"
                );
                self.publish(&head.id, |current| {
                    completion(
                        current,
                        position,
                        &module,
                        TaskOutcome::error("execution state was lost"),
                        Provenance::default(),
                        Utc::now(),
                    )
                })?;
                Ok(Flow::Continue)
            }
            PlanStep::Dispatch(dispatch) => self.dispatch(&head, dispatch).await,
        }
    }

    fn publish<F>(&self, snapshot: &SnapshotId, f: F) -> Result<Applied>
    where
        F: FnOnce(&WorkflowSnapshot) -> Vec<(usize, Module)>,
    {
        let applied = self.ctx.repository.apply_transition(&self.branch, snapshot, f)?;
        if let Applied::Published { transitions, .. } = &applied {
            for t in transitions {
                debug!(
                    branch = %self.branch,
                    module = %t.module.short(),
                    position = t.position,
                    from = %t.from,
                    to = %t.to,
                    "module transition"
                );
            }
            self.ctx.broadcast(transitions);
        }
        Ok(applied)
    }

    fn still_active(&self, snapshot: &SnapshotId, dispatch: &Dispatch) -> bool {
        match self.ctx.repository.get_head(&self.branch) {
            Ok(Some(head)) if &head.id == snapshot => head
                .modules
                .get(dispatch.position)
                .map(|m| m.id == dispatch.module && m.state == ModuleState::Active)
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn dispatch(&mut self, head: &WorkflowSnapshot, dispatch: Dispatch) -> Result<Flow> {
        let task = Task {
            id: TaskId::generate(),
            viztrail: self.viztrail.clone(),
            branch: self.branch.clone(),
            module: dispatch.module.clone(),
            command: dispatch.command.clone(),
            context: dispatch.available.clone(),
            resources: dispatch.resources.clone(),
        };
        info!(
            branch = %self.branch,
            module = %dispatch.module.short(),
            position = dispatch.position,
            command = %dispatch.command,
            reason = %dispatch.reason,
            "running module"
        );

        if dispatch.synchronous {
            return self.run_inline(head, dispatch, task).await;
        }

        let backend = self.ctx.backend_for(&self.viztrail)?;
        let (done, rx) = CompletionSender::channel(task.id.clone());
        let handle = match backend.submit(task, done).await {
            Ok(handle) => handle,
            Err(e) if e.is_retryable() => {
                warn!(
                    branch = %self.branch,
                    backend = %backend.kind(),
                    error = %e,
                    "backend refused task; branch parked until resumed"
                );
                return Ok(Flow::Park);
            }
            Err(e) => return Err(e),
        };

        let activated = self.publish(&head.id, |current| {
            activation(current, dispatch.position, &dispatch.module, Utc::now())
        })?;
        if !matches!(activated, Applied::Published { .. }) {
            debug!(branch = %self.branch, task = %handle.task_id, "module changed during submit");
            abandon(backend, handle, rx).await;
            return Ok(Flow::Continue);
        }

        self.await_completion(&head.id, dispatch, backend, handle, rx).await
    }

    async fn await_completion(
        &mut self,
        snapshot: &SnapshotId,
        dispatch: Dispatch,
        backend: Arc<dyn ExecutionBackend>,
        handle: TaskHandle,
        mut rx: CompletionReceiver,
    ) -> Result<Flow> {
        loop {
            tokio::select! {
                outcome = &mut rx => {
                    let outcome = outcome
                        .unwrap_or_else(|_| TaskOutcome::error("execution backend dropped the task"));
                    self.complete(snapshot, &dispatch, outcome)?;
                    return Ok(Flow::Continue);
                }
                signal = self.signals.recv() => {
                    let signal = signal.unwrap_or(BranchSignal::Shutdown);
                    if signal == BranchSignal::Wake {
                        self.wakes_seen += 1;
                    }
                    if signal == BranchSignal::Shutdown {
                        backend.cancel(&handle).await;
                        return Ok(Flow::Stop);
                    }
                    if self.still_active(snapshot, &dispatch) {
                        continue;
                    }
                    info!(
                        branch = %self.branch,
                        module = %dispatch.module.short(),
                        task = %handle.task_id,
                        "module no longer current; canceling its task"
                    );
                    abandon(backend, handle, rx).await;
                    return Ok(match signal {
                        BranchSignal::Cancel => Flow::Interrupted,
                        _ => Flow::Continue,
                    });
                }
            }
        }
    }

    /// Synchronous commands run in the controller itself.
    async fn run_inline(&mut self, head: &WorkflowSnapshot, dispatch: Dispatch, task: Task) -> Result<Flow> {
        let activated = self.publish(&head.id, |current| {
            activation(current, dispatch.position, &dispatch.module, Utc::now())
        })?;
        if !matches!(activated, Applied::Published { .. }) {
            return Ok(Flow::Continue);
        }

        let registry = Arc::clone(&self.ctx.registry);
        let datastore = Arc::clone(&self.ctx.datastore);
        let run = run_processor(&registry, datastore, task);
        tokio::pin!(run);

        loop {
            tokio::select! {
                outcome = &mut run => {
                    self.complete(&head.id, &dispatch, outcome)?;
                    return Ok(Flow::Continue);
                }
                signal = self.signals.recv() => {
                    let signal = signal.unwrap_or(BranchSignal::Shutdown);
                    match signal {
                        BranchSignal::Shutdown => return Ok(Flow::Stop),
                        BranchSignal::Wake => self.wakes_seen += 1,
                        BranchSignal::Cancel => {}
                    }
                    if self.still_active(&head.id, &dispatch) {
                        continue;
                    }
                    debug!(branch = %self.branch, module = %dispatch.module.short(), "dropping inline run");
                    return Ok(match signal {
                        BranchSignal::Cancel => Flow::Interrupted,
                        _ => Flow::Continue,
                    });
                }
            }
        }
    }

    /// Writes are only recorded in the datastore once the outcome is known to
    /// land on a module that is still running in the current head.
    fn complete(&self, snapshot: &SnapshotId, dispatch: &Dispatch, outcome: TaskOutcome) -> Result<()> {
        if let TaskOutcome::Error { message, .. } = &outcome {
            warn!(branch = %self.branch, module = %dispatch.module.short(), %message, "module failed");
        }
        let datastore = self.ctx.datastore.as_ref();
        let applied = self.publish(snapshot, |current| {
            let running = current
                .modules
                .get(dispatch.position)
                .is_some_and(|m| m.id == dispatch.module && m.state == ModuleState::Active);
            if !running {
                return Vec::new();
            }
            let provenance = match &outcome {
                TaskOutcome::Success(result) => {
                    provenance::stamp_provenance(result, &dispatch.available, datastore)
                }
                _ => Provenance::default(),
            };
            completion(current, dispatch.position, &dispatch.module, outcome, provenance, Utc::now())
        })?;
        if matches!(applied, Applied::Stale) {
            debug!(branch = %self.branch, module = %dispatch.module.short(), "outcome arrived after the module moved on");
        }
        Ok(())
    }
}

/// Cancel a task whose result is no longer wanted and discard its outcome.
async fn abandon(backend: Arc<dyn ExecutionBackend>, handle: TaskHandle, rx: CompletionReceiver) {
    backend.cancel(&handle).await;
    let task_id = handle.task_id;
    tokio::spawn(async move {
        if let Ok(outcome) = rx.await {
            debug!(task = %task_id, outcome = outcome.label(), "discarded outcome of abandoned task");
        }
    });
}

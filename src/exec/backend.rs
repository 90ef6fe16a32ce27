// src/exec/backend.rs

//! Pluggable execution backend abstraction.
//!
//! The task controller talks to an `ExecutionBackend` instead of running
//! commands itself. Every backend honours the same contract:
//!
//! - `submit` only queues the task and returns quickly.
//! - The `CompletionSender` handed to `submit` is consumed exactly once with
//!   the task's outcome. Dropping it unsent is observed by the controller as
//!   an ERROR, so a task can never be lost silently.
//! - `cancel` is best effort; the outcome still arrives (CANCELED, or the
//!   result that was already in flight).

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::Result;
use crate::exec::BoxFuture;
use crate::exec::processor::ProcessorResult;
use crate::types::{BackendKind, BranchId, ContextResources, ModuleId, TaskId, ViztrailId};
use crate::viztrail::{CarryOver, CommandSpec, ModuleOutputs};

/// One backend invocation for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub viztrail: ViztrailId,
    pub branch: BranchId,
    pub module: ModuleId,
    pub command: CommandSpec,
    pub context: ContextResources,
    #[serde(default)]
    pub resources: CarryOver,
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    Success(ProcessorResult),
    Error {
        message: String,
        #[serde(default)]
        outputs: ModuleOutputs,
    },
    Canceled,
}

impl TaskOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        TaskOutcome::Error {
            message: message.into(),
            outputs: ModuleOutputs::default(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Success(_) => "success",
            TaskOutcome::Error { .. } => "error",
            TaskOutcome::Canceled => "canceled",
        }
    }
}

/// Identifies a submitted task to the backend that accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub backend: BackendKind,
}

/// Receiving half of a task's completion channel.
pub type CompletionReceiver = oneshot::Receiver<TaskOutcome>;

/// Sending half of a task's completion channel. Consumed by value, so an
/// outcome is delivered at most once.
#[derive(Debug)]
pub struct CompletionSender {
    task_id: TaskId,
    tx: oneshot::Sender<TaskOutcome>,
}

impl CompletionSender {
    pub fn channel(task_id: TaskId) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { task_id, tx }, rx)
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Deliver the outcome. A receiver that is gone (the controller no
    /// longer waits for this task) is not an error.
    pub fn complete(self, outcome: TaskOutcome) {
        let label = outcome.label();
        if self.tx.send(outcome).is_err() {
            debug!(task = %self.task_id, outcome = label, "completion receiver already dropped");
        }
    }

    /// Whether nobody waits for this outcome anymore.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Trait abstracting how module commands are executed.
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether in-flight work may be canceled implicitly when the branch head
    /// is edited.
    fn supports_preemption(&self) -> bool;

    /// Whether `submit` would currently accept a task.
    fn is_accepting(&self) -> bool;

    /// Queue `task`; `done` receives its outcome. Fails with
    /// `BackendUnavailable` without consuming any work when the backend
    /// cannot accept tasks.
    fn submit(&self, task: Task, done: CompletionSender) -> BoxFuture<'_, Result<TaskHandle>>;

    fn cancel(&self, handle: &TaskHandle) -> BoxFuture<'_, ()>;

    /// Stop accepting tasks and cancel everything in flight.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

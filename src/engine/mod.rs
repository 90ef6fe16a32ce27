// src/engine/mod.rs

//! Workflow engine.
//!
//! This module ties together:
//! - the viztrail repository (projects, branches, snapshot history)
//! - the command registry and the execution backends
//! - one [`runtime::BranchRunner`] per branch with pending work, which
//!   executes the modules of the branch head strictly in order
//!
//! The pure planning rules live in [`core`] and [`provenance`]; the async/IO
//! shell is implemented in [`runtime`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::datastore::{self, Datastore};
use crate::errors::{Result, VizError};
use crate::exec::{BackendFactory, CommandRegistry, ExecutionBackend};
use crate::types::{BackendKind, BranchId, ModuleId, ResourceId, ViztrailId};
use crate::viztrail::{
    Branch, EditOperation, Module, ModuleTransition, Viztrail, ViztrailRepository, WorkflowSnapshot,
};

pub mod core;
pub mod provenance;
pub mod runtime;

pub use self::core::{Dispatch, PlanStep, plan_next_step};
pub use provenance::{ReuseDecision, RunReason};
pub use runtime::{BranchRunner, BranchSignal, RunnerStatus};

/// Capacity of the module transition broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Shared state of an engine, handed to every branch runner.
pub struct EngineContext {
    pub config: Arc<ConfigFile>,
    pub repository: Arc<ViztrailRepository>,
    pub registry: Arc<CommandRegistry>,
    pub datastore: Arc<dyn Datastore>,
    pub backends: BackendFactory,
    pub events: broadcast::Sender<ModuleTransition>,
}

impl EngineContext {
    pub fn new(
        config: Arc<ConfigFile>,
        repository: Arc<ViztrailRepository>,
        registry: Arc<CommandRegistry>,
        datastore: Arc<dyn Datastore>,
    ) -> Self {
        let backends = BackendFactory::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&datastore),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            repository,
            registry,
            datastore,
            backends,
            events,
        }
    }

    /// Backend a viztrail runs on: its own choice, or the configured default.
    pub fn backend_for(&self, viztrail: &ViztrailId) -> Result<Arc<dyn ExecutionBackend>> {
        let kind = self
            .repository
            .backend_of(viztrail)?
            .unwrap_or(self.config.engine.backend);
        Ok(self.backends.create(kind, viztrail))
    }

    /// Publish transitions to subscribers. Having none is fine.
    pub fn broadcast(&self, transitions: &[ModuleTransition]) {
        for t in transitions {
            let _ = self.events.send(t.clone());
        }
    }
}

struct RunnerHandle {
    signals: mpsc::UnboundedSender<BranchSignal>,
    status: watch::Receiver<RunnerStatus>,
    wakes_sent: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

/// Owns the branch runners. A runner is spawned on the first wake of a
/// branch and lives until the branch is deleted or the engine shuts down.
struct TaskController {
    ctx: Arc<EngineContext>,
    runners: Mutex<HashMap<BranchId, RunnerHandle>>,
}

impl TaskController {
    fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            runners: Mutex::new(HashMap::new()),
        }
    }

    fn wake(&self, branch: &BranchId) {
        let mut runners = self.runners.lock().unwrap_or_else(PoisonError::into_inner);
        let alive = runners
            .get(branch)
            .map(|h| !h.signals.is_closed())
            .unwrap_or(false);
        if !alive {
            let viztrail = match self.ctx.repository.viztrail_of(branch) {
                Ok(v) => v,
                Err(e) => {
                    debug!(branch = %branch, error = %e, "not waking unknown branch");
                    return;
                }
            };
            runners.insert(branch.clone(), self.spawn(branch.clone(), viztrail));
        }
        if let Some(handle) = runners.get(branch) {
            handle.wakes_sent.fetch_add(1, Ordering::SeqCst);
            let _ = handle.signals.send(BranchSignal::Wake);
        }
    }

    fn spawn(&self, branch: BranchId, viztrail: ViztrailId) -> RunnerHandle {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(RunnerStatus::Busy);
        let runner = BranchRunner::new(
            Arc::clone(&self.ctx),
            branch,
            viztrail,
            signal_rx,
            status_tx,
        );
        RunnerHandle {
            signals,
            status,
            wakes_sent: Arc::new(AtomicU64::new(0)),
            join: tokio::spawn(runner.run()),
        }
    }

    /// Tell a running runner to abandon work that is no longer current.
    fn interrupt(&self, branch: &BranchId) {
        let runners = self.runners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = runners.get(branch) {
            let _ = handle.signals.send(BranchSignal::Cancel);
        }
    }

    fn status(&self, branch: &BranchId) -> Option<(watch::Receiver<RunnerStatus>, Arc<AtomicU64>)> {
        let runners = self.runners.lock().unwrap_or_else(PoisonError::into_inner);
        runners
            .get(branch)
            .filter(|h| !h.signals.is_closed())
            .map(|h| (h.status.clone(), Arc::clone(&h.wakes_sent)))
    }

    async fn stop(&self, branch: &BranchId) {
        let handle = self
            .runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(branch);
        if let Some(handle) = handle {
            let _ = handle.signals.send(BranchSignal::Shutdown);
            let _ = handle.join.await;
        }
    }

    async fn shutdown(&self) {
        let handles: Vec<(BranchId, RunnerHandle)> = self
            .runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in handles.iter() {
            let _ = handle.signals.send(BranchSignal::Shutdown);
        }
        for (branch, handle) in handles {
            if let Err(e) = handle.join.await {
                warn!(branch = %branch, error = %e, "branch runner ended abnormally");
            }
        }
    }
}

/// The workflow engine: repository operations plus execution of the
/// resulting snapshots.
pub struct Engine {
    ctx: Arc<EngineContext>,
    controller: TaskController,
}

impl Engine {
    /// Build an engine from configuration. Restored branches with pending
    /// modules resume immediately. Must be called inside a Tokio runtime.
    pub fn init(config: ConfigFile) -> Result<Self> {
        let config = Arc::new(config);
        let repository = Arc::new(ViztrailRepository::from_config(&config.repository)?);
        let registry = Arc::new(CommandRegistry::from_config(&config));
        let datastore = datastore::from_config(&config.datastore);
        Ok(Self::start(EngineContext::new(
            config, repository, registry, datastore,
        )))
    }

    /// Start an engine on pre-built parts.
    pub fn start(ctx: EngineContext) -> Self {
        let ctx = Arc::new(ctx);
        let controller = TaskController::new(Arc::clone(&ctx));
        let pending = ctx.repository.pending_branches();
        info!(
            viztrails = ctx.repository.list_viztrails().len(),
            resumed = pending.len(),
            backend = %ctx.config.engine.backend,
            "workflow engine started"
        );
        for branch in pending.iter() {
            controller.wake(branch);
        }
        Self { ctx, controller }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn repository(&self) -> &ViztrailRepository {
        &self.ctx.repository
    }

    /// Stream of module state changes across all branches.
    pub fn subscribe(&self) -> broadcast::Receiver<ModuleTransition> {
        self.ctx.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Viztrails and branches
    // ---------------------------------------------------------------------

    pub fn create_viztrail(
        &self,
        name: &str,
        properties: BTreeMap<String, String>,
        backend: Option<BackendKind>,
    ) -> Result<Viztrail> {
        self.ctx.repository.create_viztrail(name, properties, backend)
    }

    /// Delete a project, stop its runners and release its container.
    pub async fn delete_viztrail(&self, id: &ViztrailId) -> Result<()> {
        let branches = self.ctx.repository.list_branches(id)?;
        self.ctx.repository.delete_viztrail(id)?;
        for branch in branches.iter() {
            self.controller.stop(&branch.id).await;
        }
        self.ctx.backends.release(id).await;
        Ok(())
    }

    /// Create a branch, optionally forked from the head of another branch.
    /// Copied pending modules start running right away.
    pub fn create_branch(
        &self,
        viztrail: &ViztrailId,
        name: &str,
        source: Option<(&BranchId, Option<&ModuleId>)>,
    ) -> Result<Branch> {
        let branch = self.ctx.repository.create_branch(viztrail, name, source)?;
        if branch.head().map(|h| h.is_active()).unwrap_or(false) {
            self.controller.wake(&branch.id);
        }
        Ok(branch)
    }

    pub async fn delete_branch(&self, viztrail: &ViztrailId, id: &BranchId) -> Result<()> {
        self.ctx.repository.delete_branch(viztrail, id)?;
        self.controller.stop(id).await;
        Ok(())
    }

    pub fn set_context_resources(&self, branch: &BranchId, resources: BTreeSet<ResourceId>) -> Result<()> {
        self.ctx.repository.set_context_resources(branch, resources)
    }

    // ---------------------------------------------------------------------
    // Workflow edits and execution
    // ---------------------------------------------------------------------

    /// Apply an edit to the branch head and start executing the new
    /// snapshot.
    ///
    /// Fails with `NotFound` for unknown commands, `ConcurrentModification`
    /// when a module is ACTIVE on a backend that cannot preempt it, and
    /// `BackendUnavailable` when the backend does not accept work. In the
    /// last case the snapshot is published but stays SCHEDULED until
    /// [`Engine::resume_branch`] succeeds.
    pub fn edit_branch(&self, branch: &BranchId, op: EditOperation) -> Result<Arc<WorkflowSnapshot>> {
        if let Some(command) = op.command() {
            self.ctx.registry.flags(command)?;
        }
        let viztrail = self.ctx.repository.viztrail_of(branch)?;
        let backend = self.ctx.backend_for(&viztrail)?;
        let outcome = self
            .ctx
            .repository
            .edit_branch(branch, op, backend.supports_preemption())?;
        self.ctx.broadcast(&outcome.preempted);

        if !backend.is_accepting() {
            self.controller.interrupt(branch);
            warn!(branch = %branch, backend = %backend.kind(), "backend is not accepting tasks");
            return Err(VizError::BackendUnavailable(format!(
                "{} backend is not accepting tasks",
                backend.kind()
            )));
        }
        self.controller.wake(branch);
        Ok(outcome.snapshot)
    }

    /// Cancel every pending module of the branch head. Idempotent.
    pub fn cancel_branch(&self, branch: &BranchId) -> Result<Vec<ModuleTransition>> {
        let transitions = self.ctx.repository.cancel_branch(branch)?;
        self.ctx.broadcast(&transitions);
        self.controller.interrupt(branch);
        Ok(transitions)
    }

    /// Retry a branch parked because its backend refused work.
    pub fn resume_branch(&self, branch: &BranchId) -> Result<()> {
        let viztrail = self.ctx.repository.viztrail_of(branch)?;
        let backend = self.ctx.backend_for(&viztrail)?;
        if !backend.is_accepting() {
            return Err(VizError::BackendUnavailable(format!(
                "{} backend is not accepting tasks",
                backend.kind()
            )));
        }
        self.controller.wake(branch);
        Ok(())
    }

    pub fn get_head(&self, branch: &BranchId) -> Result<Option<Arc<WorkflowSnapshot>>> {
        self.ctx.repository.get_head(branch)
    }

    /// Current state of a module of the branch head.
    pub fn get_module_state(&self, branch: &BranchId, module: &ModuleId) -> Result<Arc<Module>> {
        self.ctx.repository.get_module(branch, module)
    }

    /// Wait until the branch head has no pending module and return it.
    ///
    /// Fails with `BackendUnavailable` when the branch is parked.
    pub async fn wait_idle(&self, branch: &BranchId) -> Result<Option<Arc<WorkflowSnapshot>>> {
        let mut events = self.ctx.events.subscribe();
        let mut nudged = false;
        loop {
            let status = self.controller.status(branch);
            let mut status_rx = status.as_ref().map(|(rx, _)| rx.clone());
            let current = status_rx.as_mut().map(|rx| *rx.borrow_and_update());

            let head = self.ctx.repository.get_head(branch)?;
            match head.as_ref() {
                None => return Ok(None),
                Some(h) if !h.is_active() => return Ok(head),
                Some(_) => {}
            }

            let Some(mut status_rx) = status_rx else {
                self.controller.wake(branch);
                continue;
            };
            if let (Some(RunnerStatus::Parked { epoch }), Some((_, sent))) = (current, status.as_ref()) {
                if epoch == sent.load(Ordering::SeqCst) {
                    return Err(VizError::BackendUnavailable(format!(
                        "branch {branch} is parked until its backend accepts work"
                    )));
                }
            }
            // An idle runner under a pending head was interrupted without a
            // wake (e.g. an edit refused by the backend); make it plan again.
            if current == Some(RunnerStatus::Idle) && !nudged {
                nudged = true;
                self.controller.wake(branch);
            }

            tokio::select! {
                _ = events.recv() => {}
                _ = status_rx.changed() => {}
            }
        }
    }

    /// Stop every runner and backend. In-flight modules stay ACTIVE and are
    /// re-issued when a persistent repository is loaded again.
    pub async fn teardown(self) {
        self.controller.shutdown().await;
        self.ctx.backends.shutdown_all().await;
        info!("workflow engine stopped");
    }
}

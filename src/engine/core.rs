// src/engine/core.rs

//! Pure core of the branch controller.
//!
//! Given the current head of a branch, its predecessor in history and the
//! resolved context resources, [`plan_next_step`] decides what the IO shell
//! (`engine::runtime::BranchRunner`) should do next:
//! - publish module updates that need no execution (reuse, fail-fast skips,
//!   cancel propagation)
//! - dispatch the first scheduled module
//! - wait, or go idle
//!
//! Nothing here touches Tokio, channels, backends, or the datastore, so the
//! planning rules are unit tested directly.

use chrono::{DateTime, Utc};

use crate::engine::provenance::{self, ReuseDecision, RunReason};
use crate::exec::{CommandFlags, TaskOutcome};
use crate::types::{ModuleId, ResourceSet};
use crate::viztrail::{CarryOver, CommandSpec, Module, ModuleState, Provenance, WorkflowSnapshot};

/// Next action for a branch.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    /// No pending module left in the head.
    Idle,
    /// The first pending module is already ACTIVE.
    AwaitActive { position: usize, module: ModuleId },
    /// Swap these modules into the head without running anything.
    Publish(Vec<(usize, Module)>),
    /// Execute the module.
    Dispatch(Dispatch),
}

/// A module that has to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub position: usize,
    pub module: ModuleId,
    pub command: CommandSpec,
    pub resources: CarryOver,
    /// Resources visible to the module, handed to the task as its context.
    pub available: ResourceSet,
    /// Run inline in the controller instead of on the backend.
    pub synchronous: bool,
    pub reason: RunReason,
}

/// Decide the next action for `head`.
///
/// `previous` is the snapshot preceding `head` in the branch history and is
/// where reuse counterparts are looked up (by module id). `flags` returns
/// the operator flags of a command.
pub fn plan_next_step<F>(
    head: &WorkflowSnapshot,
    previous: Option<&WorkflowSnapshot>,
    context: &ResourceSet,
    flags: F,
    now: DateTime<Utc>,
) -> PlanStep
where
    F: Fn(&CommandSpec) -> CommandFlags,
{
    let Some((position, module)) = head.first_non_terminal() else {
        return PlanStep::Idle;
    };
    if module.state == ModuleState::Active {
        return PlanStep::AwaitActive {
            position,
            module: module.id.clone(),
        };
    }

    // Everything before `position` is terminal. An upstream failure or
    // cancellation stops the rest of the workflow.
    if let Some(stopped) = head.modules[..position].iter().find(|m| m.state.is_stopped()) {
        let skip = stopped.state == ModuleState::Error;
        let updates = head
            .modules
            .iter()
            .enumerate()
            .skip(position)
            .filter_map(|(pos, m)| {
                let next = if skip { m.skipped(now) } else { m.canceled(now) };
                next.map(|n| (pos, n))
            })
            .collect();
        return PlanStep::Publish(updates);
    }

    let available = provenance::available_at(head, position, context);
    let command_flags = flags(&module.command);
    let counterpart = previous.and_then(|p| p.module(&module.id)).map(|m| m.as_ref());

    let reason = match provenance::decide(counterpart, module, &available, command_flags) {
        ReuseDecision::Reuse(prior) => match module.reused_from(&prior) {
            Some(reused) => return PlanStep::Publish(vec![(position, reused)]),
            None => RunReason::NotSuccessful,
        },
        ReuseDecision::Run(reason) => reason,
    };

    PlanStep::Dispatch(Dispatch {
        position,
        module: module.id.clone(),
        command: module.command.clone(),
        resources: module.resources.clone(),
        available,
        synchronous: command_flags.synchronous,
        reason,
    })
}

/// Updates that move the module at `position` to ACTIVE, if it is still the
/// scheduled module `id`.
pub fn activation(
    head: &WorkflowSnapshot,
    position: usize,
    id: &ModuleId,
    now: DateTime<Utc>,
) -> Vec<(usize, Module)> {
    head.modules
        .get(position)
        .filter(|m| &m.id == id)
        .and_then(|m| m.activated(now))
        .map(|m| vec![(position, m)])
        .unwrap_or_default()
}

/// Updates that apply a task outcome to the ACTIVE module `id`.
///
/// `provenance` carries the stamped read/write versions of a successful
/// outcome. Nothing changes if the module is no longer ACTIVE, which is how
/// results of canceled or preempted work are dropped.
pub fn completion(
    head: &WorkflowSnapshot,
    position: usize,
    id: &ModuleId,
    outcome: TaskOutcome,
    provenance: Provenance,
    now: DateTime<Utc>,
) -> Vec<(usize, Module)> {
    let Some(module) = head.modules.get(position).filter(|m| &m.id == id) else {
        return Vec::new();
    };
    let next = match outcome {
        TaskOutcome::Success(result) => {
            module.succeeded(result.outputs, provenance, result.resources, now)
        }
        TaskOutcome::Error { message, outputs } => module.failed(&message, outputs, now),
        TaskOutcome::Canceled => module.canceled(now),
    };
    next.map(|m| vec![(position, m)]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ProcessorResult;
    use crate::types::{BranchId, ResourceId, VersionToken};
    use crate::viztrail::{Action, ModuleOutputs, OutputObject};
    use serde_json::json;
    use std::sync::Arc;

    fn cmd(name: &str) -> CommandSpec {
        CommandSpec::new("shell", "run", json!({ "cmd": name }))
    }

    fn snapshot(modules: Vec<Module>) -> WorkflowSnapshot {
        WorkflowSnapshot::new(
            BranchId::from("b"),
            Action::Append,
            None,
            modules.into_iter().map(Arc::new).collect(),
            Utc::now(),
        )
    }

    fn success(module: Module, writes: &[(&str, &str)]) -> Module {
        let t = Utc::now();
        let write = writes
            .iter()
            .map(|(r, v)| (ResourceId::from(*r), VersionToken::from(*v)))
            .collect();
        module
            .activated(t)
            .and_then(|m| {
                m.succeeded(
                    ModuleOutputs::new().with_stdout(OutputObject::text("ok")),
                    Provenance { read: ResourceSet::new(), write },
                    CarryOver::new(),
                    t,
                )
            })
            .unwrap()
    }

    fn no_flags(_: &CommandSpec) -> CommandFlags {
        CommandFlags::default()
    }

    #[test]
    fn idle_when_everything_is_terminal() {
        let head = snapshot(vec![success(Module::scheduled(cmd("a"), Utc::now()), &[])]);
        assert_eq!(
            plan_next_step(&head, None, &ResourceSet::new(), no_flags, Utc::now()),
            PlanStep::Idle
        );
        assert_eq!(
            plan_next_step(&snapshot(vec![]), None, &ResourceSet::new(), no_flags, Utc::now()),
            PlanStep::Idle
        );
    }

    #[test]
    fn dispatches_first_scheduled_module_with_upstream_resources() {
        let a = success(Module::scheduled(cmd("a"), Utc::now()), &[("people", "v1")]);
        let b = Module::scheduled(cmd("b"), Utc::now());
        let c = Module::scheduled(cmd("c"), Utc::now());
        let head = snapshot(vec![a, b.clone(), c]);

        let context: ResourceSet = [(ResourceId::from("extra"), VersionToken::from("v3"))]
            .into_iter()
            .collect();
        match plan_next_step(&head, None, &context, no_flags, Utc::now()) {
            PlanStep::Dispatch(d) => {
                assert_eq!(d.position, 1);
                assert_eq!(d.module, b.id);
                assert_eq!(d.reason, RunReason::NoCounterpart);
                assert_eq!(d.available.len(), 2);
                assert_eq!(
                    d.available.get(&ResourceId::from("people")),
                    Some(&VersionToken::from("v1"))
                );
                assert!(!d.synchronous);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn waits_for_active_module() {
        let a = Module::scheduled(cmd("a"), Utc::now()).activated(Utc::now()).unwrap();
        let id = a.id.clone();
        let head = snapshot(vec![a, Module::scheduled(cmd("b"), Utc::now())]);
        assert_eq!(
            plan_next_step(&head, None, &ResourceSet::new(), no_flags, Utc::now()),
            PlanStep::AwaitActive { position: 0, module: id }
        );
    }

    #[test]
    fn error_skips_and_cancel_propagates_downstream() {
        let failed = Module::scheduled(cmd("a"), Utc::now())
            .activated(Utc::now())
            .and_then(|m| m.failed("boom", ModuleOutputs::new(), Utc::now()))
            .unwrap();
        let head = snapshot(vec![
            failed,
            Module::scheduled(cmd("b"), Utc::now()),
            Module::scheduled(cmd("c"), Utc::now()),
        ]);
        let PlanStep::Publish(updates) =
            plan_next_step(&head, None, &ResourceSet::new(), no_flags, Utc::now())
        else {
            panic!("expected publish");
        };
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|(_, m)| m.is_skipped()));

        let canceled = Module::scheduled(cmd("a"), Utc::now()).canceled(Utc::now()).unwrap();
        let head = snapshot(vec![canceled, Module::scheduled(cmd("b"), Utc::now())]);
        let PlanStep::Publish(updates) =
            plan_next_step(&head, None, &ResourceSet::new(), no_flags, Utc::now())
        else {
            panic!("expected publish");
        };
        assert_eq!(updates[0].1.state, ModuleState::Canceled);
    }

    #[test]
    fn unchanged_counterpart_is_reused() {
        let a = success(Module::scheduled(cmd("a"), Utc::now()), &[("people", "v1")]);
        let previous = snapshot(vec![a.clone()]);
        let head = snapshot(vec![a.rescheduled(Utc::now())]);

        let PlanStep::Publish(updates) =
            plan_next_step(&head, Some(&previous), &ResourceSet::new(), no_flags, Utc::now())
        else {
            panic!("expected reuse");
        };
        let (pos, reused) = &updates[0];
        assert_eq!(*pos, 0);
        assert_eq!(reused.state, ModuleState::Success);
        assert_eq!(reused.timestamps.finished_at, a.timestamps.finished_at);
    }

    #[test]
    fn synchronous_flag_forces_inline_run() {
        let a = success(Module::scheduled(cmd("a"), Utc::now()), &[]);
        let previous = snapshot(vec![a.clone()]);
        let head = snapshot(vec![a.rescheduled(Utc::now())]);
        let sync = |_: &CommandSpec| CommandFlags { synchronous: true, no_cache: false };
        match plan_next_step(&head, Some(&previous), &ResourceSet::new(), sync, Utc::now()) {
            PlanStep::Dispatch(d) => {
                assert!(d.synchronous);
                assert_eq!(d.reason, RunReason::AlwaysRun);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn completion_only_applies_to_active_module() {
        let scheduled = Module::scheduled(cmd("a"), Utc::now());
        let id = scheduled.id.clone();
        let head = snapshot(vec![scheduled.clone()]);
        let outcome = TaskOutcome::Success(ProcessorResult::default());
        assert!(completion(&head, 0, &id, outcome.clone(), Provenance::default(), Utc::now()).is_empty());

        let head = snapshot(vec![scheduled.activated(Utc::now()).unwrap()]);
        let updates = completion(&head, 0, &id, outcome, Provenance::default(), Utc::now());
        assert_eq!(updates[0].1.state, ModuleState::Success);

        let other = ModuleId::from("someone-else");
        assert!(activation(&head, 0, &other, Utc::now()).is_empty());
    }
}

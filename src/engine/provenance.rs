// src/engine/provenance.rs

//! Provenance-based reuse decisions.
//!
//! A scheduled module may copy the result of its counterpart in the previous
//! snapshot instead of running, provided the counterpart ran the identical
//! command successfully and every resource it read still resolves to the
//! version it read back then.

use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::datastore::Datastore;
use crate::exec::{CommandFlags, ProcessorResult};
use crate::types::{ResourceId, ResourceSet};
use crate::viztrail::{Module, ModuleState, Provenance, WorkflowSnapshot};

/// Why a module has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    /// No module with the same identity in the previous snapshot.
    NoCounterpart,
    CommandChanged,
    /// The counterpart did not end in SUCCESS.
    NotSuccessful,
    /// Synchronous or no-cache command, or materialization requested.
    AlwaysRun,
    InputChanged(ResourceId),
    InputMissing(ResourceId),
    /// The module overwrites a resource it did not read that now exists
    /// upstream.
    WritesExistingResource(ResourceId),
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::NoCounterpart => f.write_str("no previous execution"),
            RunReason::CommandChanged => f.write_str("command changed"),
            RunReason::NotSuccessful => f.write_str("previous execution did not succeed"),
            RunReason::AlwaysRun => f.write_str("command is never reused"),
            RunReason::InputChanged(r) => write!(f, "input '{r}' changed"),
            RunReason::InputMissing(r) => write!(f, "input '{r}' is missing"),
            RunReason::WritesExistingResource(r) => {
                write!(f, "overwrites existing resource '{r}' without reading it")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReuseDecision {
    /// Copy the given prior module.
    Reuse(Module),
    Run(RunReason),
}

/// Resolve the externally supplied context resources of a branch.
pub fn resolve_context(ids: &BTreeSet<ResourceId>, datastore: &dyn Datastore) -> ResourceSet {
    ids.iter()
        .filter_map(|id| datastore.current_version(id).map(|v| (id.clone(), v)))
        .collect()
}

/// Resources visible to the module at `position`: the branch context,
/// overridden by the writes of the preceding modules in program order.
pub fn available_at(snapshot: &WorkflowSnapshot, position: usize, context: &ResourceSet) -> ResourceSet {
    let mut available = context.clone();
    available.extend_from(&snapshot.resources_before(position));
    available
}

/// Decide whether `module` can reuse `counterpart`.
pub fn decide(
    counterpart: Option<&Module>,
    module: &Module,
    available: &ResourceSet,
    flags: CommandFlags,
) -> ReuseDecision {
    if flags.synchronous || flags.no_cache || module.command.requests_materialization() {
        return ReuseDecision::Run(RunReason::AlwaysRun);
    }
    let Some(prior) = counterpart else {
        return ReuseDecision::Run(RunReason::NoCounterpart);
    };
    if prior.command != module.command {
        return ReuseDecision::Run(RunReason::CommandChanged);
    }
    let provenance = match (&prior.state, &prior.provenance) {
        (ModuleState::Success, Some(p)) => p,
        _ => return ReuseDecision::Run(RunReason::NotSuccessful),
    };

    for id in provenance.write.ids() {
        if !provenance.read.contains(id) && available.contains(id) {
            return ReuseDecision::Run(RunReason::WritesExistingResource(id.clone()));
        }
    }
    for (id, version) in provenance.read.iter() {
        match available.get(id) {
            None => return ReuseDecision::Run(RunReason::InputMissing(id.clone())),
            Some(current) if current != version => {
                return ReuseDecision::Run(RunReason::InputChanged(id.clone()));
            }
            Some(_) => {}
        }
    }
    ReuseDecision::Reuse(prior.clone())
}

/// Stamp the resource ids a processor declared with versions: reads with
/// the version visible at dispatch, writes with the version the datastore
/// records for them.
pub fn stamp_provenance(
    result: &ProcessorResult,
    available: &ResourceSet,
    datastore: &dyn Datastore,
) -> Provenance {
    let mut read = ResourceSet::new();
    for id in result.reads.iter() {
        let version = available
            .get(id)
            .cloned()
            .or_else(|| datastore.current_version(id));
        match version {
            Some(v) => read.insert(id.clone(), v),
            None => debug!(resource = %id, "declared read of a missing resource"),
        }
    }
    let mut write = ResourceSet::new();
    for id in result.writes.iter() {
        write.insert(id.clone(), datastore.record_write(id));
    }
    Provenance { read, write }
}

// src/viztrail/mod.rs

//! Branch/version data model and the repository that owns it.
//!
//! - `module`: module values and their state transitions.
//! - `snapshot`: immutable workflow snapshots.
//! - `branch` / `project`: branches and viztrails.
//! - `repository`: edits, cancellation and head transitions.
//! - `store`: JSON persistence.

pub mod branch;
pub mod module;
pub mod project;
pub mod repository;
pub mod snapshot;
pub mod store;

pub use branch::{Branch, BranchOrigin, DEFAULT_BRANCH_NAME};
pub use module::{
    CarryOver, CommandSpec, Module, ModuleOutputs, ModuleState, OutputObject, Provenance,
    Timestamps,
};
pub use project::Viztrail;
pub use repository::{Applied, EditOperation, EditOutcome, ModuleTransition, ViztrailRepository};
pub use snapshot::{Action, WorkflowSnapshot};
pub use store::ObjectStore;

// src/exec/mod.rs

//! Execution of module commands.
//!
//! - `processor`: the command processor seam and the command registry.
//! - `shell`, `markdown`: built-in processors.
//! - `backend`: the `ExecutionBackend` contract.
//! - `pool`, `queue`, `container`: the three backend variants.
//! - `factory`: picks and caches backends per viztrail.

use std::future::Future;
use std::pin::Pin;

pub mod backend;
pub mod container;
pub mod factory;
pub mod markdown;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod shell;

/// Boxed, sendable future returned by the object-safe traits of this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use backend::{
    CompletionReceiver, CompletionSender, ExecutionBackend, Task, TaskHandle, TaskOutcome,
};
pub use container::{ContainerBackend, RpcEvent, RpcRequest};
pub use factory::BackendFactory;
pub use pool::LocalPoolBackend;
pub use processor::{
    CommandFlags, CommandProcessor, CommandRegistry, ProcessorRequest, ProcessorResult,
    run_processor,
};
pub use queue::QueueBackend;

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use viztrail::exec::{BoxFuture, CommandProcessor, ProcessorRequest, ProcessorResult};
use viztrail::viztrail::{CarryOver, ModuleOutputs, OutputObject};

/// Test processor driven by its command arguments:
///
/// - `name`: label recorded in the call log and echoed to stdout
/// - `reads` / `writes`: declared resource ids
/// - `fail`: return an error result
/// - `delay_ms`: sleep before finishing
/// - `gate`: wait for [`ScriptedProcessor::release`] before finishing
///
/// Every result carries a `runs` counter in its carry-over resources.
pub struct ScriptedProcessor {
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    started: Notify,
    gate: Semaphore,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            started: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Names of executed steps, in start order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }

    /// Highest number of steps observed running at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Wait until some step has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let `n` gated steps finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

impl CommandProcessor for ScriptedProcessor {
    fn execute(&self, request: ProcessorRequest) -> BoxFuture<'_, anyhow::Result<ProcessorResult>> {
        Box::pin(async move {
            let name = request.str_argument("name").unwrap_or("step").to_string();
            self.calls.lock().unwrap().push(name.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.started.notify_one();

            let _running = RunningGuard(&self.running);

            if let Some(ms) = request.argument("delay_ms").and_then(|v| v.as_u64()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if request.argument("gate").and_then(|v| v.as_bool()) == Some(true) {
                self.gate.acquire().await?.forget();
            }

            let outputs = ModuleOutputs::new().with_stdout(OutputObject::text(name.clone()));
            if request.argument("fail").and_then(|v| v.as_bool()) == Some(true) {
                return Ok(ProcessorResult::failed(outputs, format!("{name} failed")));
            }

            let runs = request
                .resources
                .get("runs")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let mut resources = CarryOver::new();
            resources.insert("runs".to_string(), json!(runs + 1));

            Ok(ProcessorResult {
                reads: request.resource_list("reads")?,
                writes: request.resource_list("writes")?,
                resources,
                ..ProcessorResult::new(outputs)
            })
        })
    }
}

impl Default for ScriptedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Panics on its first `panics` executions, then succeeds. Used to simulate
/// queue workers that die mid-task.
pub struct FlakyProcessor {
    panics: u32,
    attempts: AtomicU32,
}

impl FlakyProcessor {
    pub fn new(panics: u32) -> Self {
        Self {
            panics,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl CommandProcessor for FlakyProcessor {
    fn execute(&self, _request: ProcessorRequest) -> BoxFuture<'_, anyhow::Result<ProcessorResult>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.panics {
                panic!("worker lost on attempt {attempt}");
            }
            Ok(ProcessorResult::new(
                ModuleOutputs::new().with_stdout(OutputObject::text(format!("attempt {attempt}"))),
            ))
        })
    }
}

/// Counts executions per queue-independent task id; used to check that a
/// task is not run twice.
#[derive(Default)]
pub struct CountingProcessor {
    seen: Mutex<HashMap<String, usize>>,
}

impl CountingProcessor {
    pub fn total(&self) -> usize {
        self.seen.lock().unwrap().values().sum()
    }

    pub fn max_per_task(&self) -> usize {
        self.seen.lock().unwrap().values().copied().max().unwrap_or(0)
    }
}

impl CommandProcessor for CountingProcessor {
    fn execute(&self, request: ProcessorRequest) -> BoxFuture<'_, anyhow::Result<ProcessorResult>> {
        Box::pin(async move {
            *self
                .seen
                .lock()
                .unwrap()
                .entry(request.task_id.to_string())
                .or_default() += 1;
            Ok(ProcessorResult::new(ModuleOutputs::new()))
        })
    }
}

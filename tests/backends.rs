use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use viztrail::config::ConfigFile;
use viztrail::datastore::MemoryDatastore;
use viztrail::exec::{
    CommandFlags, CommandRegistry, CompletionReceiver, CompletionSender, ContainerBackend,
    ExecutionBackend, LocalPoolBackend, QueueBackend, Task, TaskOutcome,
};
use viztrail::types::{BackendKind, BranchId, ModuleId, ResourceSet, TaskId, ViztrailId};
use viztrail::viztrail::{CarryOver, CommandSpec, EditOperation, ModuleState};
use viztrail_test_utils::builders::{
    ConfigFileBuilder, plain, scripted_engine, scripted_registry, step,
};
use viztrail_test_utils::processors::{CountingProcessor, FlakyProcessor, ScriptedProcessor};
use viztrail_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn task(command: CommandSpec) -> Task {
    Task {
        id: TaskId::generate(),
        viztrail: ViztrailId::from("vt"),
        branch: BranchId::from("main"),
        module: ModuleId::generate(),
        command,
        context: ResourceSet::new(),
        resources: CarryOver::new(),
    }
}

async fn submit(
    backend: &dyn ExecutionBackend,
    task: Task,
) -> Result<(viztrail::exec::TaskHandle, CompletionReceiver), Box<dyn Error>> {
    let (done, rx) = CompletionSender::channel(task.id.clone());
    let handle = backend.submit(task, done).await?;
    Ok((handle, rx))
}

fn scripted(processor: &Arc<ScriptedProcessor>) -> Arc<CommandRegistry> {
    Arc::new(scripted_registry(Arc::clone(processor)))
}

fn queue(config: &ConfigFile, registry: Arc<CommandRegistry>) -> QueueBackend {
    QueueBackend::new(config, registry, Arc::new(MemoryDatastore::new()))
}

#[tokio::test]
async fn pool_never_exceeds_its_size() -> TestResult {
    init_tracing();
    let processor = Arc::new(ScriptedProcessor::new());
    let pool = LocalPoolBackend::new(2, scripted(&processor), Arc::new(MemoryDatastore::new()));

    let mut receivers = Vec::new();
    for i in 0..5 {
        let name = format!("T{i}");
        let (_, rx) = submit(&pool, task(step(&name, json!({ "delay_ms": 30 })))).await?;
        receivers.push(rx);
    }
    for rx in receivers {
        let outcome = with_timeout(rx).await?;
        assert!(matches!(outcome, TaskOutcome::Success(_)));
    }

    assert_eq!(processor.calls().len(), 5);
    assert!(processor.max_running() <= 2);
    assert_eq!(pool.in_flight(), 0);

    pool.shutdown().await;
    assert!(!pool.is_accepting());
    Ok(())
}

#[tokio::test]
async fn pool_cancel_reports_canceled() -> TestResult {
    init_tracing();
    let processor = Arc::new(ScriptedProcessor::new());
    let pool = LocalPoolBackend::new(1, scripted(&processor), Arc::new(MemoryDatastore::new()));

    let (handle, rx) = submit(&pool, task(step("A", json!({ "gate": true })))).await?;
    with_timeout(processor.wait_started()).await;
    pool.cancel(&handle).await;

    assert_eq!(with_timeout(rx).await?, TaskOutcome::Canceled);
    // Cancelling again is harmless.
    pool.cancel(&handle).await;
    Ok(())
}

#[tokio::test]
async fn queue_routes_keep_slow_commands_off_the_default_queue() -> TestResult {
    init_tracing();
    let processor = Arc::new(ScriptedProcessor::new());
    let config = ConfigFileBuilder::new()
        .backend(BackendKind::Queue)
        .queue_workers(1)
        .route("test.step", "slow")
        .build();
    let backend = queue(&config, scripted(&processor));

    let (_, slow) = submit(&backend, task(step("A", json!({ "gate": true })))).await?;
    with_timeout(processor.wait_started()).await;

    // The only "slow" worker is blocked; the default queue still moves.
    let cell = CommandSpec::new("markdown", "text", json!({ "text": "notes" }));
    let (_, fast) = submit(&backend, task(cell)).await?;
    assert!(matches!(with_timeout(fast).await?, TaskOutcome::Success(_)));

    processor.release(1);
    assert!(matches!(with_timeout(slow).await?, TaskOutcome::Success(_)));

    backend.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn queue_lease_expiry_fails_the_task() -> TestResult {
    init_tracing();
    let processor = Arc::new(ScriptedProcessor::new());
    let config = ConfigFileBuilder::new().queue_lease("100ms").build();
    let backend = queue(&config, scripted(&processor));

    let (_, rx) = submit(&backend, task(step("A", json!({ "delay_ms": 2000 })))).await?;
    match with_timeout(rx).await? {
        TaskOutcome::Error { message, .. } => assert!(message.contains("lease")),
        other => panic!("expected a lease error, got {other:?}"),
    }
    assert_eq!(backend.in_flight(), 0);

    backend.shutdown().await;
    Ok(())
}

fn flaky_registry(flaky: Arc<FlakyProcessor>) -> Arc<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry.register("test", "flaky", flaky, CommandFlags::default());
    Arc::new(registry)
}

#[tokio::test]
async fn lost_workers_are_redelivered_up_to_the_limit() -> TestResult {
    init_tracing();
    let config = ConfigFileBuilder::new().max_redeliveries(1).build();
    let flaky = CommandSpec::new("test", "flaky", json!({}));

    // One lost worker: the redelivery succeeds.
    let recovers = Arc::new(FlakyProcessor::new(1));
    let backend = queue(&config, flaky_registry(Arc::clone(&recovers)));
    let (_, rx) = submit(&backend, task(flaky.clone())).await?;
    assert!(matches!(with_timeout(rx).await?, TaskOutcome::Success(_)));
    assert_eq!(recovers.attempts(), 2);
    backend.shutdown().await;

    // Every worker lost: give up after the redelivery.
    let doomed = Arc::new(FlakyProcessor::new(10));
    let backend = queue(&config, flaky_registry(Arc::clone(&doomed)));
    let (_, rx) = submit(&backend, task(flaky)).await?;
    match with_timeout(rx).await? {
        TaskOutcome::Error { message, .. } => assert!(message.contains("worker lost")),
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(doomed.attempts(), 2);
    backend.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn revoked_tasks_never_reach_a_worker() -> TestResult {
    init_tracing();
    let processor = Arc::new(ScriptedProcessor::new());
    let config = ConfigFileBuilder::new().queue_workers(1).build();
    let backend = queue(&config, scripted(&processor));

    let (_, first) = submit(&backend, task(step("A", json!({ "gate": true })))).await?;
    let (queued, second) = submit(&backend, task(plain("B"))).await?;
    backend.cancel(&queued).await;
    assert_eq!(with_timeout(second).await?, TaskOutcome::Canceled);

    processor.release(1);
    assert!(matches!(with_timeout(first).await?, TaskOutcome::Success(_)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.call_count("B"), 0);

    backend.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_submissions_run_once() -> TestResult {
    init_tracing();
    let counting = Arc::new(CountingProcessor::default());
    let mut registry = CommandRegistry::new();
    registry.register("test", "count", counting.clone(), CommandFlags::default());
    let config = ConfigFileBuilder::new().queue_workers(3).build();
    let backend = queue(&config, Arc::new(registry));

    let t = task(CommandSpec::new("test", "count", json!({})));
    let (_, first) = submit(&backend, t.clone()).await?;
    let (_, duplicate) = submit(&backend, t).await?;

    assert!(matches!(with_timeout(first).await?, TaskOutcome::Success(_)));
    // The duplicate's completion sender is dropped unused.
    assert!(with_timeout(duplicate).await.is_err());
    assert_eq!(counting.total(), 1);
    assert_eq!(counting.max_per_task(), 1);

    backend.shutdown().await;
    assert!(!backend.is_accepting());
    Ok(())
}

#[tokio::test]
async fn container_runs_tasks_behind_its_rpc_boundary() -> TestResult {
    init_tracing();
    let processor = Arc::new(ScriptedProcessor::new());
    let container = ContainerBackend::start(
        ViztrailId::from("vt"),
        1,
        4,
        scripted(&processor),
        Arc::new(MemoryDatastore::new()),
    );
    assert!(container.is_accepting());
    assert!(!container.supports_preemption());
    assert_eq!(container.ping().await?, 0);

    let (_, rx) = submit(&container, task(plain("A"))).await?;
    match with_timeout(rx).await? {
        TaskOutcome::Success(result) => {
            assert_eq!(result.outputs.stdout[0].display_value(), "A");
            assert_eq!(result.resources.get("runs"), Some(&json!(1)));
        }
        other => panic!("expected success, got {other:?}"),
    }

    let (handle, rx) = submit(&container, task(step("B", json!({ "gate": true })))).await?;
    with_timeout(processor.wait_started()).await;
    container.cancel(&handle).await;
    assert_eq!(with_timeout(rx).await?, TaskOutcome::Canceled);

    container.shutdown().await;
    assert!(!container.is_accepting());
    let (done, _rx) = CompletionSender::channel(TaskId::generate());
    assert!(container.submit(task(plain("C")), done).await.is_err());
    Ok(())
}

#[tokio::test]
async fn containers_forget_tasks_once_they_finish() -> TestResult {
    init_tracing();
    let processor = Arc::new(ScriptedProcessor::new());
    let container = ContainerBackend::start(
        ViztrailId::from("vt"),
        2,
        4,
        scripted(&processor),
        Arc::new(MemoryDatastore::new()),
    );

    let mut receivers = Vec::new();
    for i in 0..6 {
        let (_, rx) = submit(&container, task(plain(&format!("T{i}")))).await?;
        receivers.push(rx);
    }
    for rx in receivers {
        assert!(matches!(with_timeout(rx).await?, TaskOutcome::Success(_)));
    }
    assert_eq!(container.ping().await?, 0);

    // Requests are handled in order, so the submit is seen before the ping.
    let (_, rx) = submit(&container, task(step("G", json!({ "gate": true })))).await?;
    assert_eq!(container.ping().await?, 1);
    processor.release(1);
    assert!(matches!(with_timeout(rx).await?, TaskOutcome::Success(_)));
    assert_eq!(container.ping().await?, 0);

    container.shutdown().await;
    assert!(container.ping().await.is_err());
    Ok(())
}

#[tokio::test]
async fn viztrails_can_run_in_their_own_container() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().container_pool(2).build());
    let viztrail = engine.create_viztrail(
        "isolated",
        BTreeMap::new(),
        Some(BackendKind::Container),
    )?;
    let branch = viztrail.default_branch.clone();

    engine.edit_branch(&branch, EditOperation::Append(plain("A")))?;
    let head = with_timeout(engine.wait_idle(&branch))
        .await?
        .ok_or("no head")?;
    assert_eq!(head.modules[0].state, ModuleState::Success);
    assert_eq!(processor.calls(), vec!["A"]);
    assert_eq!(
        engine.context().backend_for(&viztrail.id)?.kind(),
        BackendKind::Container
    );

    engine.delete_viztrail(&viztrail.id).await?;
    assert!(engine.get_head(&branch).is_err());

    engine.teardown().await;
    Ok(())
}

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use serde_json::json;
use viztrail::config::CommandConfig;
use viztrail::engine::Engine;
use viztrail::errors::{NotFound, VizError};
use viztrail::types::BranchId;
use viztrail::viztrail::{CommandSpec, EditOperation, ModuleState, WorkflowSnapshot};
use viztrail_test_utils::builders::{ConfigFileBuilder, plain, scripted_engine, step};
use viztrail_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn new_branch(engine: &Engine) -> Result<BranchId, VizError> {
    Ok(engine
        .create_viztrail("notebook", BTreeMap::new(), None)?
        .default_branch)
}

/// Put several modules into the head without waking the runner, so they are
/// all pending when execution starts.
fn seed(engine: &Engine, branch: &BranchId, commands: Vec<CommandSpec>) -> TestResult {
    for command in commands {
        engine
            .repository()
            .edit_branch(branch, EditOperation::Append(command), true)?;
    }
    Ok(())
}

/// Append one module and wait for the branch to settle.
async fn append(
    engine: &Engine,
    branch: &BranchId,
    command: CommandSpec,
) -> Result<Arc<WorkflowSnapshot>, Box<dyn Error>> {
    engine.edit_branch(branch, EditOperation::Append(command))?;
    settle(engine, branch).await
}

async fn settle(engine: &Engine, branch: &BranchId) -> Result<Arc<WorkflowSnapshot>, Box<dyn Error>> {
    let head = with_timeout(engine.wait_idle(branch)).await?;
    Ok(head.ok_or("branch has no head")?)
}

fn states(head: &WorkflowSnapshot) -> Vec<ModuleState> {
    head.modules.iter().map(|m| m.state).collect()
}

/// A chain A -> B -> C linked through resources `a` and `b`.
async fn chain(engine: &Engine, branch: &BranchId) -> Result<Arc<WorkflowSnapshot>, Box<dyn Error>> {
    append(engine, branch, step("A", json!({ "writes": ["a"] }))).await?;
    append(
        engine,
        branch,
        step("B", json!({ "reads": ["a"], "writes": ["b"] })),
    )
    .await?;
    append(engine, branch, step("C", json!({ "reads": ["b"] }))).await
}

#[tokio::test]
async fn modules_run_one_at_a_time_in_program_order() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().pool_size(4).build());
    let branch = new_branch(&engine)?;

    seed(
        &engine,
        &branch,
        vec![
            step("A", json!({ "delay_ms": 20 })),
            step("B", json!({ "delay_ms": 20 })),
            step("C", json!({ "delay_ms": 20 })),
        ],
    )?;
    engine.resume_branch(&branch)?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(processor.calls(), vec!["A", "B", "C"]);
    assert_eq!(processor.max_running(), 1);
    assert_eq!(states(&head), vec![ModuleState::Success; 3]);

    for pair in head.modules.windows(2) {
        let finished = pair[0].timestamps.finished_at.ok_or("no finish time")?;
        let started = pair[1].timestamps.started_at.ok_or("no start time")?;
        assert!(started >= finished);
    }

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn failure_skips_every_downstream_module() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;
    let mut events = engine.subscribe();

    seed(
        &engine,
        &branch,
        vec![
            plain("A"),
            step("B", json!({ "fail": true })),
            plain("C"),
            plain("D"),
        ],
    )?;
    engine.resume_branch(&branch)?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(
        states(&head),
        vec![
            ModuleState::Success,
            ModuleState::Error,
            ModuleState::Error,
            ModuleState::Error,
        ]
    );
    assert_eq!(processor.calls(), vec!["A", "B"]);
    assert!(head.modules[1].outputs.has_error());
    assert!(head.modules[2].outputs.is_empty());
    assert!(head.modules[3].outputs.is_empty());
    assert!(head.modules[2].is_skipped());

    let skipped = [head.modules[2].id.clone(), head.modules[3].id.clone()];
    while let Ok(t) = events.try_recv() {
        if skipped.contains(&t.module) {
            assert_ne!(t.to, ModuleState::Active, "skipped module was started");
        }
    }

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn replacing_the_last_module_keeps_upstream_results() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;
    let before = chain(&engine, &branch).await?;

    let last = before.modules[2].id.clone();
    engine.edit_branch(
        &branch,
        EditOperation::Replace {
            module: last.clone(),
            command: step("C2", json!({ "reads": ["b"] })),
        },
    )?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(states(&head), vec![ModuleState::Success; 3]);
    assert_eq!(processor.call_count("A"), 1);
    assert_eq!(processor.call_count("B"), 1);
    assert_eq!(processor.call_count("C"), 1);
    assert_eq!(processor.call_count("C2"), 1);

    assert_ne!(head.modules[2].id, last);
    for i in 0..2 {
        assert_eq!(head.modules[i].id, before.modules[i].id);
        assert_eq!(
            head.modules[i].timestamps.finished_at,
            before.modules[i].timestamps.finished_at
        );
    }

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn inserting_an_unrelated_module_reuses_downstream_results() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;
    let before = chain(&engine, &branch).await?;

    engine.edit_branch(
        &branch,
        EditOperation::Insert {
            before: before.modules[1].id.clone(),
            command: plain("X"),
        },
    )?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(head.len(), 4);
    assert_eq!(states(&head), vec![ModuleState::Success; 4]);
    assert_eq!(processor.calls(), vec!["A", "B", "C", "X"]);

    // B and C copied their previous executions.
    for (new, old) in [(2, 1), (3, 2)] {
        assert_eq!(head.modules[new].id, before.modules[old].id);
        assert_eq!(head.modules[new].outputs, before.modules[old].outputs);
        assert_eq!(head.modules[new].provenance, before.modules[old].provenance);
        assert_eq!(
            head.modules[new].timestamps.finished_at,
            before.modules[old].timestamps.finished_at
        );
    }

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn rewriting_an_input_reruns_its_readers() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;
    let before = chain(&engine, &branch).await?;

    engine.edit_branch(
        &branch,
        EditOperation::Replace {
            module: before.modules[0].id.clone(),
            command: step("A2", json!({ "writes": ["a"] })),
        },
    )?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(states(&head), vec![ModuleState::Success; 3]);
    assert_eq!(processor.calls(), vec!["A", "B", "C", "A2", "B", "C"]);

    let read_a = |m: usize| {
        head.modules[m]
            .read_set()
            .and_then(|r| r.get(&"a".into()).cloned())
    };
    let old_read_a = before.modules[1]
        .read_set()
        .and_then(|r| r.get(&"a".into()).cloned());
    assert!(read_a(1).is_some());
    assert_ne!(read_a(1), old_read_a);

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn no_cache_commands_rerun_after_every_edit_upstream() -> TestResult {
    init_tracing();
    let config = ConfigFileBuilder::new()
        .command(
            "test",
            "step",
            CommandConfig {
                no_cache: true,
                ..CommandConfig::default()
            },
        )
        .build();
    let (engine, processor, _) = scripted_engine(config);
    let branch = new_branch(&engine)?;

    append(&engine, &branch, plain("A")).await?;
    let before = append(&engine, &branch, plain("B")).await?;
    engine.edit_branch(
        &branch,
        EditOperation::Insert {
            before: before.modules[1].id.clone(),
            command: plain("X"),
        },
    )?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(states(&head), vec![ModuleState::Success; 3]);
    assert_eq!(processor.call_count("A"), 1);
    assert_eq!(processor.call_count("B"), 2);

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn carry_over_resources_follow_the_module() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;

    let head = append(&engine, &branch, step("A", json!({ "materialize_input": true }))).await?;
    let a = head.modules[0].id.clone();
    assert_eq!(head.modules[0].resources.get("runs"), Some(&json!(1)));

    // Materialization is never served from a previous execution.
    engine.edit_branch(
        &branch,
        EditOperation::Insert {
            before: a.clone(),
            command: plain("X"),
        },
    )?;
    let head = settle(&engine, &branch).await?;
    assert_eq!(head.modules[1].id, a);
    assert_eq!(head.modules[1].resources.get("runs"), Some(&json!(2)));

    // A replacement inherits the state of the module it replaces.
    engine.edit_branch(
        &branch,
        EditOperation::Replace {
            module: a,
            command: plain("A2"),
        },
    )?;
    let head = settle(&engine, &branch).await?;
    assert_eq!(head.modules[1].resources.get("runs"), Some(&json!(3)));
    assert_eq!(processor.call_count("A"), 2);

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn synchronous_commands_run_inline_and_are_never_reused() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;

    let sync = CommandSpec::new("test", "sync", json!({ "name": "S" }));
    let head = append(&engine, &branch, sync).await?;
    assert_eq!(states(&head), vec![ModuleState::Success]);

    engine.edit_branch(
        &branch,
        EditOperation::Insert {
            before: head.modules[0].id.clone(),
            command: plain("X"),
        },
    )?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(states(&head), vec![ModuleState::Success; 2]);
    assert_eq!(processor.calls(), vec!["S", "X", "S"]);

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn deleting_a_module_reruns_nothing_that_did_not_depend_on_it() -> TestResult {
    init_tracing();
    let (engine, processor, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;

    append(&engine, &branch, step("A", json!({ "writes": ["a"] }))).await?;
    append(&engine, &branch, plain("X")).await?;
    let before = append(&engine, &branch, step("B", json!({ "reads": ["a"] }))).await?;

    engine.edit_branch(
        &branch,
        EditOperation::Delete {
            module: before.modules[1].id.clone(),
        },
    )?;
    let head = settle(&engine, &branch).await?;

    assert_eq!(head.len(), 2);
    assert_eq!(states(&head), vec![ModuleState::Success; 2]);
    assert_eq!(processor.calls(), vec!["A", "X", "B"]);

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_commands_are_rejected_before_any_edit() -> TestResult {
    init_tracing();
    let (engine, _, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;

    let err = engine
        .edit_branch(
            &branch,
            EditOperation::Append(CommandSpec::new("vizual", "nope", json!({}))),
        )
        .unwrap_err();
    assert!(matches!(err, VizError::NotFound(NotFound::Command { .. })));
    assert!(engine.get_head(&branch)?.is_none());

    engine.teardown().await;
    Ok(())
}

#[tokio::test]
async fn markdown_cells_render_their_text() -> TestResult {
    init_tracing();
    let (engine, _, _) = scripted_engine(ConfigFileBuilder::new().build());
    let branch = new_branch(&engine)?;

    let cell = CommandSpec::new("markdown", "text", json!({ "text": "# Results" }));
    let head = append(&engine, &branch, cell).await?;

    let module = engine.get_module_state(&branch, &head.modules[0].id)?;
    assert_eq!(module.state, ModuleState::Success);
    assert_eq!(module.outputs.stdout.len(), 1);
    assert_eq!(module.outputs.stdout[0].display_value(), "# Results");

    engine.teardown().await;
    Ok(())
}

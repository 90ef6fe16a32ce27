// src/lib.rs

pub mod cli;
pub mod config;
pub mod datastore;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod notebook;
pub mod types;
pub mod viztrail;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_or_default};
use crate::engine::Engine;
use crate::notebook::Notebook;
use crate::types::BranchId;
use crate::viztrail::{EditOperation, ModuleState, WorkflowSnapshot};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config and notebook loading
/// - the engine (repository, registry, backends)
/// - one project whose default branch receives the notebook modules
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_or_default(&args.config)?;
    let notebook = Notebook::load(&args.notebook)?;

    if args.dry_run {
        print_dry_run(&cfg, &notebook);
        return Ok(());
    }

    let engine = Engine::init(cfg)?;
    let viztrail = engine.create_viztrail(&args.name, BTreeMap::new(), notebook.backend)?;
    let branch = viztrail.default_branch.clone();
    if !notebook.context.is_empty() {
        engine.set_context_resources(&branch, notebook.context.iter().cloned().collect())?;
    }
    info!(viztrail = %viztrail.id, modules = notebook.modules.len(), "running notebook");

    let head = drive(engine, &branch, &notebook, tokio::signal::ctrl_c()).await?;

    let Some(head) = head else {
        println!("notebook is empty");
        return Ok(());
    };
    print_report(&head);

    let failed = head
        .modules
        .iter()
        .filter(|m| m.state != ModuleState::Success)
        .count();
    if failed > 0 {
        bail!("{failed} of {} modules did not succeed", head.len());
    }
    Ok(())
}

/// Run the notebook until it finishes or `interrupt` fires, then stop the
/// engine whatever the outcome.
async fn drive<I>(
    engine: Engine,
    branch: &BranchId,
    notebook: &Notebook,
    interrupt: I,
) -> Result<Option<Arc<WorkflowSnapshot>>>
where
    I: Future<Output = std::io::Result<()>>,
{
    let outcome = tokio::select! {
        biased;
        res = interrupt => {
            match res {
                Ok(()) => warn!("interrupted; canceling the notebook"),
                Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
            }
            engine
                .cancel_branch(branch)
                .and_then(|_| engine.get_head(branch))
                .map_err(Into::into)
        }
        res = run_modules(&engine, branch, notebook) => res,
    };
    engine.teardown().await;
    outcome
}

/// Append the notebook modules one by one, each after the previous one has
/// finished, like cells run in order.
async fn run_modules(
    engine: &Engine,
    branch: &BranchId,
    notebook: &Notebook,
) -> Result<Option<Arc<WorkflowSnapshot>>> {
    let mut head = None;
    for command in notebook.commands() {
        debug!(command = %command, "appending module");
        engine.edit_branch(branch, EditOperation::Append(command))?;
        head = engine.wait_idle(branch).await?;
    }
    Ok(head)
}

fn print_report(head: &WorkflowSnapshot) {
    for (i, module) in head.modules.iter().enumerate() {
        println!("[{i}] {:<9} {}", module.state.to_string(), module.command);
        for out in module.outputs.stdout.iter() {
            for line in out.display_value().lines() {
                println!("      {line}");
            }
        }
        for out in module.outputs.stderr.iter() {
            for line in out.display_value().lines() {
                println!("    ! {line}");
            }
        }
    }
}

/// Simple dry-run output: print engine settings and the notebook modules.
fn print_dry_run(cfg: &ConfigFile, notebook: &Notebook) {
    println!("viztrail dry-run");
    println!("  engine.backend = {}", notebook.backend.unwrap_or(cfg.engine.backend));
    println!("  engine.pool_size = {}", cfg.engine.pool_size);
    println!("  datastore = {:?}", cfg.datastore.kind);
    if !notebook.context.is_empty() {
        let names: Vec<&str> = notebook.context.iter().map(|r| r.as_str()).collect();
        println!("  context = {names:?}");
    }
    println!();

    println!("modules ({}):", notebook.modules.len());
    for (i, module) in notebook.modules.iter().enumerate() {
        let flags = cfg.command_config(&module.package, &module.command);
        println!("  [{i}] {}.{}", module.package, module.command);
        println!("      arguments: {}", module.arguments);
        if flags.synchronous {
            println!("      synchronous: true");
        }
        if flags.no_cache {
            println!("      no_cache: true");
        }
        if !flags.enabled {
            println!("      enabled: false");
        }
    }

    debug!("dry-run complete (no execution)");
}

// src/exec/shell.rs

//! `shell.run`: run a shell command as a module.
//!
//! Arguments:
//! - `cmd` (string, required): command line passed to `sh -c`.
//! - `reads` / `writes` (lists of resource ids): the resources the command
//!   declares it consumes and produces.
//!
//! The visible context is exported as JSON in `VIZTRAIL_CONTEXT`. With a
//! file-backed datastore the command runs in the datastore root.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::exec::BoxFuture;
use crate::exec::processor::{CommandProcessor, ProcessorRequest, ProcessorResult};
use crate::viztrail::{ModuleOutputs, OutputObject};

pub const CONTEXT_ENV: &str = "VIZTRAIL_CONTEXT";
pub const TASK_ENV: &str = "VIZTRAIL_TASK";

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellProcessor;

impl CommandProcessor for ShellProcessor {
    fn execute(&self, request: ProcessorRequest) -> BoxFuture<'_, Result<ProcessorResult>> {
        Box::pin(run_shell(request))
    }
}

async fn run_shell(request: ProcessorRequest) -> Result<ProcessorResult> {
    let line = request
        .str_argument("cmd")
        .context("shell.run requires a string argument 'cmd'")?
        .to_string();
    let reads = request.resource_list("reads")?;
    let writes = request.resource_list("writes")?;
    let context_json = serde_json::to_string(&request.context)?;

    info!(task = %request.task_id, cmd = %line, "starting shell command");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&line);
        c
    };
    if let Some(root) = request.datastore.root() {
        cmd.current_dir(root);
    }
    cmd.env(CONTEXT_ENV, context_json)
        .env(TASK_ENV, request.task_id.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning shell for task '{}'", request.task_id))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Consume stderr concurrently so the pipe never fills up.
    let task_id = request.task_id.clone();
    let stderr_task = tokio::spawn(async move {
        let mut collected = Vec::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %task_id, "stderr: {}", line);
                collected.push(line);
            }
        }
        collected
    });

    let mut out = String::new();
    if let Some(mut stdout) = stdout {
        stdout
            .read_to_string(&mut out)
            .await
            .context("reading shell stdout")?;
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for shell of task '{}'", request.task_id))?;
    let err_lines = stderr_task.await.unwrap_or_default();

    let code = status.code().unwrap_or(-1);
    info!(
        task = %request.task_id,
        exit_code = code,
        success = status.success(),
        "shell command exited"
    );

    let mut outputs = ModuleOutputs::new();
    if !out.is_empty() {
        outputs = outputs.with_stdout(OutputObject::text(out));
    }

    if !status.success() {
        if !err_lines.is_empty() {
            outputs.stderr.push(OutputObject::text(err_lines.join("\n")));
        }
        return Ok(ProcessorResult::failed(
            outputs,
            format!("command exited with status {code}"),
        ));
    }

    Ok(ProcessorResult {
        outputs,
        reads,
        writes,
        resources: request.resources,
        error: None,
    })
}

// src/exec/markdown.rs

//! `markdown.text`: a documentation cell. Emits its `text` argument as
//! markdown and touches no resources.

use anyhow::{Context, Result};

use crate::exec::BoxFuture;
use crate::exec::processor::{CommandProcessor, ProcessorRequest, ProcessorResult};
use crate::viztrail::{ModuleOutputs, OutputObject};

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownProcessor;

impl CommandProcessor for MarkdownProcessor {
    fn execute(&self, request: ProcessorRequest) -> BoxFuture<'_, Result<ProcessorResult>> {
        Box::pin(async move {
            let text = request
                .str_argument("text")
                .context("markdown.text requires a string argument 'text'")?;
            Ok(ProcessorResult::new(
                ModuleOutputs::new().with_stdout(OutputObject::markdown(text)),
            ))
        })
    }
}

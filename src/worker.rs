//! The worker side of the process backend.
//!
//! A worker process talks to its coordinator using JSON Lines over stdin and
//! stdout:
//!
//! 1. The coordinator sends one [`WorkerHello`], naming the task and carrying
//!    the document context and worker settings.
//! 2. It then sends one [`PageAssignment`] per page, waiting for a
//!    [`WorkerReply`] before sending the next.
//! 3. When it closes our stdin, we exit.
//!
//! Logs go to stderr, which the coordinator shares with us.

use std::{
    io::{BufRead, Write},
    sync::Arc,
};

use crate::{
    context::{DocumentContext, PageAssignment},
    errors::{PipelineError, find_pipeline_error},
    executor::{WorkerInit, run_page},
    page_result::PageResult,
    prelude::*,
    tasks::TaskRegistry,
};

/// The first message a worker receives.
#[derive(Debug, Deserialize, Serialize)]
pub struct WorkerHello {
    /// The registered name of the task to run.
    pub task: String,
    /// Settings to apply before the first task.
    pub init: WorkerInit,
    /// The document we're working on.
    pub document: DocumentContext,
}

/// A worker's answer to a [`PageAssignment`].
#[derive(Debug, Deserialize, Serialize)]
pub enum WorkerReply {
    /// The page was processed.
    Done(PageResult),
    /// The page task failed.
    Failed {
        /// The outermost error message.
        message: String,
        /// The classified error at the root of the failure, if any.
        error: Option<PipelineError>,
    },
}

impl WorkerReply {
    /// Build a reply from a task's result.
    pub fn from_result(result: Result<PageResult>) -> Self {
        match result {
            Ok(page_result) => WorkerReply::Done(page_result),
            Err(err) => WorkerReply::Failed {
                message: err.to_string(),
                error: find_pipeline_error(&err).cloned(),
            },
        }
    }

    /// Turn a reply for page `pageno` back into a result.
    pub fn into_result(self, pageno: usize) -> Result<PageResult> {
        match self {
            WorkerReply::Done(page_result) if page_result.pageno == pageno => Ok(page_result),
            WorkerReply::Done(page_result) => Err(PipelineError::ChildProcess(format!(
                "worker returned page {} when asked for page {}",
                page_result.pageno + 1,
                pageno + 1
            ))
            .into()),
            WorkerReply::Failed {
                message,
                error: Some(error),
            } => {
                if message == error.to_string() {
                    Err(error.into())
                } else {
                    Err(anyhow::Error::new(error).context(message))
                }
            }
            WorkerReply::Failed {
                message,
                error: None,
            } => Err(PipelineError::PageTask { pageno, message }.into()),
        }
    }
}

/// Serve a coordinator until it closes `input`.
#[instrument(level = "debug", skip_all, fields(worker = worker_id))]
pub fn serve(
    worker_id: usize,
    input: impl BufRead,
    mut output: impl Write,
    registry: Arc<TaskRegistry>,
) -> Result<()> {
    let mut lines = input.lines();
    let hello_line = lines
        .next()
        .transpose()
        .context("could not read from coordinator")?
        .ok_or_else(|| anyhow!("coordinator hung up before sending a hello"))?;
    let hello: WorkerHello =
        serde_json::from_str(&hello_line).context("could not parse worker hello")?;
    let task = registry.require(&hello.task)?;
    let document = Arc::new(DocumentContext {
        registry,
        ..hello.document
    });

    let _guard = hello.init.apply(worker_id);
    for line in lines {
        let line = line.context("could not read page assignment")?;
        if line.trim().is_empty() {
            continue;
        }
        let assignment: PageAssignment =
            serde_json::from_str(&line).context("could not parse page assignment")?;
        let result = document
            .context_for(assignment)
            .and_then(|page| run_page(task.as_ref(), &page));
        let reply = WorkerReply::from_result(result);
        serde_json::to_writer(&mut output, &reply).context("could not write reply")?;
        output.write_all(b"\n").context("could not write reply")?;
        output.flush().context("could not flush reply")?;
    }
    debug!("Coordinator closed connection");
    Ok(())
}

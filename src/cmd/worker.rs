//! The hidden `worker` subcommand, started by the process backend.

use std::{io, sync::Arc};

use clap::Args;

use crate::{
    async_utils::spawn_blocking_propagating_panics, prelude::*, tasks::TaskRegistry,
    worker::serve,
};

/// Command-line arguments for the `worker` subcommand.
#[derive(Debug, Args)]
pub struct WorkerOpts {
    /// Our worker number, used to tag log output.
    #[clap(long, default_value_t = 1)]
    pub id: usize,
}

/// The `worker` subcommand. Reads page assignments from stdin and writes
/// replies to stdout until stdin is closed.
pub async fn cmd_worker(opts: &WorkerOpts) -> Result<()> {
    let worker_id = opts.id;
    spawn_blocking_propagating_panics(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        serve(
            worker_id,
            stdin.lock(),
            stdout.lock(),
            Arc::new(TaskRegistry::default()),
        )
    })
    .await
}

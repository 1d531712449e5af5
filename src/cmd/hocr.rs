//! The `hocr` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    async_utils::io::write_jsonl,
    executor::Executor,
    options::PipelineOptions,
    pdfinfo::PopplerMetadata,
    pipeline::run_pipeline,
    prelude::*,
    tasks::TaskRegistry,
    ui::Ui,
};

/// Command-line arguments for the `hocr` subcommand.
#[derive(Debug, Args)]
pub struct HocrOpts {
    #[clap(flatten)]
    pub pipeline: PipelineOptions,

    /// Write page results to this file as JSON Lines. Defaults to stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `hocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_hocr(ui: Ui, opts: &HocrOpts) -> Result<()> {
    let executor = Executor::new(ui);
    let outcome = run_pipeline(
        &executor,
        &opts.pipeline,
        &PopplerMetadata,
        Arc::new(TaskRegistry::default()),
    )
    .await?;
    let skipped = outcome.results.iter().filter(|r| r.skipped).count();
    info!(
        "Processed {} pages ({} skipped)",
        outcome.results.len(),
        skipped
    );
    write_jsonl(opts.output_path.as_deref(), &outcome.results).await
}

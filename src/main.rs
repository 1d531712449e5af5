use std::{process::ExitCode, str::FromStr};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{errors::classify_error, prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod context;
mod errors;
mod executor;
mod options;
mod page_result;
mod pdfinfo;
mod pipeline;
mod prelude;
mod tasks;
mod ui;
mod validation;
mod work_folder;
mod worker;

/// Process PDF pages in parallel, using a pool of threads or worker
/// processes.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - PAGE_PIPELINE_JOBS (optional): Default for --jobs.
  - PAGE_PIPELINE_USE_THREADS (optional): Default for --use-threads.
  - RUST_LOG (optional): Log filter, e.g. "debug" or "page_pipeline=trace".

  These variables may be set in a standard `.env` file.

Exit Codes:
  0 success, 1 bad arguments, 2 input file error, 3 missing dependency,
  6 page already has text, 7 page or worker failure, 15 other error.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process every page of a PDF, and print a JSON result for each page.
    Hocr(cmd::hocr::HocrOpts),
    /// Serve page assignments on stdin. Used internally by the process
    /// backend.
    #[clap(hide = true)]
    Worker(cmd::worker::WorkerOpts),
    /// Print schemas for our input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Hocr(opts) => opts.output_path.is_none(),
            Cmd::Worker(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point. Errors are printed, and mapped to an exit code
/// describing what kind of failure happened.
#[tokio::main]
async fn main() -> ExitCode {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    // Load environment variables from a `.env` file, if it exists. This
    // needs to happen before we parse arguments, which may read them.
    dotenvy::dotenv().ok();

    // Parse command-line arguments. Help and version requests also arrive
    // as "errors", but they go to stdout.
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                errors::ErrorClass::BadArgs.into()
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match real_main(ui, opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let class = classify_error(&err);
            eprintln!("Error: {:?}", err);
            debug!("Exiting with {:?} ({})", class, class.exit_code());
            class.into()
        }
    }
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<()> {
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Hocr(opts) => {
            cmd::hocr::cmd_hocr(ui, opts).await?;
        }
        Cmd::Worker(opts) => {
            cmd::worker::cmd_worker(opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}

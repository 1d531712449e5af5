//! The end-to-end pipeline: set up a work folder, look at the document, and
//! process every page.

use std::{fs, io::Read as _, sync::Arc};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    context::DocumentContext,
    errors::PipelineError,
    executor::{Backend, ExecuteOptions, Executor, ProgressOptions, WorkerInit},
    options::PipelineOptions,
    page_result::{PageResult, sort_by_page},
    pdfinfo::MetadataSource,
    prelude::*,
    tasks::TaskRegistry,
    validation::validate_document,
    work_folder::WorkFolder,
};

/// Every PDF starts with this.
const PDF_MAGIC: &[u8] = b"%PDF-";

/// What a successful run produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// One result per page, sorted by page index.
    pub results: Vec<PageResult>,
    /// Where the work folder was retained, if it was.
    pub retained: Option<PathBuf>,
}

/// Run the pipeline over `options.input_file`.
///
/// The work folder is released on every path out of here. Errors are
/// returned unchanged, so callers can still classify them.
#[instrument(level = "debug", skip_all, fields(input = %options.input_file.display()))]
pub async fn run_pipeline(
    executor: &Executor,
    options: &PipelineOptions,
    metadata_source: &dyn MetadataSource,
    registry: Arc<TaskRegistry>,
) -> Result<PipelineOutcome> {
    options.check_options(&registry)?;
    check_input_file(&options.input_file)?;

    let work_folder =
        WorkFolder::acquire(options.output_folder.as_deref(), options.keep_temporary_files)?;
    let result = process_document(executor, options, metadata_source, registry, &work_folder)
        .await;
    match result {
        Ok(results) => {
            let retained = work_folder.release()?;
            Ok(PipelineOutcome { results, retained })
        }
        Err(err) => {
            if let Err(release_err) = work_folder.release() {
                warn!("{:?}", release_err);
            }
            Err(err)
        }
    }
}

/// Everything that happens inside the work folder.
async fn process_document(
    executor: &Executor,
    options: &PipelineOptions,
    metadata_source: &dyn MetadataSource,
    registry: Arc<TaskRegistry>,
    work_folder: &WorkFolder,
) -> Result<Vec<PageResult>> {
    let origin = work_folder.origin_path();
    snapshot_input(&options.input_file, &origin).await?;

    let metadata = metadata_source
        .document_metadata(&origin, executor, options)
        .await?;
    let task = registry.require(&options.task)?;
    let document = DocumentContext::new(
        options.clone(),
        work_folder.path().to_owned(),
        origin,
        metadata,
        registry,
    );
    validate_document(&document)?;

    let contexts = document.page_contexts()?;
    let execute_options = ExecuteOptions {
        backend: Backend::new(options.use_threads),
        max_workers: options.jobs,
        progress: ProgressOptions::per_task(contexts.len(), "Processing pages", "Processed pages")
            .with_disable(!options.progress_bar),
        worker_init: WorkerInit {
            max_image_pixels: options.max_image_pixels(),
        },
    };
    let mut results = executor.run_pages(&execute_options, task, contexts).await?;
    sort_by_page(&mut results);

    for result in &results {
        result.check_artifacts_within(work_folder.path())?;
    }
    let summary = serde_json::to_vec_pretty(&results).context("could not serialize results")?;
    tokio::fs::write(work_folder.results_path(), summary)
        .await
        .context("could not write results")?;
    Ok(results)
}

/// Make sure our input looks like a PDF we can read.
fn check_input_file(path: &Path) -> Result<()> {
    let input_error = |reason: String| -> anyhow::Error {
        PipelineError::InputFile(format!("{}: {}", path.display(), reason)).into()
    };
    let metadata = fs::metadata(path).map_err(|err| input_error(err.to_string()))?;
    if !metadata.is_file() {
        return Err(input_error("not a regular file".to_owned()));
    }
    let mut magic = [0; PDF_MAGIC.len()];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|_| input_error("could not read a PDF header".to_owned()))?;
    if magic != PDF_MAGIC {
        return Err(input_error("not a PDF file".to_owned()));
    }
    Ok(())
}

/// Copy the input into the work folder, keeping its modification time, so
/// later changes to the original can't affect this run.
async fn snapshot_input(input: &Path, origin: &Path) -> Result<()> {
    let input = input.to_owned();
    let origin = origin.to_owned();
    spawn_blocking_propagating_panics(move || {
        let snapshot_error = |err: std::io::Error| -> anyhow::Error {
            PipelineError::InputFile(format!(
                "could not copy {} into the work folder: {}",
                input.display(),
                err
            ))
            .into()
        };
        fs::copy(&input, &origin).map_err(snapshot_error)?;
        let modified = fs::metadata(&input)
            .and_then(|metadata| metadata.modified())
            .map_err(snapshot_error)?;
        fs::File::options()
            .write(true)
            .open(&origin)
            .and_then(|file| file.set_modified(modified))
            .with_context(|| {
                format!("could not set modification time on {:?}", origin.display())
            })?;
        debug!(origin = %origin.display(), "Snapshotted input");
        Ok(())
    })
    .await
}

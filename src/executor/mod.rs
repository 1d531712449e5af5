//! Run a page task over many pages, using a pool of workers.
//!
//! The [`Executor`] takes a [`PageTask`] and a list of [`PageContext`]s, runs
//! the task once per page, and collects the [`PageResult`]s. Workers are
//! either threads in this process ([`ThreadBackend`]) or separate worker
//! processes ([`ProcessBackend`]). Either way:
//!
//! - We never use more workers than we have pages. With one worker or less,
//!   we skip the pool and run every page in order on a single thread.
//! - Each worker applies its [`WorkerInit`] once, before its first task.
//! - Results arrive in whatever order they finish. Each [`PageResult`] knows
//!   its own page index, so callers can sort them afterwards.
//! - The first failure stops the run. No new pages are handed out, workers
//!   are cancelled as far as the backend allows, and the failure is returned.
//!   We always wait for workers to stop before returning, so nobody is still
//!   writing to the work folder when our caller cleans it up.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{StreamExt as _, channel::mpsc};

use crate::{
    async_utils::panic_message,
    context::PageContext,
    errors::{PipelineError, find_pipeline_error},
    page_result::PageResult,
    prelude::*,
    tasks::PageTask,
    ui::Ui,
};

pub mod init;
pub mod processes;
pub mod progress;
pub mod threads;

pub use self::{
    init::WorkerInit,
    processes::ProcessBackend,
    progress::{Progress, ProgressOptions},
    threads::ThreadBackend,
};

/// A flag shared by everyone working on a run, set when the run fails.
pub type CancelFlag = Arc<AtomicBool>;

/// Everything a backend needs to run a batch of pages.
pub struct PageJob {
    /// The task to run.
    pub task: Arc<dyn PageTask>,
    /// One context per page.
    pub contexts: Vec<PageContext>,
    /// How many workers to start. Always at least 2.
    pub workers: usize,
    /// Applied by each worker before its first task.
    pub init: WorkerInit,
    /// Advanced once per completed page.
    pub progress: Progress,
}

/// The capability shared by all backends.
#[async_trait]
pub trait RunPages: Send + Sync {
    /// A short name for logging.
    fn name(&self) -> &'static str;

    /// Run `job.task` on every page in `job`. Results are returned in the
    /// order they finished.
    async fn run_pages(&self, job: PageJob) -> Result<Vec<PageResult>>;
}

/// The kind of workers to use.
pub enum Backend {
    /// Threads in this process. Cheap to start, and appropriate when tasks
    /// mostly wait on I/O or on external programs.
    Threads(ThreadBackend),
    /// Separate worker processes. Needed when tasks rely on process-wide
    /// state, or need real CPU parallelism.
    Processes(ProcessBackend),
}

impl Backend {
    /// Choose a backend.
    pub fn new(use_threads: bool) -> Self {
        if use_threads {
            Backend::Threads(ThreadBackend)
        } else {
            Backend::Processes(ProcessBackend::default())
        }
    }

    /// Get our implementation of [`RunPages`].
    fn runner(&self) -> &dyn RunPages {
        match self {
            Backend::Threads(backend) => backend as &dyn RunPages,
            Backend::Processes(backend) => backend as &dyn RunPages,
        }
    }
}

/// How to run a batch of pages.
pub struct ExecuteOptions {
    /// Which kind of workers to use.
    pub backend: Backend,
    /// The most workers we may start.
    pub max_workers: usize,
    /// How to report progress.
    pub progress: ProgressOptions,
    /// Applied by each worker before its first task.
    pub worker_init: WorkerInit,
}

/// Runs tasks over pages, in parallel when possible.
#[derive(Clone)]
pub struct Executor {
    ui: Ui,
}

impl Executor {
    /// Create a new executor, which will draw progress bars using `ui`.
    pub fn new(ui: Ui) -> Self {
        Self { ui }
    }

    /// How many workers should we use for `task_count` tasks?
    pub fn effective_workers(max_workers: usize, task_count: usize) -> usize {
        max_workers.min(task_count)
    }

    /// Run `task` once for each page in `contexts`, returning results in the
    /// order they finished.
    #[instrument(level = "debug", skip_all, fields(pages = contexts.len()))]
    pub async fn run_pages(
        &self,
        options: &ExecuteOptions,
        task: Arc<dyn PageTask>,
        contexts: Vec<PageContext>,
    ) -> Result<Vec<PageResult>> {
        if contexts.is_empty() {
            debug!("No pages to process");
            return Ok(vec![]);
        }
        let workers = Self::effective_workers(options.max_workers, contexts.len());
        let progress = Progress::new(&self.ui, &options.progress);

        let result = if workers <= 1 {
            debug!("Processing {} pages sequentially", contexts.len());
            threads::run_sequential(
                contexts,
                options.worker_init.clone(),
                progress.clone(),
                move |_, page| run_page(task.as_ref(), &page),
            )
            .await
            .map(|outputs| outputs.into_iter().map(|(_, result)| result).collect())
        } else {
            let runner = options.backend.runner();
            info!(
                "Start processing {} pages concurrently using {} {}",
                contexts.len(),
                workers,
                runner.name()
            );
            runner
                .run_pages(PageJob {
                    task,
                    contexts,
                    workers,
                    init: options.worker_init.clone(),
                    progress: progress.clone(),
                })
                .await
        };

        match &result {
            Ok(_) => progress.finish(),
            Err(_) => {
                debug!("Run failed after {} pages", progress.position());
                progress.abandon();
            }
        }
        result
    }

    /// Run a blocking function over `inputs` on a pool of threads, returning
    /// outputs in input order.
    ///
    /// This is for helper work which never needs process isolation, such as
    /// probing pages with external tools while gathering metadata.
    #[instrument(level = "debug", skip_all, fields(inputs = inputs.len()))]
    pub async fn map_blocking<I, O, F>(
        &self,
        max_workers: usize,
        progress: &ProgressOptions,
        inputs: Vec<I>,
        f: F,
    ) -> Result<Vec<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        if inputs.is_empty() {
            return Ok(vec![]);
        }
        let workers = Self::effective_workers(max_workers, inputs.len());
        let progress = Progress::new(&self.ui, progress);
        let init = WorkerInit::default();
        let f = move |_idx: usize, input: I| f(input);
        let result = if workers <= 1 {
            threads::run_sequential(inputs, init, progress.clone(), f).await
        } else {
            threads::run_pool(inputs, workers, init, progress.clone(), f).await
        };
        match result {
            Ok(mut outputs) => {
                progress.finish();
                outputs.sort_by_key(|(idx, _)| *idx);
                Ok(outputs.into_iter().map(|(_, output)| output).collect())
            }
            Err(err) => {
                progress.abandon();
                Err(err)
            }
        }
    }
}

/// Run a task on a single page, inside a span naming the page, and make sure
/// any failure says which page it came from.
pub fn run_page(task: &dyn PageTask, page: &PageContext) -> Result<PageResult> {
    let pageno = page.pageno();
    let _span = tracing::info_span!("page", pageno = pageno + 1).entered();
    catch_unwind(AssertUnwindSafe(|| task.run(page)))
        .unwrap_or_else(|payload| Err(anyhow!("task panicked: {}", panic_message(&*payload))))
        .map_err(|err| page_failure(pageno, err))
}

/// Attach a page number to a task failure. Failures which already carry a
/// [`PipelineError`] keep it, so that callers can still classify them.
pub fn page_failure(pageno: usize, err: anyhow::Error) -> anyhow::Error {
    if find_pipeline_error(&err).is_some() {
        err.context(format!("page {} failed", pageno + 1))
    } else {
        PipelineError::PageTask {
            pageno,
            message: format!("{:#}", err),
        }
        .into()
    }
}

/// Collect results sent by workers until all workers hang up, or until the
/// first failure. On failure, raise `cancel` so workers stop picking up new
/// work.
async fn fan_in<O>(
    mut rx: mpsc::UnboundedReceiver<(usize, Result<O>)>,
    progress: &Progress,
    cancel: &CancelFlag,
) -> Result<Vec<(usize, O)>> {
    let mut outputs = vec![];
    while let Some((idx, result)) = rx.next().await {
        match result {
            Ok(output) => {
                progress.task_done();
                outputs.push((idx, output));
            }
            Err(err) => {
                cancel.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
    }
    Ok(outputs)
}

#[cfg(test)]
pub mod test_support {
    //! Page tasks for exercising executors.

    use std::{
        collections::HashSet,
        sync::Mutex,
        thread::{self, ThreadId},
        time::Duration,
    };

    use super::*;

    /// Records every page it sees, and the threads it ran on.
    #[derive(Default)]
    pub struct RecordingTask {
        pub seen: Mutex<Vec<usize>>,
        pub threads: Mutex<HashSet<ThreadId>>,
        pub limits: Mutex<Vec<Option<u64>>>,
    }

    impl PageTask for RecordingTask {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn run(&self, page: &PageContext) -> Result<PageResult> {
            // Finish pages out of order.
            thread::sleep(Duration::from_millis(
                ((page.document().page_count() - page.pageno()) * 3) as u64,
            ));
            self.seen.lock().expect("lock poisoned").push(page.pageno());
            self.threads
                .lock()
                .expect("lock poisoned")
                .insert(thread::current().id());
            self.limits
                .lock()
                .expect("lock poisoned")
                .push(init::ResourceLimits::current().max_image_pixels);
            Ok(PageResult::new(page.pageno()))
        }
    }

    /// Fails on one particular page.
    pub struct FailingTask {
        pub fail_on: usize,
    }

    impl PageTask for FailingTask {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, page: &PageContext) -> Result<PageResult> {
            if page.pageno() == self.fail_on {
                bail!("could not recognize text")
            }
            Ok(PageResult::new(page.pageno()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{test_support::*, *};
    use crate::{
        context::test_support::{blank_metadata, document},
        errors::{ErrorClass, classify_error},
        options::PipelineOptions,
        page_result::sort_by_page,
    };

    fn contexts(page_count: usize) -> Result<Vec<PageContext>> {
        let options = PipelineOptions::for_tests("in.pdf");
        document(options, Path::new("/tmp/work"), blank_metadata(page_count))
            .page_contexts()
    }

    fn execute_options(max_workers: usize) -> ExecuteOptions {
        ExecuteOptions {
            backend: Backend::new(true),
            max_workers,
            progress: ProgressOptions::per_task(0, "Testing", "Tested").with_disable(true),
            worker_init: WorkerInit {
                max_image_pixels: Some(123),
            },
        }
    }

    #[test]
    fn worker_count_is_capped_by_task_count() {
        assert_eq!(Executor::effective_workers(8, 3), 3);
        assert_eq!(Executor::effective_workers(2, 10), 2);
        assert_eq!(Executor::effective_workers(4, 0), 0);
    }

    #[tokio::test]
    async fn each_page_runs_exactly_once_for_any_worker_count() -> Result<()> {
        for max_workers in [1, 2, 3, 8] {
            let executor = Executor::new(Ui::init_for_tests());
            let task = Arc::new(RecordingTask::default());
            let mut results = executor
                .run_pages(&execute_options(max_workers), task.clone(), contexts(5)?)
                .await?;
            let mut seen = task.seen.lock().expect("lock poisoned").clone();
            seen.sort();
            assert_eq!(seen, vec![0, 1, 2, 3, 4], "max_workers = {max_workers}");
            sort_by_page(&mut results);
            assert_eq!(
                results,
                (0..5).map(PageResult::new).collect::<Vec<_>>(),
                "max_workers = {max_workers}"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn one_worker_runs_sequentially_on_one_thread() -> Result<()> {
        let executor = Executor::new(Ui::init_for_tests());
        let task = Arc::new(RecordingTask::default());
        let results = executor
            .run_pages(&execute_options(1), task.clone(), contexts(3)?)
            .await?;
        assert_eq!(task.seen.lock().expect("lock poisoned").clone(), vec![0, 1, 2]);
        assert_eq!(task.threads.lock().expect("lock poisoned").len(), 1);
        let pagenos = results.iter().map(|r| r.pageno).collect::<Vec<_>>();
        assert_eq!(pagenos, vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn workers_see_their_initialized_limits() -> Result<()> {
        let executor = Executor::new(Ui::init_for_tests());
        let task = Arc::new(RecordingTask::default());
        executor
            .run_pages(&execute_options(3), task.clone(), contexts(6)?)
            .await?;
        let limits = task.limits.lock().expect("lock poisoned").clone();
        assert_eq!(limits, vec![Some(123); 6]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_input_returns_immediately() -> Result<()> {
        let executor = Executor::new(Ui::init_for_tests());
        let task = Arc::new(RecordingTask::default());
        let results = executor
            .run_pages(&execute_options(4), task.clone(), vec![])
            .await?;
        assert!(results.is_empty());
        assert!(task.threads.lock().expect("lock poisoned").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn first_failure_is_returned() -> Result<()> {
        for max_workers in [1, 4] {
            let executor = Executor::new(Ui::init_for_tests());
            let err = executor
                .run_pages(
                    &execute_options(max_workers),
                    Arc::new(FailingTask { fail_on: 2 }),
                    contexts(6)?,
                )
                .await
                .unwrap_err();
            assert_eq!(classify_error(&err), ErrorClass::ChildProcess);
            assert!(format!("{err:#}").contains("page 3 failed"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn panicking_tasks_fail_their_page() -> Result<()> {
        struct PanickingTask;

        impl PageTask for PanickingTask {
            fn name(&self) -> &'static str {
                "panicking"
            }

            fn run(&self, page: &PageContext) -> Result<PageResult> {
                if page.pageno() == 1 {
                    panic!("decoder exploded");
                }
                Ok(PageResult::new(page.pageno()))
            }
        }

        for max_workers in [1, 3] {
            let executor = Executor::new(Ui::init_for_tests());
            let err = executor
                .run_pages(&execute_options(max_workers), Arc::new(PanickingTask), contexts(4)?)
                .await
                .unwrap_err();
            assert_eq!(classify_error(&err), ErrorClass::ChildProcess);
            let message = format!("{err:#}");
            assert!(message.contains("page 2 failed"), "{message}");
            assert!(message.contains("decoder exploded"), "{message}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn classified_failures_keep_their_class() -> Result<()> {
        struct MissingToolTask;

        impl PageTask for MissingToolTask {
            fn name(&self) -> &'static str {
                "missing-tool"
            }

            fn run(&self, _page: &PageContext) -> Result<PageResult> {
                Err(PipelineError::MissingDependency {
                    program: "tesseract".to_owned(),
                }
                .into())
            }
        }

        let executor = Executor::new(Ui::init_for_tests());
        let err = executor
            .run_pages(&execute_options(2), Arc::new(MissingToolTask), contexts(2)?)
            .await
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::MissingDependency);
        Ok(())
    }

    #[tokio::test]
    async fn map_blocking_preserves_input_order() -> Result<()> {
        let executor = Executor::new(Ui::init_for_tests());
        let inputs = (0..20).collect::<Vec<u64>>();
        let outputs = executor
            .map_blocking(
                4,
                &ProgressOptions::per_task(20, "Testing", "Tested").with_disable(true),
                inputs,
                |n| {
                    std::thread::sleep(std::time::Duration::from_millis(20 - n));
                    Ok(n * 2)
                },
            )
            .await?;
        assert_eq!(outputs, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn map_blocking_covers_every_input_once() -> Result<()> {
        let executor = Executor::new(Ui::init_for_tests());
        let outputs = executor
            .map_blocking(
                3,
                &ProgressOptions::per_task(7, "Testing", "Tested").with_disable(true),
                (0..7).collect::<Vec<usize>>(),
                Ok,
            )
            .await?;
        assert_eq!(outputs.into_iter().collect::<BTreeSet<_>>().len(), 7);
        Ok(())
    }
}

//! Process-based workers.
//!
//! Each worker is a child process running this same binary in `worker` mode
//! (see [`crate::worker`]). A small async task on our side feeds it one page
//! at a time and forwards its replies. Children are killed when their handle
//! is dropped, so cancelling a run terminates them outright.

use std::{
    ffi::OsString,
    process::Stdio,
    sync::{Arc, Mutex, atomic::Ordering},
    vec,
};

use futures::channel::mpsc;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    process::{ChildStdin, Command},
    task::JoinHandle,
};

use super::{CancelFlag, PageJob, RunPages, fan_in};
use crate::{
    context::PageContext,
    errors::PipelineError,
    page_result::PageResult,
    prelude::*,
    worker::{WorkerHello, WorkerReply},
};

/// A queue of pages shared by all our worker drivers.
type PageQueue = Arc<Mutex<vec::IntoIter<PageContext>>>;

/// Sends finished pages to the coordinator, tagged with a sequence number.
type ResultSender = mpsc::UnboundedSender<(usize, Result<PageResult>)>;

/// Runs pages in worker processes.
pub struct ProcessBackend {
    /// The program to run. Defaults to the current executable.
    program: Option<PathBuf>,
    /// Arguments which put `program` into worker mode.
    args: Vec<OsString>,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".into()],
        }
    }
}

impl ProcessBackend {
    /// Use a custom worker command. The worker ID will be appended as
    /// `--id N`.
    #[cfg(test)]
    pub fn with_command(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: Some(program.into()),
            args: args.iter().map(OsString::from).collect(),
        }
    }

    /// Build the command for a worker.
    fn command(&self, worker_id: usize) -> Result<Command> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .context("could not find our own executable to start workers")?,
        };
        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .arg("--id")
            .arg(worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl RunPages for ProcessBackend {
    fn name(&self) -> &'static str {
        "worker processes"
    }

    async fn run_pages(&self, job: PageJob) -> Result<Vec<PageResult>> {
        let Some(first) = job.contexts.first() else {
            return Ok(vec![]);
        };
        let hello = WorkerHello {
            task: job.task.name().to_owned(),
            init: job.init.clone(),
            document: first.document().as_ref().clone(),
        };
        let hello_line =
            Arc::new(serde_json::to_string(&hello).context("could not serialize worker hello")?);

        let queue: PageQueue = Arc::new(Mutex::new(job.contexts.into_iter()));
        let cancel = CancelFlag::default();
        let (tx, rx) = mpsc::unbounded();

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(job.workers);
        for worker_id in 1..=job.workers {
            let command = self.command(worker_id)?;
            let driver = WorkerDriver {
                worker_id,
                hello_line: hello_line.clone(),
                queue: queue.clone(),
                cancel: cancel.clone(),
                tx: tx.clone(),
            };
            handles.push(tokio::spawn(driver.run(command)));
        }
        // Only the drivers hold senders now, so `fan_in` ends when they do.
        drop(tx);

        let result = fan_in(rx, &job.progress, &cancel).await;
        if result.is_err() {
            // Dropping a driver kills its child process.
            for handle in &handles {
                handle.abort();
            }
        }
        for handle in handles {
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err).context("worker driver panicked"));
                }
            }
        }
        Ok(result?.into_iter().map(|(_, result)| result).collect())
    }
}

/// Feeds pages to one worker process.
struct WorkerDriver {
    worker_id: usize,
    hello_line: Arc<String>,
    queue: PageQueue,
    cancel: CancelFlag,
    tx: ResultSender,
}

impl WorkerDriver {
    /// Run until the queue is empty or the run is cancelled. Any failure is
    /// sent to the coordinator.
    async fn run(self, command: Command) {
        if let Err(err) = self.drive(command).await {
            // If this fails, the coordinator has already given up.
            let _ = self.tx.unbounded_send((usize::MAX, Err(err)));
        }
    }

    #[instrument(level = "debug", skip_all, fields(worker = self.worker_id))]
    async fn drive(&self, mut command: Command) -> Result<()> {
        let mut child = command.spawn().map_err(|err| {
            PipelineError::ChildProcess(format!(
                "could not start worker process {}: {}",
                self.worker_id, err
            ))
        })?;
        let mut stdin = child.stdin.take().context("worker has no stdin")?;
        let stdout = child.stdout.take().context("worker has no stdout")?;
        let mut replies = BufReader::new(stdout).lines();

        write_line(&mut stdin, &self.hello_line).await?;
        while !self.cancel.load(Ordering::SeqCst) {
            // Hold the lock just long enough to take one page.
            let next = self.queue.lock().expect("lock poisoned").next();
            let Some(page) = next else {
                break;
            };
            let pageno = page.pageno();
            let assignment = serde_json::to_string(&page.assignment())
                .context("could not serialize page assignment")?;
            write_line(&mut stdin, &assignment).await?;

            let line = replies
                .next_line()
                .await
                .map_err(|err| {
                    PipelineError::ChildProcess(format!(
                        "could not read from worker {}: {}",
                        self.worker_id, err
                    ))
                })?
                .ok_or_else(|| {
                    PipelineError::ChildProcess(format!(
                        "worker {} exited while processing page {}",
                        self.worker_id,
                        pageno + 1
                    ))
                })?;
            let reply: WorkerReply = serde_json::from_str(&line).map_err(|err| {
                PipelineError::ChildProcess(format!(
                    "worker {} sent an unreadable reply: {}",
                    self.worker_id, err
                ))
            })?;
            let result = reply.into_result(pageno);
            let failed = result.is_err();
            if self.tx.unbounded_send((pageno, result)).is_err() || failed {
                break;
            }
        }

        // Closing stdin tells the worker to exit.
        drop(stdin);
        let status = child
            .wait()
            .await
            .context("could not wait for worker process")?;
        if !status.success() {
            return Err(PipelineError::ChildProcess(format!(
                "worker {} exited with {}",
                self.worker_id, status
            ))
            .into());
        }
        Ok(())
    }
}

/// Write a line to a worker. A worker which has hung up on us has most
/// likely died.
async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    let written = async {
        stdin.write_all(&buf).await?;
        stdin.flush().await
    };
    written.await.map_err(|err| {
        PipelineError::ChildProcess(format!("could not write to worker process: {}", err))
    })?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        context::test_support::{blank_metadata, document},
        errors::{ErrorClass, classify_error},
        executor::{Progress, ProgressOptions, WorkerInit},
        options::PipelineOptions,
        page_result::sort_by_page,
        tasks::HocrTask,
        ui::Ui,
    };

    /// A stand-in worker which answers every assignment with an empty
    /// result for the same page.
    const ECHO_WORKER: &str = r#"
        read hello
        while read line; do
            n=$(echo "$line" | sed 's/.*"pageno":\([0-9]*\).*/\1/')
            echo "{\"Done\":{\"pageno\":$n,\"pdf_page_from_image\":null,\"hocr\":null,\"textpdf\":null,\"orientation_correction\":null,\"skipped\":false}}"
        done
    "#;

    /// A stand-in worker which fails the first page straight away, and
    /// hangs on every other page.
    const STALLING_WORKER: &str = r#"
        read hello
        while read line; do
            n=$(echo "$line" | sed 's/.*"pageno":\([0-9]*\).*/\1/')
            if [ "$n" = 0 ]; then
                echo '{"Failed":{"message":"no text layer","error":null}}'
            else
                exec sleep 30
            fi
        done
    "#;

    fn job(page_count: usize, workers: usize, progress: Progress) -> Result<PageJob> {
        let options = PipelineOptions::for_tests("in.pdf");
        let contexts = document(options, Path::new("/tmp/work"), blank_metadata(page_count))
            .page_contexts()?;
        Ok(PageJob {
            task: Arc::new(HocrTask),
            contexts,
            workers,
            init: WorkerInit::default(),
            progress,
        })
    }

    fn hidden_progress(total: usize) -> Progress {
        Progress::new(
            &Ui::init_for_tests(),
            &ProgressOptions::per_task(total, "Testing", "Tested").with_disable(true),
        )
    }

    #[tokio::test]
    async fn processes_cover_every_page() -> Result<()> {
        // `sh -c SCRIPT worker` sets `$0`, and `--id N` become `$1` and `$2`.
        let backend = ProcessBackend::with_command("sh", &["-c", ECHO_WORKER, "worker"]);
        let progress = hidden_progress(7);
        let mut results = backend.run_pages(job(7, 3, progress.clone())?).await?;
        sort_by_page(&mut results);
        assert_eq!(results, (0..7).map(PageResult::new).collect::<Vec<_>>());
        assert_eq!(progress.position(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn dead_workers_are_child_process_errors() -> Result<()> {
        let backend = ProcessBackend::with_command("sh", &["-c", "exit 1", "worker"]);
        let err = backend
            .run_pages(job(3, 2, hidden_progress(3))?)
            .await
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::ChildProcess);
        Ok(())
    }

    #[tokio::test]
    async fn missing_worker_program_is_child_process_error() -> Result<()> {
        let backend =
            ProcessBackend::with_command("/nonexistent/page-pipeline-worker", &["worker"]);
        let err = backend
            .run_pages(job(2, 2, hidden_progress(2))?)
            .await
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::ChildProcess);
        Ok(())
    }

    #[tokio::test]
    async fn first_failure_kills_busy_workers() -> Result<()> {
        let backend = ProcessBackend::with_command("sh", &["-c", STALLING_WORKER, "worker"]);
        let started = std::time::Instant::now();
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(15),
            backend.run_pages(job(3, 3, hidden_progress(3))?),
        )
        .await
        .context("busy workers were not killed")?
        .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::ChildProcess);
        assert!(err.to_string().contains("page 1 failed"), "{err:#}");
        assert!(started.elapsed() < std::time::Duration::from_secs(15));
        Ok(())
    }
}

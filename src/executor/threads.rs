//! Thread-based workers.
//!
//! Each worker is a single long-running job on Tokio's blocking thread pool.
//! Workers pull inputs from a shared queue until it is empty, or until the
//! run is cancelled. A task already running on a thread can't be
//! interrupted, so cancellation takes effect once the current task returns.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, atomic::Ordering},
};

use futures::channel::mpsc;

use super::{
    CancelFlag, PageJob, RunPages, fan_in, init::WorkerInit, progress::Progress, run_page,
};
use crate::{
    async_utils::{JoinWorker, panic_message, spawn_blocking_propagating_panics},
    page_result::PageResult,
    prelude::*,
};

/// Runs pages on threads in this process.
pub struct ThreadBackend;

#[async_trait]
impl RunPages for ThreadBackend {
    fn name(&self) -> &'static str {
        "threads"
    }

    async fn run_pages(&self, job: PageJob) -> Result<Vec<PageResult>> {
        let PageJob {
            task,
            contexts,
            workers,
            init,
            progress,
        } = job;
        let outputs = run_pool(contexts, workers, init, progress, move |_, page| {
            run_page(task.as_ref(), &page)
        })
        .await?;
        Ok(outputs.into_iter().map(|(_, result)| result).collect())
    }
}

/// Run `f` over `inputs` using `workers` threads. Outputs are tagged with
/// the index of their input, and returned in the order they finished.
pub async fn run_pool<I, O, F>(
    inputs: Vec<I>,
    workers: usize,
    init: WorkerInit,
    progress: Progress,
    f: F,
) -> Result<Vec<(usize, O)>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(usize, I) -> Result<O> + Send + Sync + 'static,
{
    let queue = Arc::new(Mutex::new(inputs.into_iter().enumerate()));
    let cancel = CancelFlag::default();
    let f = Arc::new(f);
    let (tx, rx) = mpsc::unbounded();

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 1..=workers {
        let queue = queue.clone();
        let cancel = cancel.clone();
        let init = init.clone();
        let f = f.clone();
        let tx = tx.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = init.apply(worker_id);
            while !cancel.load(Ordering::SeqCst) {
                // Hold the lock just long enough to take one input.
                let next = queue.lock().expect("lock poisoned").next();
                let Some((idx, input)) = next else {
                    break;
                };
                // A panic becomes an ordinary failure, so it cancels the run
                // like any other.
                let output = catch_unwind(AssertUnwindSafe(|| f(idx, input)))
                    .unwrap_or_else(|payload| {
                        Err(anyhow!("input {} panicked: {}", idx, panic_message(&*payload)))
                    });
                if tx.unbounded_send((idx, output)).is_err() {
                    // Nobody is listening any more.
                    break;
                }
            }
            trace!("Worker {} finished", worker_id);
            Ok(())
        });
        handles.push(JoinWorker::from_handle(handle));
    }
    // Only the workers hold senders now, so `fan_in` ends when they do.
    drop(tx);

    let result = fan_in(rx, &progress, &cancel).await;

    // Wait for every worker to stop before we return, even on failure.
    for handle in handles {
        handle.join().await?;
    }
    result
}

/// Run `f` over `inputs` one at a time, on a single blocking thread.
pub async fn run_sequential<I, O, F>(
    inputs: Vec<I>,
    init: WorkerInit,
    progress: Progress,
    f: F,
) -> Result<Vec<(usize, O)>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(usize, I) -> Result<O> + Send + 'static,
{
    spawn_blocking_propagating_panics(move || {
        let _guard = init.apply(1);
        let mut outputs = Vec::with_capacity(inputs.len());
        for (idx, input) in inputs.into_iter().enumerate() {
            outputs.push((idx, f(idx, input)?));
            progress.task_done();
        }
        Ok(outputs)
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{executor::ProgressOptions, ui::Ui};

    fn hidden_progress(total: usize) -> Progress {
        Progress::new(
            &Ui::init_for_tests(),
            &ProgressOptions::per_task(total, "Testing", "Tested").with_disable(true),
        )
    }

    #[tokio::test]
    async fn progress_matches_completed_tasks() -> Result<()> {
        let progress = hidden_progress(10);
        let outputs =
            run_pool((0..10).collect(), 3, WorkerInit::default(), progress.clone(), |_, n: u32| {
                Ok(n + 1)
            })
            .await?;
        assert_eq!(outputs.len(), 10);
        assert_eq!(progress.position(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn failure_stops_new_work() -> Result<()> {
        let started = Arc::new(AtomicUsize::new(0));
        let started_clone = started.clone();
        let result = run_pool(
            (0..1000).collect::<Vec<usize>>(),
            2,
            WorkerInit::default(),
            hidden_progress(1000),
            move |idx, _| {
                started_clone.fetch_add(1, Ordering::SeqCst);
                if idx == 3 {
                    bail!("failed on {}", idx)
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
                Ok(())
            },
        )
        .await;
        assert!(result.is_err());
        assert!(started.load(Ordering::SeqCst) < 1000);
        Ok(())
    }

    #[tokio::test]
    async fn panics_stop_new_work() -> Result<()> {
        let started = Arc::new(AtomicUsize::new(0));
        let started_clone = started.clone();
        let result = run_pool(
            (0..200).collect::<Vec<usize>>(),
            2,
            WorkerInit::default(),
            hidden_progress(200),
            move |idx, _| {
                started_clone.fetch_add(1, Ordering::SeqCst);
                if idx == 3 {
                    panic!("boom on {}", idx);
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("boom on 3"), "{err:#}");
        assert!(started.load(Ordering::SeqCst) < 200);
        Ok(())
    }

    #[tokio::test]
    async fn sequential_stops_at_first_failure() -> Result<()> {
        let progress = hidden_progress(5);
        let result = run_sequential(
            (0..5).collect::<Vec<usize>>(),
            WorkerInit::default(),
            progress.clone(),
            |idx, _| {
                if idx == 2 {
                    bail!("failed")
                }
                Ok(idx)
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(progress.position(), 2);
        Ok(())
    }
}

//! Progress reporting for executor runs.
//!
//! Progress is purely observational: a hidden progress bar counts exactly the
//! same way as a visible one, and neither affects scheduling.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use indicatif::ProgressBar;

use crate::ui::{ProgressConfig, Ui};

/// How to report progress for a run.
#[derive(Clone, Debug)]
pub struct ProgressOptions {
    /// Total number of units we expect to complete.
    pub total: u64,
    /// How many units each completed task is worth.
    pub increment: u64,
    /// Description shown while running.
    pub desc: String,
    /// Description shown once done.
    pub done_desc: String,
    /// Hide the progress bar.
    pub disable: bool,
}

impl ProgressOptions {
    /// One unit per task, for `task_count` tasks.
    pub fn per_task(task_count: usize, desc: &str, done_desc: &str) -> Self {
        Self {
            total: task_count as u64,
            increment: 1,
            desc: desc.to_owned(),
            done_desc: done_desc.to_owned(),
            disable: false,
        }
    }

    /// Show or hide the progress bar.
    pub fn with_disable(mut self, disable: bool) -> Self {
        self.disable = disable;
        self
    }
}

/// A progress counter which only moves forward and never passes its total.
#[derive(Clone)]
pub struct Progress {
    bar: ProgressBar,
    position: Arc<AtomicU64>,
    total: u64,
    increment: u64,
}

impl Progress {
    /// Create a new progress counter, with a bar if one is wanted.
    pub fn new(ui: &Ui, options: &ProgressOptions) -> Self {
        let bar = if options.disable {
            ProgressBar::hidden()
        } else {
            ui.new_progress_bar(
                &ProgressConfig {
                    emoji: "📄",
                    msg: &options.desc,
                    done_msg: &options.done_desc,
                },
                options.total,
            )
        };
        Self {
            bar,
            position: Arc::new(AtomicU64::new(0)),
            total: options.total,
            increment: options.increment,
        }
    }

    /// Record that one task has completed. Safe to call from any thread.
    pub fn task_done(&self) {
        let (total, increment) = (self.total, self.increment);
        let previous = self
            .position
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pos| {
                Some(pos.saturating_add(increment).min(total))
            })
            .unwrap_or_else(|pos| pos);
        self.bar
            .set_position(previous.saturating_add(increment).min(total));
    }

    /// How many units have been completed so far?
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    /// Finish the progress bar.
    pub fn finish(&self) {
        self.bar.finish_using_style();
    }

    /// Abandon the progress bar, leaving it where it is.
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

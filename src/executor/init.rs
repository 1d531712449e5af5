//! Per-worker initialization.
//!
//! Some settings, like the largest image we're willing to decode, belong to a
//! worker rather than to a task. We pass them to each worker as a
//! [`WorkerInit`] value, and the worker applies them once, before its first
//! task. They stay fixed for the worker's lifetime.

use std::cell::Cell;

use tracing::span::EnteredSpan;

use crate::prelude::*;

thread_local! {
    /// Limits for the worker running on this thread.
    static WORKER_LIMITS: Cell<ResourceLimits> = const { Cell::new(ResourceLimits::UNLIMITED) };
}

/// Resource limits in force for a worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// The largest image we'll decode, in pixels.
    pub max_image_pixels: Option<u64>,
}

impl ResourceLimits {
    /// No limits at all.
    pub const UNLIMITED: Self = Self {
        max_image_pixels: None,
    };

    /// The limits for the worker running on this thread.
    pub fn current() -> Self {
        WORKER_LIMITS.with(Cell::get)
    }

    /// Refuse to decode images larger than our limit. This protects us from
    /// decompression bombs.
    pub fn check_image_pixels(&self, pixels: u64) -> Result<()> {
        match self.max_image_pixels {
            Some(limit) if pixels > limit => Err(anyhow!(
                "image of {} pixels exceeds limit of {} pixels",
                pixels,
                limit
            )),
            _ => Ok(()),
        }
    }
}

/// Settings applied once by each worker, before its first task.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct WorkerInit {
    /// The largest image we'll decode, in pixels.
    pub max_image_pixels: Option<u64>,
}

impl WorkerInit {
    /// Apply our settings to the current thread, and tag its log output
    /// with `worker_id`. Everything is undone when the guard is dropped.
    pub fn apply(&self, worker_id: usize) -> WorkerGuard {
        let span = tracing::info_span!("worker", id = worker_id).entered();
        let limits = ResourceLimits {
            max_image_pixels: self.max_image_pixels,
        };
        WORKER_LIMITS.with(|cell| cell.set(limits));
        trace!(?limits, "Initialized worker");
        WorkerGuard { _span: span }
    }
}

/// Keeps a worker's settings in force until dropped.
pub struct WorkerGuard {
    _span: EnteredSpan,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        WORKER_LIMITS.with(|cell| cell.set(ResourceLimits::UNLIMITED));
    }
}

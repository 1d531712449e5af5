//! The temporary folder a pipeline run works in.
//!
//! A [`WorkFolder`] is created before any worker starts, and released exactly
//! once when the run ends. Release happens either explicitly via
//! [`WorkFolder::release`], or when the guard is dropped, which covers early
//! returns, errors and panics.

use tempfile::TempDir;

use crate::prelude::*;

/// Prefix used for work folder names.
const WORK_FOLDER_PREFIX: &str = "page-pipeline.";

/// Where the snapshot of the input document lives, relative to the work
/// folder.
pub const ORIGIN_FILE_NAME: &str = "origin.pdf";

/// Where the run summary lives, relative to the work folder.
pub const RESULTS_FILE_NAME: &str = "results.json";

/// A uniquely named temporary directory, deleted when released unless we've
/// been asked to retain it.
#[derive(Debug)]
pub struct WorkFolder {
    /// The directory. `None` once released.
    dir: Option<TempDir>,
    /// A copy of the directory's path, which stays valid after release.
    path: PathBuf,
    /// Should we keep the directory around when we're done?
    retain: bool,
}

impl WorkFolder {
    /// Create a fresh work folder inside `base_hint`, or inside the system
    /// temporary directory if no hint is given.
    #[instrument(level = "debug", skip_all)]
    pub fn acquire(base_hint: Option<&Path>, retain: bool) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORK_FOLDER_PREFIX);
        let dir = match base_hint {
            Some(base) => {
                std::fs::create_dir_all(base).with_context(|| {
                    format!("could not create work folder base {:?}", base.display())
                })?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .context("could not create work folder")?;
        let path = dir.path().to_owned();
        debug!(path = %path.display(), retain, "Acquired work folder");
        Ok(Self {
            dir: Some(dir),
            path,
            retain,
        })
    }

    /// The root of our work folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where we keep our snapshot of the input document.
    pub fn origin_path(&self) -> PathBuf {
        self.path.join(ORIGIN_FILE_NAME)
    }

    /// Where we write the run summary.
    pub fn results_path(&self) -> PathBuf {
        self.path.join(RESULTS_FILE_NAME)
    }

    /// Release the folder. Returns the folder's location if it was retained.
    pub fn release(mut self) -> Result<Option<PathBuf>> {
        self.release_inner()
    }

    /// Shared by [`WorkFolder::release`] and [`Drop`]. Does nothing the
    /// second time around.
    fn release_inner(&mut self) -> Result<Option<PathBuf>> {
        let Some(dir) = self.dir.take() else {
            return Ok(None);
        };
        if self.retain {
            let path = dir.keep();
            info!("Temporary working files retained at: {}", path.display());
            Ok(Some(path))
        } else {
            dir.close().with_context(|| {
                format!("could not remove work folder {:?}", self.path.display())
            })?;
            debug!(path = %self.path.display(), "Removed work folder");
            Ok(None)
        }
    }
}

impl Drop for WorkFolder {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!("{:?}", err);
        }
    }
}

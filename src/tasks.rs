//! Page tasks, and the registry we look them up in.
//!
//! Worker processes can't receive a function from their coordinator, so
//! every task that may run on the process backend must be registered here
//! under a stable name. The coordinator sends the name, and the worker looks
//! the task up in its own copy of the registry.

use std::{collections::BTreeMap, fmt, fs, sync::Arc};

use crate::{
    context::PageContext,
    errors::PipelineError,
    executor::init::ResourceLimits,
    page_result::{ArtifactRole, PageResult},
    prelude::*,
};

/// The resolution at which we assume pages will be rendered.
pub const RENDER_DPI: f64 = 300.0;

/// A function run once per page.
///
/// Tasks run on blocking worker threads, so they may take as long as they
/// like and call blocking APIs freely.
pub trait PageTask: Send + Sync + 'static {
    /// The name used to look this task up in a [`TaskRegistry`].
    fn name(&self) -> &'static str;

    /// Process a single page.
    fn run(&self, page: &PageContext) -> Result<PageResult>;
}

/// Known page tasks, by name.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, Arc<dyn PageTask>>,
}

impl TaskRegistry {
    /// A registry with no tasks at all.
    pub fn empty() -> Self {
        Self {
            tasks: BTreeMap::new(),
        }
    }

    /// Add a task, replacing any task with the same name.
    pub fn register(&mut self, task: Arc<dyn PageTask>) {
        self.tasks.insert(task.name(), task);
    }

    /// Look up a task.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PageTask>> {
        self.tasks.get(name).cloned()
    }

    /// Look up a task, failing if it doesn't exist.
    pub fn require(&self, name: &str) -> Result<Arc<dyn PageTask>> {
        self.get(name).ok_or_else(|| {
            PipelineError::BadArgs(format!("unknown task {:?}", name)).into()
        })
    }

    /// The names of all registered tasks.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.keys().copied()
    }
}

/// The default registry has all our built-in tasks.
impl Default for TaskRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(HocrTask));
        registry
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Produce the hOCR text layer for a page.
///
/// Recognition itself is done by an external engine which isn't wired in
/// yet. For now we check the page against the worker's resource limits and
/// write an hOCR page with the right geometry but no words.
pub struct HocrTask;

impl PageTask for HocrTask {
    fn name(&self) -> &'static str {
        "hocr"
    }

    fn run(&self, page: &PageContext) -> Result<PageResult> {
        if page.overrides().skip {
            debug!("Skipping page");
            return Ok(PageResult::skipped(page.pageno()));
        }
        let info = page.page_info();
        ResourceLimits::current().check_image_pixels(info.pixels_at_dpi(RENDER_DPI))?;

        let (width, height) = info.size_at_dpi(RENDER_DPI);
        let path = page.artifact_path(ArtifactRole::Hocr);
        fs::write(&path, empty_hocr_page(page.pageno(), width, height))
            .with_context(|| format!("could not write {}", path.display()))?;
        trace!(path = %path.display(), "Wrote hOCR");

        // Results name artifacts relative to the work folder.
        Ok(PageResult::new(page.pageno())
            .with_artifact(ArtifactRole::Hocr, ArtifactRole::Hocr.file_name(page.pageno())))
    }
}

/// An hOCR document for a page of `width` x `height` pixels, with no
/// recognized words.
fn empty_hocr_page(pageno: usize, width: u64, height: u64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Transitional//EN"
    "http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd">
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="en" lang="en">
 <head>
  <title></title>
  <meta http-equiv="Content-Type" content="text/html;charset=utf-8"/>
  <meta name="ocr-system" content="page-pipeline {version}"/>
  <meta name="ocr-capabilities" content="ocr_page"/>
 </head>
 <body>
  <div class="ocr_page" id="page_{id}" title="bbox 0 0 {width} {height}; ppageno {pageno}"></div>
 </body>
</html>
"#,
        version = env!("CARGO_PKG_VERSION"),
        id = pageno + 1,
    )
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        context::{PageOverrides, test_support::*},
        executor::init::WorkerInit,
        options::PipelineOptions,
    };

    #[test]
    fn default_registry_has_hocr() {
        let registry = TaskRegistry::default();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["hocr"]);
        assert!(registry.require("hocr").is_ok());
        assert!(registry.require("missing").is_err());
    }

    #[test]
    fn hocr_writes_an_empty_page() -> Result<()> {
        let dir = TempDir::new()?;
        let options = PipelineOptions::for_tests("in.pdf");
        let doc = document(options, dir.path(), blank_metadata(3));
        let page = PageContext::new(doc, 2, PageOverrides::default())?;
        let result = HocrTask.run(&page)?;
        assert_eq!(
            result,
            PageResult::new(2).with_artifact(ArtifactRole::Hocr, "000003_ocr_hocr.hocr")
        );
        result.check_artifacts_within(dir.path())?;

        let hocr = std::fs::read_to_string(dir.path().join("000003_ocr_hocr.hocr"))?;
        assert!(hocr.contains(r#"title="bbox 0 0 2550 3300; ppageno 2""#), "{hocr}");
        Ok(())
    }

    #[test]
    fn hocr_fails_when_the_work_folder_is_gone() -> Result<()> {
        let dir = TempDir::new()?;
        let options = PipelineOptions::for_tests("in.pdf");
        let doc = document(options, &dir.path().join("missing"), blank_metadata(1));
        let page = PageContext::new(doc, 0, PageOverrides::default())?;
        assert!(HocrTask.run(&page).is_err());
        Ok(())
    }

    #[test]
    fn hocr_marks_skipped_pages() -> Result<()> {
        let options = PipelineOptions::for_tests("in.pdf");
        let doc = document(options, Path::new("/tmp/work"), blank_metadata(1));
        let page = PageContext::new(doc, 0, PageOverrides { skip: true })?;
        assert_eq!(HocrTask.run(&page)?, PageResult::skipped(0));
        Ok(())
    }

    #[test]
    fn hocr_respects_worker_image_limit() -> Result<()> {
        let options = PipelineOptions::for_tests("in.pdf");
        let doc = document(options, Path::new("/tmp/work"), blank_metadata(1));
        let page = PageContext::new(doc, 0, PageOverrides::default())?;
        let _guard = WorkerInit {
            max_image_pixels: Some(1000),
        }
        .apply(1);
        assert!(HocrTask.run(&page).is_err());
        Ok(())
    }
}

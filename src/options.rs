//! Options for a pipeline run.

use std::ops::RangeInclusive;

use clap::{ArgAction, Args};
use schemars::JsonSchema;

use crate::{errors::PipelineError, prelude::*, tasks::TaskRegistry};

/// The default limit on decoded image size, in megapixels.
pub const DEFAULT_MAX_IMAGE_MPIXELS: f64 = 250.0;

/// Default number of jobs: one per CPU.
fn default_jobs() -> usize {
    num_cpus::get()
}

/// Options for a pipeline run. These are fixed once the run starts, and are
/// shipped to worker processes along with the rest of the document context.
#[derive(Args, Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct PipelineOptions {
    /// The PDF file to process.
    #[clap(value_name = "INPUT")]
    pub input_file: PathBuf,

    /// Create the temporary work folder inside this directory.
    #[clap(long)]
    pub output_folder: Option<PathBuf>,

    /// Maximum number of pages to process at a time.
    #[clap(short = 'j', long, env = "PAGE_PIPELINE_JOBS", default_value_t = default_jobs())]
    pub jobs: usize,

    /// Process pages on threads in this process, instead of in worker
    /// processes.
    #[clap(long, env = "PAGE_PIPELINE_USE_THREADS")]
    pub use_threads: bool,

    /// Disable the progress bar.
    #[clap(long = "no-progress-bar", action = ArgAction::SetFalse)]
    pub progress_bar: bool,

    /// Keep the temporary work folder when we're done, and print where it is.
    #[clap(short = 'k', long)]
    pub keep_temporary_files: bool,

    /// Refuse to decode page images larger than this many megapixels. Use 0
    /// to disable the limit.
    #[clap(long, default_value_t = DEFAULT_MAX_IMAGE_MPIXELS)]
    pub max_image_mpixels: f64,

    /// Process every page, even pages that already have text.
    #[clap(long)]
    pub force_ocr: bool,

    /// Pass over pages that already have text.
    #[clap(long)]
    pub skip_text: bool,

    /// Replace existing recognized text.
    #[clap(long)]
    pub redo_ocr: bool,

    /// Only process these pages, e.g. `1-3,7`. Page numbers start at 1.
    #[clap(long)]
    pub pages: Option<String>,

    /// The page task to run.
    #[clap(long, default_value = "hocr")]
    pub task: String,
}

impl PipelineOptions {
    /// Options with default values for everything but the input.
    #[cfg(test)]
    pub fn for_tests(input_file: impl Into<PathBuf>) -> Self {
        Self {
            input_file: input_file.into(),
            output_folder: None,
            jobs: 2,
            use_threads: true,
            progress_bar: false,
            keep_temporary_files: false,
            max_image_mpixels: DEFAULT_MAX_IMAGE_MPIXELS,
            force_ocr: false,
            skip_text: false,
            redo_ocr: false,
            pages: None,
            task: "hocr".to_owned(),
        }
    }

    /// Check that our options make sense by themselves, before we look at
    /// any document.
    pub fn check_options(&self, registry: &TaskRegistry) -> Result<()> {
        let modes = [self.force_ocr, self.skip_text, self.redo_ocr];
        if modes.iter().filter(|&&set| set).count() > 1 {
            return Err(PipelineError::BadArgs(
                "choose only one of --force-ocr, --skip-text, --redo-ocr".to_owned(),
            )
            .into());
        }
        if self.jobs == 0 {
            return Err(PipelineError::BadArgs("--jobs must be at least 1".to_owned()).into());
        }
        if !self.max_image_mpixels.is_finite() || self.max_image_mpixels < 0.0 {
            return Err(PipelineError::BadArgs(
                "--max-image-mpixels must be a non-negative number".to_owned(),
            )
            .into());
        }
        if registry.get(&self.task).is_none() {
            return Err(PipelineError::BadArgs(format!(
                "unknown task {:?} (available: {})",
                self.task,
                registry.names().collect::<Vec<_>>().join(", ")
            ))
            .into());
        }
        self.page_selection()?;
        Ok(())
    }

    /// Parse `--pages`, if present.
    pub fn page_selection(&self) -> Result<Option<PageSelection>> {
        self.pages
            .as_deref()
            .map(PageSelection::parse)
            .transpose()
    }

    /// Our image size limit in pixels, or `None` if there is no limit.
    pub fn max_image_pixels(&self) -> Option<u64> {
        if self.max_image_mpixels > 0.0 {
            Some((self.max_image_mpixels * 1_000_000.0) as u64)
        } else {
            None
        }
    }

    /// Should pages that already have text be left alone?
    pub fn passes_over_text_pages(&self) -> bool {
        self.skip_text
    }

    /// Is it OK to process pages that already have text?
    pub fn allows_text_pages(&self) -> bool {
        self.force_ocr || self.skip_text || self.redo_ocr
    }
}

/// A set of pages selected by the user, stored as ranges of 0-based
/// indices. Ranges are never expanded, so `1-1000000000` costs nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSelection {
    ranges: Vec<RangeInclusive<usize>>,
}

impl PageSelection {
    /// Parse a selection like `1-3,7`. Page numbers start at 1.
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = |reason: &str| {
            anyhow::Error::new(PipelineError::BadArgs(format!(
                "invalid --pages {:?}: {}",
                spec, reason
            )))
        };
        let mut ranges = vec![];
        for part in spec.split(',').map(str::trim) {
            if part.is_empty() {
                return Err(bad("empty page range"));
            }
            let range = match part.split_once('-') {
                Some((first, last)) => parse_page_number(first).and_then(|first| {
                    parse_page_number(last).map(|last| first..=last)
                }),
                None => parse_page_number(part).map(|page| page..=page),
            }
            .ok_or_else(|| bad("page numbers must be positive integers"))?;
            if range.is_empty() {
                return Err(bad("page ranges must not run backwards"));
            }
            ranges.push(to_indices(range));
        }
        Ok(Self { ranges })
    }

    /// Is the page with this 0-based index selected?
    pub fn contains(&self, pageno: usize) -> bool {
        self.ranges.iter().any(|range| range.contains(&pageno))
    }

    /// The highest selected 0-based index.
    pub fn last(&self) -> Option<usize> {
        self.ranges.iter().map(|range| *range.end()).max()
    }
}

/// Parse a 1-based page number.
fn parse_page_number(s: &str) -> Option<usize> {
    s.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

/// Convert a range of 1-based page numbers to 0-based indices.
fn to_indices(range: RangeInclusive<usize>) -> RangeInclusive<usize> {
    (range.start() - 1)..=(range.end() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorClass, classify_error};

    #[test]
    fn page_selection_parses_ranges_and_singletons() -> Result<()> {
        let selection = PageSelection::parse("1-3, 7")?;
        assert!(selection.contains(0));
        assert!(selection.contains(2));
        assert!(!selection.contains(3));
        assert!(selection.contains(6));
        assert_eq!(selection.last(), Some(6));
        Ok(())
    }

    #[test]
    fn huge_page_ranges_are_cheap() -> Result<()> {
        let selection = PageSelection::parse("2-1000000000000, 5")?;
        assert!(!selection.contains(0));
        assert!(selection.contains(1));
        assert!(selection.contains(999_999_999_999));
        assert!(!selection.contains(1_000_000_000_000));
        assert_eq!(selection.last(), Some(999_999_999_999));
        Ok(())
    }

    #[test]
    fn page_selection_rejects_nonsense() {
        for spec in ["", "0", "3-1", "a", "1,,2", "-2"] {
            let err = PageSelection::parse(spec).unwrap_err();
            assert_eq!(classify_error(&err), ErrorClass::BadArgs, "{spec:?}");
        }
    }

    #[test]
    fn conflicting_modes_are_bad_args() {
        let mut options = PipelineOptions::for_tests("in.pdf");
        options.force_ocr = true;
        options.skip_text = true;
        let err = options
            .check_options(&TaskRegistry::default())
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::BadArgs);
    }

    #[test]
    fn unknown_tasks_are_bad_args() {
        let mut options = PipelineOptions::for_tests("in.pdf");
        options.task = "nope".to_owned();
        let err = options
            .check_options(&TaskRegistry::default())
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::BadArgs);
    }

    #[test]
    fn zero_jobs_are_bad_args() {
        let mut options = PipelineOptions::for_tests("in.pdf");
        options.jobs = 0;
        assert!(options.check_options(&TaskRegistry::default()).is_err());
    }

    #[test]
    fn image_limit_can_be_disabled() {
        let mut options = PipelineOptions::for_tests("in.pdf");
        assert_eq!(options.max_image_pixels(), Some(250_000_000));
        options.max_image_mpixels = 0.0;
        assert_eq!(options.max_image_pixels(), None);
    }
}

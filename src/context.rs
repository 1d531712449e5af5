//! Document-level and page-level contexts.
//!
//! A [`DocumentContext`] is built once per run, after we've gathered the
//! document's metadata, and never changes afterwards. Every page task gets a
//! [`PageContext`] pointing back at the shared document context.

use std::sync::Arc;

use schemars::JsonSchema;

use crate::{
    options::PipelineOptions,
    page_result::{ArtifactRole, Rotation},
    prelude::*,
    tasks::TaskRegistry,
};

/// What we know about one page of a document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageInfo {
    /// The 0-based index of this page.
    pub pageno: usize,

    /// Page width, in PDF points (1/72 inch).
    pub width_pt: f64,

    /// Page height, in PDF points.
    pub height_pt: f64,

    /// The rotation the PDF asks viewers to apply.
    #[schemars(with = "u16")]
    pub rotation: Rotation,

    /// Does this page already have text?
    pub has_text: bool,
}

impl PageInfo {
    /// Width and height in pixels, if rendered at `dpi`.
    pub fn size_at_dpi(&self, dpi: f64) -> (u64, u64) {
        let scale = dpi / 72.0;
        let width = (self.width_pt * scale).round().max(0.0) as u64;
        let height = (self.height_pt * scale).round().max(0.0) as u64;
        (width, height)
    }

    /// How many pixels would this page have if rendered at `dpi`?
    pub fn pixels_at_dpi(&self, dpi: f64) -> u64 {
        let (width, height) = self.size_at_dpi(dpi);
        width.saturating_mul(height)
    }
}

/// Per-page metadata for a whole document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pages: Vec<PageInfo>,
}

impl DocumentMetadata {
    /// Build document metadata, checking that we have exactly one entry per
    /// page, in order.
    pub fn new(page_count: usize, pages: Vec<PageInfo>) -> Result<Self> {
        if pages.len() != page_count {
            bail!(
                "document has {} pages, but we have metadata for {}",
                page_count,
                pages.len()
            );
        }
        for (expected, page) in pages.iter().enumerate() {
            if page.pageno != expected {
                bail!(
                    "page metadata out of order: expected page index {}, found {}",
                    expected,
                    page.pageno
                );
            }
        }
        Ok(Self { pages })
    }

    /// How many pages does the document have?
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Metadata for every page.
    pub fn pages(&self) -> &[PageInfo] {
        &self.pages
    }
}

/// Everything a page task may need to know about the document it's working
/// on.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DocumentContext {
    /// The options for this run.
    pub options: PipelineOptions,

    /// The root of the work folder.
    pub work_folder: PathBuf,

    /// Our snapshot of the input document, inside the work folder.
    pub origin: PathBuf,

    /// Per-page metadata.
    pub metadata: DocumentMetadata,

    /// Available page tasks. Worker processes build their own copy.
    #[serde(skip)]
    pub registry: Arc<TaskRegistry>,
}

impl DocumentContext {
    /// Create a new document context.
    pub fn new(
        options: PipelineOptions,
        work_folder: PathBuf,
        origin: PathBuf,
        metadata: DocumentMetadata,
        registry: Arc<TaskRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            work_folder,
            origin,
            metadata,
            registry,
        })
    }

    /// How many pages does the document have?
    pub fn page_count(&self) -> usize {
        self.metadata.page_count()
    }

    /// Build one [`PageContext`] for each page, in page order.
    ///
    /// This has no side effects, and may be called as often as needed.
    pub fn page_contexts(self: &Arc<Self>) -> Result<Vec<PageContext>> {
        let selection = self.options.page_selection()?;
        Ok(self
            .metadata
            .pages()
            .iter()
            .map(|page| {
                let unselected = selection
                    .as_ref()
                    .is_some_and(|selection| !selection.contains(page.pageno));
                let text_to_skip =
                    page.has_text && self.options.passes_over_text_pages();
                PageContext {
                    pageno: page.pageno,
                    document: self.clone(),
                    overrides: PageOverrides {
                        skip: unselected || text_to_skip,
                    },
                }
            })
            .collect())
    }

    /// Rebuild a [`PageContext`] from a [`PageAssignment`] received from a
    /// coordinator.
    pub fn context_for(self: &Arc<Self>, assignment: PageAssignment) -> Result<PageContext> {
        PageContext::new(self.clone(), assignment.pageno, assignment.overrides)
    }
}

/// Settings that apply to a single page only.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct PageOverrides {
    /// Leave this page alone.
    pub skip: bool,
}

/// A single page's unit of work.
#[derive(Clone, Debug)]
pub struct PageContext {
    pageno: usize,
    document: Arc<DocumentContext>,
    overrides: PageOverrides,
}

impl PageContext {
    /// Create a page context, checking that `pageno` is a page of `document`.
    pub fn new(
        document: Arc<DocumentContext>,
        pageno: usize,
        overrides: PageOverrides,
    ) -> Result<Self> {
        if pageno >= document.page_count() {
            bail!(
                "page index {} out of range for a {}-page document",
                pageno,
                document.page_count()
            );
        }
        Ok(Self {
            pageno,
            document,
            overrides,
        })
    }

    /// The 0-based page index.
    pub fn pageno(&self) -> usize {
        self.pageno
    }

    /// The document we belong to.
    pub fn document(&self) -> &Arc<DocumentContext> {
        &self.document
    }

    /// Page-specific settings.
    pub fn overrides(&self) -> &PageOverrides {
        &self.overrides
    }

    /// Metadata for our page.
    pub fn page_info(&self) -> &PageInfo {
        // `new` and `page_contexts` both guarantee the page exists.
        &self.document.metadata.pages()[self.pageno]
    }

    /// Where an artifact for this page should be written.
    pub fn artifact_path(&self, role: ArtifactRole) -> PathBuf {
        self.document.work_folder.join(role.file_name(self.pageno))
    }

    /// The part of this context that needs to be sent to a worker process.
    /// The worker already has the document context.
    pub fn assignment(&self) -> PageAssignment {
        PageAssignment {
            pageno: self.pageno,
            overrides: self.overrides.clone(),
        }
    }
}

/// A page, as assigned to a worker process.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PageAssignment {
    pub pageno: usize,
    #[serde(default)]
    pub overrides: PageOverrides,
}

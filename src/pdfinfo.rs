//! Gather document metadata using Poppler's `pdfinfo` and `pdftotext` CLI
//! tools.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    context::{DocumentMetadata, PageInfo},
    errors::PipelineError,
    executor::{Executor, ProgressOptions},
    options::PipelineOptions,
    page_result::Rotation,
    prelude::*,
};

/// Poppler's document information tool.
pub const PDFINFO: &str = "pdfinfo";

/// Poppler's text extraction tool.
pub const PDFTOTEXT: &str = "pdftotext";

/// Matches `Page    1 size: 612 x 792 pts (letter)`.
static PAGE_SIZE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page\s+(\d+)\s+size:\s+([0-9.]+)\s+x\s+([0-9.]+)\s+pts")
        .expect("failed to compile regex")
});

/// Matches `Page    1 rot:  90`.
static PAGE_ROT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page\s+(\d+)\s+rot:\s+(-?\d+)").expect("failed to compile regex")
});

/// Poppler errors it can't recover from. These sometimes arrive with a
/// successful exit status. Syntax errors are left alone, because Poppler
/// usually repairs the file and carries on.
static POPPLER_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:command line|i/o|permission|internal) error\b")
        .expect("failed to compile regex")
});

/// Something which can tell us about a document's pages.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Collect metadata for every page of the document at `path`.
    async fn document_metadata(
        &self,
        path: &Path,
        executor: &Executor,
        options: &PipelineOptions,
    ) -> Result<DocumentMetadata>;
}

/// Reads metadata using Poppler.
#[derive(Debug, Default)]
pub struct PopplerMetadata;

#[async_trait]
impl MetadataSource for PopplerMetadata {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn document_metadata(
        &self,
        path: &Path,
        executor: &Executor,
        options: &PipelineOptions,
    ) -> Result<DocumentMetadata> {
        let pdfinfo = require_program(PDFINFO)?;
        let pdftotext = require_program(PDFTOTEXT)?;

        let properties = parse_properties(&run_pdfinfo(&pdfinfo, path, &[]).await?);
        if properties
            .get("Encrypted")
            .is_some_and(|value| value.starts_with("yes"))
        {
            return Err(PipelineError::InputFile(format!(
                "{} is encrypted",
                path.display()
            ))
            .into());
        }
        let page_count = properties
            .get("Pages")
            .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?
            .parse::<usize>()
            .with_context(|| {
                format!(
                    "failed to parse page count for {:?} from pdfinfo output",
                    path.display()
                )
            })?;
        debug!("Document has {} pages", page_count);
        if page_count == 0 {
            return DocumentMetadata::new(0, vec![]);
        }

        let last = page_count.to_string();
        let boxes = run_pdfinfo(&pdfinfo, path, &["-f", "1", "-l", &last, "-box"]).await?;
        let geometry = parse_page_geometry(&boxes, page_count)?;

        // Each probe is a separate `pdftotext` process, so threads are fine.
        let probe_path = path.to_owned();
        let has_text = executor
            .map_blocking(
                options.jobs,
                &ProgressOptions::per_task(page_count, "Scanning pages", "Scanned pages")
                    .with_disable(!options.progress_bar),
                (0..page_count).collect(),
                move |pageno| page_has_text(&pdftotext, &probe_path, pageno),
            )
            .await?;

        let pages = geometry
            .into_iter()
            .zip(has_text)
            .enumerate()
            .map(|(pageno, ((width_pt, height_pt, rotation), has_text))| PageInfo {
                pageno,
                width_pt,
                height_pt,
                rotation,
                has_text,
            })
            .collect();
        DocumentMetadata::new(page_count, pages)
    }
}

/// Find an external program, or report it as a missing dependency.
pub fn require_program(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| {
        PipelineError::MissingDependency {
            program: name.to_owned(),
        }
        .into()
    })
}

/// Run `pdfinfo` and return its output. Any failure here means we can't read
/// the document.
async fn run_pdfinfo(pdfinfo: &Path, path: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(pdfinfo)
        .args(args)
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure(PDFINFO, &output, Some(&POPPLER_ERROR_REGEX)).map_err(|err| {
        PipelineError::InputFile(format!("could not read {}: {}", path.display(), err))
    })?;
    String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")
}

/// Parse `Key: value` lines from `pdfinfo`.
fn parse_properties(output: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            properties.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    properties
}

/// Parse per-page sizes and rotations from `pdfinfo -f 1 -l N -box`.
fn parse_page_geometry(output: &str, page_count: usize) -> Result<Vec<(f64, f64, Rotation)>> {
    let mut sizes = vec![None; page_count];
    let mut rotations = vec![Rotation::Deg0; page_count];
    let page_index = |page: &str| -> Result<usize> {
        let page = page.parse::<usize>().context("bad page number in pdfinfo output")?;
        if page == 0 || page > page_count {
            bail!("pdfinfo reported page {} of a {}-page document", page, page_count);
        }
        Ok(page - 1)
    };
    for line in output.lines() {
        if let Some(caps) = PAGE_SIZE_REGEX.captures(line) {
            let idx = page_index(&caps[1])?;
            let width = caps[2].parse::<f64>().context("bad page width")?;
            let height = caps[3].parse::<f64>().context("bad page height")?;
            sizes[idx] = Some((width, height));
        } else if let Some(caps) = PAGE_ROT_REGEX.captures(line) {
            let idx = page_index(&caps[1])?;
            let degrees = caps[2].parse::<i32>().context("bad page rotation")?;
            rotations[idx] = Rotation::try_from(degrees.rem_euclid(360) as u16)
                .map_err(|err| anyhow!("page {}: {}", idx + 1, err))?;
        }
    }
    sizes
        .into_iter()
        .zip(rotations)
        .enumerate()
        .map(|(idx, (size, rotation))| {
            let (width, height) =
                size.ok_or_else(|| anyhow!("pdfinfo did not report a size for page {}", idx + 1))?;
            Ok((width, height, rotation))
        })
        .collect()
}

/// Does a page already have extractable text?
fn page_has_text(pdftotext: &Path, path: &Path, pageno: usize) -> Result<bool> {
    let page = (pageno + 1).to_string();
    let output = std::process::Command::new(pdftotext)
        .args(["-q", "-f", &page, "-l", &page])
        .arg(path)
        .arg("-")
        .output()
        .with_context(|| format!("failed to run pdftotext on page {}", page))?;
    check_for_command_failure(PDFTOTEXT, &output, None)?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .chars()
        .any(|c| !c.is_whitespace()))
}

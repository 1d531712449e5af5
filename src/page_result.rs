//! The result of processing a single page.
//!
//! Page results are created inside workers, which may be separate processes,
//! so they need to cross process boundaries intact. Everything here is plain
//! serde data, so any serde format works:
//!
//! - Our JSON form has stable field names, and wraps each path in a tagged
//!   value like `{"Path": "000001_ocr_hocr.hocr"}`. Worker processes and
//!   our output files use this.
//! - Binary formats such as `bincode` round-trip to an equal value too.

use std::{fmt, path::Component};

use schemars::JsonSchema;

use crate::prelude::*;

/// A path to an artifact, tagged so that readers of our JSON can tell it
/// apart from an ordinary string.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub enum ArtifactPath {
    Path(PathBuf),
}

impl ArtifactPath {
    /// Get the underlying path.
    pub fn as_path(&self) -> &Path {
        match self {
            ArtifactPath::Path(path) => path,
        }
    }
}

/// The different kinds of artifact a page task may produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactRole {
    /// A PDF page rebuilt from the rendered page image.
    PdfPageFromImage,
    /// The recognized text layer, as hOCR.
    Hocr,
    /// The recognized text layer, as a text-only PDF page.
    TextPdf,
}

impl ArtifactRole {
    /// All roles, in field order.
    pub const ALL: [ArtifactRole; 3] = [
        ArtifactRole::PdfPageFromImage,
        ArtifactRole::Hocr,
        ArtifactRole::TextPdf,
    ];

    /// The suffix used for files of this role, including the extension.
    fn file_suffix(self) -> &'static str {
        match self {
            ArtifactRole::PdfPageFromImage => "image_layer.pdf",
            ArtifactRole::Hocr => "ocr_hocr.hocr",
            ArtifactRole::TextPdf => "ocr_tess.pdf",
        }
    }

    /// The file name for an artifact of this role.
    ///
    /// Names depend only on the page index and the role, so workers handling
    /// different pages never write to the same file.
    pub fn file_name(self, pageno: usize) -> String {
        format!("{:06}_{}", pageno + 1, self.file_suffix())
    }
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactRole::PdfPageFromImage => "pdf_page_from_image",
            ArtifactRole::Hocr => "hocr",
            ArtifactRole::TextPdf => "textpdf",
        };
        f.write_str(name)
    }
}

/// How far a page had to be rotated to be upright.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// The angle in degrees.
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(format!("rotation must be 0, 90, 180 or 270, not {other}")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// The outcome of processing one page.
///
/// Equality compares every field, paths included.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct PageResult {
    /// The 0-based index of the page.
    pub pageno: usize,

    /// A PDF page rebuilt from the rendered page image.
    pub pdf_page_from_image: Option<ArtifactPath>,

    /// The recognized text layer, as hOCR.
    pub hocr: Option<ArtifactPath>,

    /// The recognized text layer, as a text-only PDF page.
    pub textpdf: Option<ArtifactPath>,

    /// Rotation applied to make the page upright, in degrees.
    #[schemars(with = "Option<u16>")]
    pub orientation_correction: Option<Rotation>,

    /// Was this page passed over without being transformed?
    #[serde(default)]
    pub skipped: bool,
}

impl PageResult {
    /// A result for `pageno` with no artifacts.
    pub fn new(pageno: usize) -> Self {
        Self {
            pageno,
            pdf_page_from_image: None,
            hocr: None,
            textpdf: None,
            orientation_correction: None,
            skipped: false,
        }
    }

    /// A result for a page we deliberately did not process.
    pub fn skipped(pageno: usize) -> Self {
        Self {
            skipped: true,
            ..Self::new(pageno)
        }
    }

    /// Attach an artifact.
    pub fn with_artifact(mut self, role: ArtifactRole, path: impl Into<PathBuf>) -> Self {
        let path = Some(ArtifactPath::Path(path.into()));
        match role {
            ArtifactRole::PdfPageFromImage => self.pdf_page_from_image = path,
            ArtifactRole::Hocr => self.hocr = path,
            ArtifactRole::TextPdf => self.textpdf = path,
        }
        self
    }

    /// Look up an artifact by role.
    pub fn artifact(&self, role: ArtifactRole) -> Option<&Path> {
        let slot = match role {
            ArtifactRole::PdfPageFromImage => &self.pdf_page_from_image,
            ArtifactRole::Hocr => &self.hocr,
            ArtifactRole::TextPdf => &self.textpdf,
        };
        slot.as_ref().map(ArtifactPath::as_path)
    }

    /// Iterate over all the artifacts we have.
    pub fn artifacts(&self) -> impl Iterator<Item = (ArtifactRole, &Path)> + '_ {
        ArtifactRole::ALL
            .into_iter()
            .filter_map(|role| self.artifact(role).map(|path| (role, path)))
    }

    /// Make sure every artifact lives inside `work_folder`.
    ///
    /// Relative paths are taken to be relative to `work_folder`, and may not
    /// climb out of it.
    pub fn check_artifacts_within(&self, work_folder: &Path) -> Result<()> {
        for (role, path) in self.artifacts() {
            let inside = if path.is_absolute() {
                path.starts_with(work_folder)
            } else {
                path.components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
            };
            if !inside {
                bail!(
                    "{} artifact for page {} is outside the work folder: {}",
                    role,
                    self.pageno + 1,
                    path.display()
                );
            }
        }
        Ok(())
    }
}

/// The codec pairs results must survive. Worker processes speak JSON via
/// the reply envelope, so these are only called directly by tests.
#[cfg(test)]
impl PageResult {
    /// Record an orientation correction.
    pub fn with_orientation_correction(mut self, rotation: Rotation) -> Self {
        self.orientation_correction = Some(rotation);
        self
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize page result")
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to deserialize page result")
    }

    /// Serialize to a compact binary form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to encode page result")
    }

    /// Deserialize from the compact binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to decode page result")
    }
}

/// Sort results by page index.
pub fn sort_by_page(results: &mut [PageResult]) {
    results.sort_by_key(|result| result.pageno);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PageResult {
        PageResult::new(1)
            .with_artifact(ArtifactRole::PdfPageFromImage, "a")
            .with_artifact(ArtifactRole::Hocr, "b")
            .with_artifact(ArtifactRole::TextPdf, "c")
            .with_orientation_correction(Rotation::Deg180)
    }

    #[test]
    fn json_form_has_stable_field_names() -> Result<()> {
        let result = sample();
        assert_eq!(
            result.to_json()?,
            r#"{"pageno":1,"pdf_page_from_image":{"Path":"a"},"hocr":{"Path":"b"},"textpdf":{"Path":"c"},"orientation_correction":180,"skipped":false}"#
        );
        assert_eq!(PageResult::from_json(&result.to_json()?)?, result);
        Ok(())
    }

    #[test]
    fn binary_form_round_trips() -> Result<()> {
        let result = sample();
        assert_eq!(PageResult::from_bytes(&result.to_bytes()?)?, result);

        let bare = PageResult::skipped(7);
        assert_eq!(PageResult::from_bytes(&bare.to_bytes()?)?, bare);
        Ok(())
    }

    #[test]
    fn equality_includes_paths() {
        let a = sample();
        let b = sample().with_artifact(ArtifactRole::Hocr, "other");
        assert_ne!(a, b);
        assert_eq!(a, sample());
    }

    #[test]
    fn bad_rotations_are_rejected() {
        let json = r#"{"pageno":0,"pdf_page_from_image":null,"hocr":null,"textpdf":null,"orientation_correction":45}"#;
        assert!(PageResult::from_json(json).is_err());
    }

    #[test]
    fn missing_skipped_field_defaults_to_false() -> Result<()> {
        let json = r#"{"pageno":3,"pdf_page_from_image":null,"hocr":null,"textpdf":null,"orientation_correction":null}"#;
        assert_eq!(PageResult::from_json(json)?, PageResult::new(3));
        Ok(())
    }

    #[test]
    fn artifact_names_depend_on_page_and_role() {
        assert_eq!(ArtifactRole::Hocr.file_name(0), "000001_ocr_hocr.hocr");
        assert_eq!(
            ArtifactRole::PdfPageFromImage.file_name(41),
            "000042_image_layer.pdf"
        );
        assert_ne!(
            ArtifactRole::Hocr.file_name(1),
            ArtifactRole::TextPdf.file_name(1)
        );
    }

    #[test]
    fn artifacts_must_stay_in_work_folder() {
        let root = Path::new("/tmp/work");
        let inside = PageResult::new(0)
            .with_artifact(ArtifactRole::Hocr, "/tmp/work/000001_ocr_hocr.hocr");
        assert!(inside.check_artifacts_within(root).is_ok());

        let relative = PageResult::new(0).with_artifact(ArtifactRole::Hocr, "x.hocr");
        assert!(relative.check_artifacts_within(root).is_ok());

        let escaped =
            PageResult::new(0).with_artifact(ArtifactRole::TextPdf, "../elsewhere.pdf");
        assert!(escaped.check_artifacts_within(root).is_err());

        let absolute =
            PageResult::new(0).with_artifact(ArtifactRole::TextPdf, "/etc/passwd");
        assert!(absolute.check_artifacts_within(root).is_err());
    }

    #[test]
    fn sort_by_page_orders_results() {
        let mut results = vec![PageResult::new(2), PageResult::new(0), PageResult::new(1)];
        sort_by_page(&mut results);
        let pagenos = results.iter().map(|r| r.pageno).collect::<Vec<_>>();
        assert_eq!(pagenos, vec![0, 1, 2]);
    }
}

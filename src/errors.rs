//! Error classes for a pipeline run, and the exit codes we report for them.
//!
//! Most code in this crate returns [`anyhow::Result`]. When a failure belongs
//! to one of the classes below, we put a [`PipelineError`] at the root of the
//! chain and add context on top of it as usual. [`classify_error`] can then
//! find it again, no matter how much context was added.

use std::process::ExitCode;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors that callers may want to tell apart.
///
/// These are serializable, because worker processes send them back to their
/// coordinator.
#[derive(Clone, Debug, Deserialize, Error, Serialize)]
pub enum PipelineError {
    /// The command-line options make no sense.
    #[error("bad arguments: {0}")]
    BadArgs(String),

    /// The input document is missing, unreadable or not a document we
    /// understand.
    #[error("input file error: {0}")]
    InputFile(String),

    /// An external program we need is not installed.
    #[error("missing dependency: {program} was not found on PATH")]
    MissingDependency {
        /// The program we looked for.
        program: String,
    },

    /// The document already has text, and we weren't told what to do about
    /// it.
    #[error("page {pageno} already has text (use --force-ocr, --skip-text or --redo-ocr)")]
    PriorOcrFound {
        /// 1-based page number.
        pageno: usize,
    },

    /// The options conflict with something we learned about the document.
    #[error("option {option} conflicts with the document: {reason}")]
    Validation {
        /// The option at fault.
        option: String,
        /// What about the document it conflicts with.
        reason: String,
    },

    /// A page task failed.
    #[error("page {} failed: {message}", pageno + 1)]
    PageTask {
        /// 0-based page index.
        pageno: usize,
        /// Description of the failure.
        message: String,
    },

    /// A worker process died or spoke nonsense.
    #[error("worker process error: {0}")]
    ChildProcess(String),
}

/// Broad error classes, each with its own exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    BadArgs,
    InputFile,
    MissingDependency,
    AlreadyDoneOcr,
    ChildProcess,
    Other,
}

impl ErrorClass {
    /// The process exit code for this class.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorClass::BadArgs => 1,
            ErrorClass::InputFile => 2,
            ErrorClass::MissingDependency => 3,
            ErrorClass::AlreadyDoneOcr => 6,
            ErrorClass::ChildProcess => 7,
            ErrorClass::Other => 15,
        }
    }
}

impl From<ErrorClass> for ExitCode {
    fn from(class: ErrorClass) -> Self {
        ExitCode::from(class.exit_code())
    }
}

impl PipelineError {
    /// Which class does this error belong to?
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::BadArgs(_) | PipelineError::Validation { .. } => {
                ErrorClass::BadArgs
            }
            PipelineError::InputFile(_) => ErrorClass::InputFile,
            PipelineError::MissingDependency { .. } => ErrorClass::MissingDependency,
            PipelineError::PriorOcrFound { .. } => ErrorClass::AlreadyDoneOcr,
            PipelineError::PageTask { .. } | PipelineError::ChildProcess(_) => {
                ErrorClass::ChildProcess
            }
        }
    }
}

/// Find the [`PipelineError`] in an error chain, if there is one.
pub fn find_pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}

/// Classify an arbitrary error.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    find_pipeline_error(err)
        .map(PipelineError::class)
        .unwrap_or(ErrorClass::Other)
}

#[cfg(test)]
mod tests {
    use anyhow::Context as _;

    use super::*;

    #[test]
    fn classification_survives_context() {
        let err = Err::<(), _>(PipelineError::InputFile("no such file".to_owned()))
            .context("could not snapshot input")
            .context("pipeline failed")
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::InputFile);
        assert_eq!(classify_error(&err).exit_code(), 2);
    }

    #[test]
    fn input_and_missing_dependency_are_distinct() {
        let input = anyhow::Error::new(PipelineError::InputFile("x".to_owned()));
        let missing = anyhow::Error::new(PipelineError::MissingDependency {
            program: "pdfinfo".to_owned(),
        });
        assert_ne!(classify_error(&input), classify_error(&missing));
        assert_eq!(classify_error(&missing).exit_code(), 3);
    }

    #[test]
    fn unknown_errors_are_other() {
        let err = anyhow::anyhow!("something odd");
        assert_eq!(classify_error(&err), ErrorClass::Other);
    }

    #[test]
    fn page_task_errors_use_page_numbers() {
        let err = PipelineError::PageTask {
            pageno: 0,
            message: "boom".to_owned(),
        };
        assert_eq!(err.to_string(), "page 1 failed: boom");
    }
}

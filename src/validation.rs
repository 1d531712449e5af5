//! Check that a run makes sense for this particular document.
//!
//! [`PipelineOptions::check_options`](crate::options::PipelineOptions::check_options)
//! has already checked the options by themselves. Here we check them against
//! what we learned about the document, before any page work starts.

use crate::{context::DocumentContext, errors::PipelineError, prelude::*};

/// Validate a document context. Fails with a classified [`PipelineError`].
#[instrument(level = "debug", skip_all)]
pub fn validate_document(document: &DocumentContext) -> Result<()> {
    let options = &document.options;
    let page_count = document.page_count();

    let selection = options.page_selection()?;
    if let Some(last) = selection.as_ref().and_then(|selection| selection.last())
        && last >= page_count
    {
        return Err(PipelineError::Validation {
            option: "--pages".to_owned(),
            reason: format!(
                "page {} was requested, but the document has {} pages",
                last + 1,
                page_count
            ),
        }
        .into());
    }

    if !options.allows_text_pages() {
        let prior_text = document.metadata.pages().iter().find(|page| {
            page.has_text
                && selection
                    .as_ref()
                    .is_none_or(|selection| selection.contains(page.pageno))
        });
        if let Some(page) = prior_text {
            return Err(PipelineError::PriorOcrFound {
                pageno: page.pageno + 1,
            }
            .into());
        }
    }

    let text_pages = document
        .metadata
        .pages()
        .iter()
        .filter(|page| page.has_text)
        .count();
    if text_pages > 0 {
        info!("{} of {} pages already have text", text_pages, page_count);
    }
    Ok(())
}

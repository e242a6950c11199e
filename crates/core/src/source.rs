//! Source value objects — search hits, fetched page content, and summaries.
//!
//! These flow through the fan-out phases of an iteration: Search produces
//! [`SourceResult`]s, Fetch turns each URL into a [`FetchedContent`], and
//! Summarize condenses content into entries of a [`SummaryMap`]. Fetch and
//! summarize failures are values (marker strings with `ok = false`), never
//! errors — a single bad URL must not abort its iteration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary text recorded for a URL whose summarization failed.
pub const SUMMARIZE_ERROR_MARKER: &str = "Summarization error";

/// One search hit. Immutable once produced; deduplicated across iterations
/// by URL membership in the loop controller's visited-set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    pub title: String,
    pub url: String,
    pub snippet: String,

    /// Which backend produced this hit (e.g., "static", "web").
    #[serde(default)]
    pub origin: String,
}

/// A URL plus its extracted text content, or an error marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedContent {
    pub url: String,
    pub content: String,

    /// False when `content` is an error marker rather than page text.
    pub ok: bool,
}

impl FetchedContent {
    /// A successful fetch.
    pub fn ok(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
            ok: true,
        }
    }

    /// A contained failure — the marker text stands in for content.
    pub fn failure(url: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: marker.into(),
            ok: false,
        }
    }
}

/// Condensed text per URL, accumulated across iterations. URLs are globally
/// unique within a Run, so later iterations only ever add keys.
pub type SummaryMap = BTreeMap<String, String>;

/// A search hit joined with its summary — the shape handed to report output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizedSource {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub summary: String,
}

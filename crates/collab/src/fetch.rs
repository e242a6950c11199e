//! Fixture-backed fetcher — URL content from an in-memory map.
//!
//! Total by contract: a URL missing from the fixtures yields an
//! error-marker [`FetchedContent`] value, never an error, so the loop's
//! fan-in over many URLs cannot partially abort.

use async_trait::async_trait;
use delver_core::source::FetchedContent;
use delver_core::Fetcher;
use std::collections::HashMap;

/// Marker prefix recorded as content when a fetch fails.
pub const FETCH_ERROR_MARKER: &str = "Fetch URL Tool: Failed to fetch";

/// Serves page text from a preloaded map; everything else fails with a
/// contained marker.
pub struct FixtureFetcher {
    pages: HashMap<String, String>,
}

impl FixtureFetcher {
    pub fn new(pages: HashMap<String, String>) -> Self {
        Self { pages }
    }

    /// Convenience constructor from `(url, content)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            pages: pairs
                .into_iter()
                .map(|(u, c)| (u.into(), c.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl Fetcher for FixtureFetcher {
    async fn fetch(&self, url: &str) -> FetchedContent {
        match self.pages.get(url) {
            Some(content) => FetchedContent::ok(url, content.clone()),
            None => {
                tracing::debug!(url, "fixture miss, returning error marker");
                FetchedContent::failure(url, format!("{FETCH_ERROR_MARKER}: not in fixtures"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_url_returns_content() {
        let fetcher = FixtureFetcher::from_pairs([("https://a.example", "page text")]);
        let fetched = fetcher.fetch("https://a.example").await;
        assert!(fetched.ok);
        assert_eq!(fetched.content, "page text");
    }

    #[tokio::test]
    async fn unknown_url_returns_marker_value() {
        let fetcher = FixtureFetcher::from_pairs::<_, String>([]);
        let fetched = fetcher.fetch("https://missing.example").await;
        assert!(!fetched.ok);
        assert!(fetched.content.starts_with(FETCH_ERROR_MARKER));
    }
}

//! Static search engine — deterministic, paginated results from a fixed
//! corpus.
//!
//! In production this would call a real search API (Brave, Google, etc.).
//! The static engine serves slices of a preloaded result list so the loop's
//! pagination and deduplication behavior can be exercised end-to-end
//! without network access. It deliberately does NOT deduplicate — the loop
//! controller owns that.

use async_trait::async_trait;
use delver_core::error::SearchError;
use delver_core::source::SourceResult;
use delver_core::SearchEngine;

/// Serves ranked results from an in-memory corpus, honoring the 1-based
/// `start` offset.
pub struct StaticSearchEngine {
    corpus: Vec<SourceResult>,
}

impl StaticSearchEngine {
    /// Build an engine over an explicit corpus.
    pub fn new(corpus: Vec<SourceResult>) -> Self {
        Self { corpus }
    }

    /// A corpus of `count` generated results for a query, useful in tests
    /// and demos.
    pub fn generated(query: &str, count: usize) -> Self {
        let corpus = (0..count)
            .map(|i| SourceResult {
                title: format!("Result {} for: {}", i + 1, query),
                url: format!(
                    "https://example.com/search?q={}&p={}",
                    query.replace(' ', "+"),
                    i + 1
                ),
                snippet: format!("Static result {} for the query '{}'.", i + 1, query),
                origin: "static".into(),
            })
            .collect();
        Self { corpus }
    }
}

#[async_trait]
impl SearchEngine for StaticSearchEngine {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &str, start: u32) -> Result<Vec<SourceResult>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidQuery("empty query".into()));
        }
        // start is 1-based; slice the corpus page.
        let offset = start.saturating_sub(1) as usize;
        Ok(self
            .corpus
            .iter()
            .skip(offset)
            .take(10)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_do_not_overlap() {
        let engine = StaticSearchEngine::generated("rust async", 25);
        let page1 = engine.search("rust async", 1).await.unwrap();
        let page2 = engine.search("rust async", 11).await.unwrap();
        assert_eq!(page1.len(), 10);
        assert_eq!(page2.len(), 10);
        for r in &page1 {
            assert!(!page2.iter().any(|s| s.url == r.url));
        }
    }

    #[tokio::test]
    async fn past_end_returns_empty() {
        let engine = StaticSearchEngine::generated("rust", 5);
        let page = engine.search("rust", 21).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let engine = StaticSearchEngine::generated("rust", 5);
        assert!(engine.search("  ", 1).await.is_err());
    }
}

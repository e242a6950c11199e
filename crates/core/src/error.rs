//! Error types for the Delver domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each collaborator
//! capability has its own error variant. Failures that the loop treats as
//! data (a single URL's fetch or summarize failure, an unparseable model
//! response) never appear here — they are represented as marker values and
//! quality tags on the domain types instead.

use thiserror::Error;

/// The top-level error type for all Delver operations.
///
/// Anything that surfaces as this type aborts the Run (`Failed` terminal
/// status). Contained and degraded conditions are absorbed below this level.
#[derive(Debug, Error)]
pub enum Error {
    // --- Search errors ---
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    // --- Generation errors ---
    #[error("Generation error: {0}")]
    Generate(#[from] GenerateError),

    // --- Audit persistence errors ---
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors from the search collaborator.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("Search backend failed: {message} (status: {status_code})")]
    Backend { status_code: u16, message: String },

    #[error("Rate limited by search backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Search backend not configured: {0}")]
    NotConfigured(String),
}

/// Errors from the text-generation collaborator.
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Generator not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Errors from the audit sink.
///
/// These are logged and swallowed by the loop — a failing sink never fails
/// a Run.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record rejected: {0}")]
    Rejected(String),
}

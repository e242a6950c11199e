//! Collaborator traits — the capability contracts the loop consumes.
//!
//! The loop controller never talks to a search engine, web page, model
//! provider, or datastore directly. It drives these four traits:
//!
//! - [`SearchEngine`] — ranked results for a query and 1-based offset
//! - [`Fetcher`] — URL to text, failures as values (never errors)
//! - [`Generator`] — token-stream text generation, one suspension point
//!   per chunk
//! - [`AuditSink`] — iteration-scoped trace records; failures are logged
//!   by callers, never propagated
//!
//! Implementations: stub/scripted collaborators in `delver-collab`; real
//! network-backed ones live outside this repository.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::{AuditError, GenerateError, SearchError};
use crate::observation::Observation;
use crate::reflection::Reflection;
use crate::run::{ModelParams, RunId};
use crate::source::SourceResult;

/// Ranked web (or corpus) search.
///
/// Must not deduplicate across calls — the loop controller owns the
/// Run-scoped visited-set.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// A human-readable name for this backend (e.g., "static", "brave").
    fn name(&self) -> &str;

    /// Return ranked results for `query` starting at the 1-based offset
    /// `start`.
    async fn search(
        &self,
        query: &str,
        start: u32,
    ) -> std::result::Result<Vec<SourceResult>, SearchError>;
}

/// URL content retrieval.
///
/// Total by contract: failures come back as error-marker
/// [`crate::source::FetchedContent`] values so a fan-in over many URLs
/// never partially aborts.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> crate::source::FetchedContent;
}

/// A request to the text-generation capability.
///
/// Summarization, observation synthesis, claim review, and reflection all
/// use this one contract with distinct prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// System prompt establishing the role for this phase.
    pub system: String,

    /// User prompt carrying the phase's payload.
    pub prompt: String,

    /// Model identity and sampling parameters.
    pub params: ModelParams,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a generation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenChunk {
    /// Partial text delta.
    #[serde(default)]
    pub text: Option<String>,

    /// Whether this is the final chunk.
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl GenChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            done: false,
            usage: None,
        }
    }

    pub fn done(usage: Option<Usage>) -> Self {
        Self {
            text: None,
            done: true,
            usage,
        }
    }
}

/// A drained generation stream: accumulated text plus stream metadata.
#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub text: String,
    pub usage: Option<Usage>,

    /// True when the stream erred before its final chunk; `text` holds
    /// whatever arrived first.
    pub interrupted: bool,
}

/// The text-generation capability.
///
/// Yields an ordered sequence of string chunks over an `mpsc` receiver;
/// each `recv().await` is the consumer's single suspension point per chunk.
#[async_trait]
pub trait Generator: Send + Sync {
    /// A human-readable name for this backend (e.g., "ollama", "scripted").
    fn name(&self) -> &str;

    /// Start a generation and return the chunk stream.
    ///
    /// An `Err` from this call is a hard failure of the invocation itself;
    /// an `Err` *inside* the stream is a mid-stream interruption the
    /// consumer may absorb.
    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<GenChunk, GenerateError>>,
        GenerateError,
    >;

    /// Convenience: run a generation to completion and return the drained
    /// stream.
    ///
    /// Mid-stream errors truncate the accumulated text rather than failing —
    /// callers that need per-chunk control consume the stream themselves.
    async fn generate_collect(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerationOutput, GenerateError> {
        let mut rx = self.generate(request).await?;
        let mut out = GenerationOutput::default();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(c) => {
                    if let Some(text) = c.text {
                        out.text.push_str(&text);
                    }
                    if c.usage.is_some() {
                        out.usage = c.usage;
                    }
                }
                Err(e) => {
                    tracing::warn!("generation stream interrupted: {e}");
                    out.interrupted = true;
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// One iteration-scoped trace record, keyed by Run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// A phase the loop decided to run, with its rationale.
    PlanStep {
        run_id: RunId,
        iteration: u32,
        tool_name: String,
        rationale: String,
        args: serde_json::Value,
    },

    /// The outcome of a collaborator invocation.
    ToolOutcome {
        run_id: RunId,
        iteration: u32,
        tool_name: String,
        ok: bool,
        data: Option<serde_json::Value>,
        error: Option<String>,
    },

    /// A finalized observation.
    Observation {
        run_id: RunId,
        iteration: u32,
        observation: Observation,
    },

    /// A finalized reflection.
    Reflection {
        run_id: RunId,
        iteration: u32,
        reflection: Reflection,
    },

    /// One claim's confidence breakdown after the review pass.
    ClaimConfidence {
        run_id: RunId,
        artifact_index: usize,
        claim_index: usize,
        statement: String,
        heuristic_confidence: f64,
        model_confidence: Option<f64>,
        blended_confidence: f64,
        rationale: Option<String>,
    },
}

/// An audit sink accepting trace records.
///
/// The loop must function correctly when every call is a no-op. Returns an
/// optional durable identifier; `None` (or an error, which callers log and
/// swallow) marks the iteration degraded without affecting the decision
/// logic.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn persist(
        &self,
        record: AuditRecord,
    ) -> std::result::Result<Option<String>, AuditError>;
}

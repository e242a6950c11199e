//! # Delver Core
//!
//! Domain types, collaborator traits, and error definitions for the Delver
//! research agent. This crate has **zero framework dependencies** — it defines
//! the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external capability (search, fetch, generation, audit persistence)
//! is defined as a trait here. Implementations live in their respective
//! crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod collab;
pub mod error;
pub mod event;
pub mod observation;
pub mod reflection;
pub mod run;
pub mod source;

// Re-export key types at crate root for ergonomics
pub use collab::{
    AuditRecord, AuditSink, Fetcher, GenChunk, GenerateRequest, GenerationOutput, Generator,
    SearchEngine, Usage,
};
pub use error::{AuditError, Error, GenerateError, Result, SearchError};
pub use event::{DomainEvent, EventBus};
pub use observation::{Artifact, ArtifactValue, Claim, Observation, Quality};
pub use reflection::{Contradiction, Decision, LowConfidenceClaim, Reflection};
pub use run::{
    BudgetLimits, GoalSpec, ModelParams, Phase, Run, RunConfig, RunId, RunStatus, TerminalStatus,
    UsageCounters,
};
pub use source::{FetchedContent, SourceResult, SummarizedSource, SummaryMap};

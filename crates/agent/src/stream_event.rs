//! Run-level streaming events.
//!
//! `RunStreamEvent` wraps phase progress, live partial observations, and
//! output deltas into events a reporting layer can forward to clients over
//! SSE or WebSocket. The loop sends them on an optional `mpsc` channel;
//! dropping the receiver silently disables the stream.

use delver_core::observation::Observation;
use delver_core::reflection::Reflection;
use delver_core::run::Phase;
use delver_core::source::SourceResult;
use serde::{Deserialize, Serialize};

/// Events emitted while a Run's loop executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunStreamEvent {
    /// The loop entered a new phase.
    Phase { iteration: u32, phase: Phase },

    /// Fresh (deduplicated) search results for this iteration.
    SearchResults {
        iteration: u32,
        results: Vec<SourceResult>,
    },

    /// A partial summary token for one URL.
    SummaryDelta { url: String, chunk: String },

    /// A valid partial observation parsed mid-stream.
    PartialObservation { observation: Observation },

    /// The finalized observation for an iteration.
    ObservationFinal { observation: Observation },

    /// The finalized reflection for an iteration.
    ReflectionFinal { reflection: Reflection },

    /// A partial output (report) token.
    OutputDelta { chunk: String },

    /// An error surfaced mid-run.
    Error { message: String },

    /// The Run reached a terminal status.
    Done { status: String, iterations: u32 },
}

impl RunStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Phase { .. } => "phase",
            Self::SearchResults { .. } => "search_results",
            Self::SummaryDelta { .. } => "summary_delta",
            Self::PartialObservation { .. } => "partial_observation",
            Self::ObservationFinal { .. } => "observation_final",
            Self::ReflectionFinal { .. } => "reflection_final",
            Self::OutputDelta { .. } => "output_delta",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}

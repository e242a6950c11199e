//! # Delver Agent
//!
//! The research loop: a goal-directed Search → Fetch → Summarize → Observe →
//! Reflect cycle that repeats until the goal is judged satisfied, the
//! iteration budget runs out, or a fatal collaborator error aborts the Run.
//!
//! The loop controller ([`ResearchLoop`]) owns all per-Run mutable state and
//! drives the four collaborator traits from `delver-core`. The observe
//! phase's streaming reconciler, deterministic claim synthesis, and the
//! reflection gate live in their own modules and are independently testable.

pub mod loop_runner;
pub mod observe;
pub mod output;
pub mod reflect;
pub mod stream_event;

pub use loop_runner::{pagination_start, IterationBlock, ResearchLoop, RunHandle};
pub use observe::ObservationReconciler;
pub use reflect::{coverage_score, reflect};
pub use stream_event::RunStreamEvent;

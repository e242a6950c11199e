//! The observe phase: streaming reconciliation, deterministic artifact
//! synthesis, and claim confidence scoring.
//!
//! Split into three parts the loop composes per iteration:
//! - [`reconcile`] — turns the live token stream into an Observation,
//!   always (three-tier fallback, no failure path)
//! - [`synthesize`] — rebuilds artifacts and claims from the accumulated
//!   summaries, then optionally refines claim confidence via a reviewing
//!   model
//! - [`score`] — the pure heuristic confidence formula and blending rules

pub mod reconcile;
pub mod score;
pub mod synthesize;

pub use reconcile::{extract_json_block, ObservationReconciler};

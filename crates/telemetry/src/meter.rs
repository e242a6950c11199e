//! Per-run usage meter.
//!
//! One [`RunMeter`] is created per Run and shared with the phases that
//! invoke collaborators. Thread-safe via `RwLock` so concurrent fan-out
//! workers can record usage; the loop controller reads a snapshot at each
//! iteration boundary and folds it into the Run's counters.

use crate::pricing::PricingTable;
use delver_core::Usage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// A point-in-time view of a Run's resource usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub steps_used: u32,
    pub tokens_used: u64,
    pub cost_used: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
struct Totals {
    steps: u32,
    prompt_tokens: u64,
    completion_tokens: u64,
    cost: f64,
}

/// Accumulates steps, tokens, and cost for one Run.
pub struct RunMeter {
    pricing: Arc<PricingTable>,
    started: Instant,
    totals: RwLock<Totals>,
}

impl RunMeter {
    /// Create a meter with the given pricing table; the elapsed clock
    /// starts now.
    pub fn new(pricing: Arc<PricingTable>) -> Self {
        Self {
            pricing,
            started: Instant::now(),
            totals: RwLock::new(Totals::default()),
        }
    }

    /// Record one collaborator invocation.
    pub fn record_step(&self) {
        self.totals.write().unwrap().steps += 1;
    }

    /// Record token usage from a finished generation.
    pub fn record_generation(&self, model: &str, usage: &Usage) {
        let cost = self
            .pricing
            .cost(model, usage.prompt_tokens, usage.completion_tokens);
        let mut totals = self.totals.write().unwrap();
        totals.prompt_tokens += usage.prompt_tokens as u64;
        totals.completion_tokens += usage.completion_tokens as u64;
        totals.cost += cost;
    }

    /// Current usage totals.
    pub fn snapshot(&self) -> UsageSnapshot {
        let totals = self.totals.read().unwrap();
        UsageSnapshot {
            steps_used: totals.steps,
            tokens_used: totals.prompt_tokens + totals.completion_tokens,
            cost_used: totals.cost,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

//! Run domain types — one execution of the research loop toward a goal.
//!
//! A [`Run`] owns the goal text, model parameters, budget limits, and the
//! usage counters that accumulate as the loop iterates. It is mutated only
//! by the loop controller, at iteration boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a Run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the agent is trying to accomplish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSpec {
    /// Short goal statement — doubles as the search query for every
    /// iteration (only the pagination cursor advances).
    pub title: String,

    /// Longer operator instructions injected into generation prompts.
    #[serde(default)]
    pub instructions: String,
}

/// Model identity and sampling parameters used for every generation phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// The model to use (e.g., "ollama/llama3.1:8b", "openai/gpt-4o-mini")
    pub model: String,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate per response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

/// Budget ceilings for one Run.
///
/// Only `max_iterations` hard-stops the loop; the remaining ceilings are
/// tracked in [`UsageCounters`] for reporting and post-hoc enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Maximum loop iterations before the Run terminates Exhausted.
    pub max_iterations: u32,

    /// Maximum collaborator invocations (advisory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    /// Maximum total tokens (advisory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,

    /// Maximum spend in USD (advisory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,

    /// Maximum wall-clock time in milliseconds (advisory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_elapsed_ms: Option<u64>,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_steps: None,
            max_tokens: None,
            max_cost_usd: None,
            max_elapsed_ms: None,
        }
    }
}

/// Resource usage accumulated over a Run's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub iterations_completed: u32,
    pub steps_used: u32,
    pub tokens_used: u64,
    pub cost_used: f64,
    pub elapsed_ms: u64,
}

/// Lifecycle status of a Run.
///
/// Exhaustion is not an error: an exhausted Run stays `Active` with an
/// explanatory terminal status, matching how callers distinguish "finished
/// successfully" from "ran out of iterations".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Complete,
    Error,
}

/// Configuration used to start a new Run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub goal: GoalSpec,
    pub model: ModelParams,
    #[serde(default)]
    pub budget: BudgetLimits,
}

/// One execution of the research loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub goal: GoalSpec,
    pub model: ModelParams,
    pub budget: BudgetLimits,
    pub counters: UsageCounters,

    /// Running natural-language summary, rewritten by each reflection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// [0,1] estimate of goal coverage, set when a reflection reports the
    /// goal unsatisfied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_score: Option<f64>,

    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a fresh Run from its configuration.
    pub fn new(config: RunConfig) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            goal: config.goal,
            model: config.model,
            budget: config.budget,
            counters: UsageCounters::default(),
            summary: None,
            coverage_score: None,
            status: RunStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The phases of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Searching,
    Fetching,
    Summarizing,
    Observing,
    Reflecting,
    Outputting,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Searching => write!(f, "searching"),
            Self::Fetching => write!(f, "fetching"),
            Self::Summarizing => write!(f, "summarizing"),
            Self::Observing => write!(f, "observing"),
            Self::Reflecting => write!(f, "reflecting"),
            Self::Outputting => write!(f, "outputting"),
        }
    }
}

/// How a Run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Goal satisfied; output generation was invoked.
    Complete,

    /// Iteration budget spent without goal satisfaction. A normal outcome,
    /// not an error.
    Exhausted { iterations: u32 },

    /// A fatal error aborted the loop.
    Failed { message: String },
}

impl TerminalStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Exhausted { iterations } => {
                write!(f, "goal not satisfied after {iterations} iterations")
            }
            Self::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config() -> RunConfig {
        RunConfig {
            goal: GoalSpec {
                title: "rust async runtimes".into(),
                instructions: String::new(),
            },
            model: ModelParams {
                model: "mock-model".into(),
                temperature: 0.7,
                max_tokens: None,
            },
            budget: BudgetLimits::default(),
        }
    }

    #[test]
    fn new_run_starts_active_with_zero_counters() {
        let run = Run::new(run_config());
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.counters.iterations_completed, 0);
        assert_eq!(run.counters.tokens_used, 0);
        assert!(run.summary.is_none());
    }

    #[test]
    fn exhausted_status_cites_iteration_count() {
        let status = TerminalStatus::Exhausted { iterations: 3 };
        assert_eq!(status.to_string(), "goal not satisfied after 3 iterations");
        assert!(!status.is_complete());
    }

    #[test]
    fn budget_defaults_cap_iterations_only() {
        let budget = BudgetLimits::default();
        assert_eq!(budget.max_iterations, 5);
        assert!(budget.max_tokens.is_none());
        assert!(budget.max_cost_usd.is_none());
    }

    #[test]
    fn phase_display_names() {
        assert_eq!(Phase::Searching.to_string(), "searching");
        assert_eq!(Phase::Outputting.to_string(), "outputting");
    }
}

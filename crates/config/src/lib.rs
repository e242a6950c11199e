//! Configuration loading, validation, and management for Delver.
//!
//! Loads configuration from a TOML file (conventionally
//! `~/.delver/config.toml`) with environment variable overrides, and
//! validates all settings before a Run starts. Every tunable magnitude in
//! the loop — pagination, iteration caps, claim-scoring weights, coverage
//! divisor, output limits — lives here rather than inside the algorithms.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// The root configuration structure.
///
/// Maps directly to `config.toml`.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// API key for the generation backend (if it needs one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model for all generation phases.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature.
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per generation.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Loop pacing and budgets.
    #[serde(default, rename = "loop")]
    pub loop_cfg: LoopConfig,

    /// Observation synthesis and claim scoring.
    #[serde(default)]
    pub observe: ObserveConfig,

    /// Reflection gate settings.
    #[serde(default)]
    pub reflect: ReflectConfig,

    /// Final report output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_model() -> String {
    "ollama/llama3.1:8b".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("loop_cfg", &self.loop_cfg)
            .field("observe", &self.observe)
            .field("reflect", &self.reflect)
            .field("output", &self.output)
            .finish()
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

/// Loop pacing: pagination and the one hard budget (iterations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Results per search page; also the pagination stride
    /// (`start = 1 + iteration * page_size`).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Default iteration cap for new Runs.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Whether the claim review (model re-scoring) pass runs.
    #[serde(default = "default_true")]
    pub claim_review: bool,
}

fn default_page_size() -> u32 {
    10
}
fn default_max_iterations() -> u32 {
    5
}
fn default_true() -> bool {
    true
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_iterations: default_max_iterations(),
            claim_review: default_true(),
        }
    }
}

/// Limits applied while normalizing and enriching observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveConfig {
    /// Max characters of a salvaged headline.
    #[serde(default = "default_headline_max_chars")]
    pub headline_max_chars: usize,

    /// Max characters of salvaged details.
    #[serde(default = "default_details_max_chars")]
    pub details_max_chars: usize,

    /// Sentences considered per summary when extracting claims.
    #[serde(default = "default_claim_sentences_max")]
    pub claim_sentences_max: usize,

    /// A sentence without a numeric token must exceed this length to be
    /// claim-worthy.
    #[serde(default = "default_claim_long_sentence_threshold")]
    pub claim_long_sentence_threshold: usize,

    /// Claims kept per artifact.
    #[serde(default = "default_artifact_max_claims")]
    pub artifact_max_claims: usize,

    /// Summary snippet length sent along with each claim to the reviewer.
    #[serde(default = "default_summary_snippet_chars")]
    pub summary_snippet_chars: usize,

    /// Claims batched into a single review request.
    #[serde(default = "default_review_max_claims")]
    pub review_max_claims: usize,

    /// Reviewer rationale truncation length.
    #[serde(default = "default_rationale_max_chars")]
    pub rationale_max_chars: usize,

    /// Source URLs listed when rebuilding empty details.
    #[serde(default = "default_max_sources_listed")]
    pub max_sources_listed: usize,

    /// Heuristic claim-scoring weights.
    #[serde(default)]
    pub scoring: ScoringConfig,
}

fn default_headline_max_chars() -> usize {
    120
}
fn default_details_max_chars() -> usize {
    2000
}
fn default_claim_sentences_max() -> usize {
    12
}
fn default_claim_long_sentence_threshold() -> usize {
    80
}
fn default_artifact_max_claims() -> usize {
    5
}
fn default_summary_snippet_chars() -> usize {
    400
}
fn default_review_max_claims() -> usize {
    40
}
fn default_rationale_max_chars() -> usize {
    280
}
fn default_max_sources_listed() -> usize {
    5
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            headline_max_chars: default_headline_max_chars(),
            details_max_chars: default_details_max_chars(),
            claim_sentences_max: default_claim_sentences_max(),
            claim_long_sentence_threshold: default_claim_long_sentence_threshold(),
            artifact_max_claims: default_artifact_max_claims(),
            summary_snippet_chars: default_summary_snippet_chars(),
            review_max_claims: default_review_max_claims(),
            rationale_max_chars: default_rationale_max_chars(),
            max_sources_listed: default_max_sources_listed(),
            scoring: ScoringConfig::default(),
        }
    }
}

/// Magnitudes for the heuristic confidence formula.
///
/// The formula's shape lives in `delver-agent`; only the weights live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_base")]
    pub base: f64,
    #[serde(default = "default_numeric_bonus")]
    pub numeric_bonus: f64,
    #[serde(default = "default_goal_match_base_bonus")]
    pub goal_match_base_bonus: f64,
    #[serde(default = "default_goal_match_extra_bonus")]
    pub goal_match_extra_bonus: f64,
    #[serde(default = "default_goal_match_max_bonus")]
    pub goal_match_max_bonus: f64,
    #[serde(default = "default_hedging_penalty")]
    pub hedging_penalty: f64,
    #[serde(default = "default_hype_penalty")]
    pub hype_penalty: f64,
    #[serde(default = "default_strong_verb_bonus")]
    pub strong_verb_bonus: f64,
    #[serde(default = "default_short_len_threshold")]
    pub short_len_threshold: usize,
    #[serde(default = "default_short_len_penalty")]
    pub short_len_penalty: f64,
    #[serde(default = "default_long_len_threshold")]
    pub long_len_threshold: usize,
    #[serde(default = "default_long_len_penalty")]
    pub long_len_penalty: f64,
    #[serde(default = "default_stale_year_threshold")]
    pub stale_year_threshold: i32,
    #[serde(default = "default_stale_year_penalty")]
    pub stale_year_penalty: f64,
    #[serde(default = "default_min")]
    pub min: f64,
    #[serde(default = "default_max")]
    pub max: f64,
    /// Claims scoring below this are discarded outright.
    #[serde(default = "default_keep_min")]
    pub keep_min: f64,
    /// Decimal places confidences are rounded to.
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

fn default_base() -> f64 {
    0.5
}
fn default_numeric_bonus() -> f64 {
    0.1
}
fn default_goal_match_base_bonus() -> f64 {
    0.05
}
fn default_goal_match_extra_bonus() -> f64 {
    0.05
}
fn default_goal_match_max_bonus() -> f64 {
    0.2
}
fn default_hedging_penalty() -> f64 {
    0.15
}
fn default_hype_penalty() -> f64 {
    0.2
}
fn default_strong_verb_bonus() -> f64 {
    0.1
}
fn default_short_len_threshold() -> usize {
    40
}
fn default_short_len_penalty() -> f64 {
    0.1
}
fn default_long_len_threshold() -> usize {
    400
}
fn default_long_len_penalty() -> f64 {
    0.05
}
fn default_stale_year_threshold() -> i32 {
    3
}
fn default_stale_year_penalty() -> f64 {
    0.1
}
fn default_min() -> f64 {
    0.05
}
fn default_max() -> f64 {
    0.95
}
fn default_keep_min() -> f64 {
    0.35
}
fn default_decimals() -> u32 {
    2
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            numeric_bonus: default_numeric_bonus(),
            goal_match_base_bonus: default_goal_match_base_bonus(),
            goal_match_extra_bonus: default_goal_match_extra_bonus(),
            goal_match_max_bonus: default_goal_match_max_bonus(),
            hedging_penalty: default_hedging_penalty(),
            hype_penalty: default_hype_penalty(),
            strong_verb_bonus: default_strong_verb_bonus(),
            short_len_threshold: default_short_len_threshold(),
            short_len_penalty: default_short_len_penalty(),
            long_len_threshold: default_long_len_threshold(),
            long_len_penalty: default_long_len_penalty(),
            stale_year_threshold: default_stale_year_threshold(),
            stale_year_penalty: default_stale_year_penalty(),
            min: default_min(),
            max: default_max(),
            keep_min: default_keep_min(),
            decimals: default_decimals(),
        }
    }
}

/// Reflection gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectConfig {
    /// How many combined gaps (unmet criteria + missing facts) fully
    /// saturate the coverage penalty.
    #[serde(default = "default_coverage_gap_divisor")]
    pub coverage_gap_divisor: f64,
}

fn default_coverage_gap_divisor() -> f64 {
    5.0
}

impl Default for ReflectConfig {
    fn default() -> Self {
        Self {
            coverage_gap_divisor: default_coverage_gap_divisor(),
        }
    }
}

/// Final report output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Target report length in words (a prompt hint, not a hard cap).
    #[serde(default = "default_target_words")]
    pub target_words: u32,

    /// Generation-length floor and ceiling for the output call.
    #[serde(default = "default_output_min_tokens")]
    pub min_tokens: u32,
    #[serde(default = "default_output_max_tokens")]
    pub max_tokens: u32,
}

fn default_target_words() -> u32 {
    1500
}
fn default_output_min_tokens() -> u32 {
    512
}
fn default_output_max_tokens() -> u32 {
    8192
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            target_words: default_target_words(),
            min_tokens: default_output_min_tokens(),
            max_tokens: default_output_max_tokens(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// Load configuration from a TOML file, apply environment overrides,
    /// and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default_with_fallbacks();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// A fully defaulted configuration (serde defaults applied).
    pub fn default_with_fallbacks() -> Self {
        toml::from_str("").unwrap_or_default()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("DELVER_API_KEY")
            && !key.is_empty()
        {
            self.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("DELVER_MODEL")
            && !model.is_empty()
        {
            self.default_model = model;
        }
        if let Ok(iters) = std::env::var("DELVER_MAX_ITERATIONS")
            && let Ok(parsed) = iters.parse::<u32>()
        {
            self.loop_cfg.max_iterations = parsed;
        }
    }

    /// Validate all settings. Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_cfg.page_size == 0 {
            return Err(ConfigError::Invalid("loop.page_size must be > 0".into()));
        }
        if self.loop_cfg.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "loop.max_iterations must be > 0".into(),
            ));
        }
        let s = &self.observe.scoring;
        if !(0.0..=1.0).contains(&s.min) || !(0.0..=1.0).contains(&s.max) || s.min >= s.max {
            return Err(ConfigError::Invalid(
                "observe.scoring min/max must satisfy 0 <= min < max <= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&s.keep_min) {
            return Err(ConfigError::Invalid(
                "observe.scoring.keep_min must be within [0, 1]".into(),
            ));
        }
        if s.decimals > 6 {
            return Err(ConfigError::Invalid(
                "observe.scoring.decimals must be <= 6".into(),
            ));
        }
        if self.reflect.coverage_gap_divisor <= 0.0 {
            return Err(ConfigError::Invalid(
                "reflect.coverage_gap_divisor must be > 0".into(),
            ));
        }
        if self.output.min_tokens > self.output.max_tokens {
            return Err(ConfigError::Invalid(
                "output.min_tokens must not exceed output.max_tokens".into(),
            ));
        }
        Ok(())
    }

    /// Model parameters derived from the defaults in this config.
    pub fn model_params(&self) -> delver_core::ModelParams {
        delver_core::ModelParams {
            model: self.default_model.clone(),
            temperature: self.default_temperature,
            max_tokens: Some(self.default_max_tokens),
        }
    }
}

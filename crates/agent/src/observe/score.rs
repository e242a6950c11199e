//! Heuristic claim confidence scoring.
//!
//! Assigns a believability score to a candidate claim sentence from lexical
//! signals alone: numeric grounding, goal-term overlap, hedging and hype
//! language, declarative verbs, length, and staleness of the most recent
//! year mentioned. All magnitudes come from [`ScoringConfig`]; only the
//! formula's shape lives here.

use delver_config::ScoringConfig;
use once_cell::sync::Lazy;
use regex::Regex;

static HEDGING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(may|might|could|possibly|appears|suggests|seems|potentially|approximately|around)\b",
    )
    .unwrap()
});

static STRONG_VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(announces?|confirms?|reports?|launch(es|ed)?|reveals?|shows?)\b").unwrap()
});

static HYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(revolutionary|unprecedented|game[- ]?changing|cutting[- ]?edge|groundbreaking)\b")
        .unwrap()
});

static NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\d%$]").unwrap());

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap());

/// Whether the sentence contains a numeric, currency, or percent token.
pub fn has_numeric_token(sentence: &str) -> bool {
    NUMERIC.is_match(sentence)
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Blend a heuristic score with a reviewer score: the rounded mean.
pub fn blend(heuristic: f64, reviewer: f64, decimals: u32) -> f64 {
    round_to((heuristic + reviewer) / 2.0, decimals)
}

/// The most recent 4-digit year mentioned in the sentence, if any.
fn latest_year(sentence: &str) -> Option<i32> {
    YEAR.find_iter(sentence)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .max()
}

/// Score one candidate sentence.
///
/// The result is clamped to `[cfg.min, cfg.max]` and rounded to
/// `cfg.decimals` places, no matter how many bonus/penalty rules fire.
pub fn heuristic_confidence(
    sentence: &str,
    goal_terms: &[String],
    cfg: &ScoringConfig,
    current_year: i32,
) -> f64 {
    let mut score = cfg.base;

    if has_numeric_token(sentence) {
        score += cfg.numeric_bonus;
    }

    let lc = sentence.to_lowercase();
    let goal_matches = goal_terms.iter().filter(|t| lc.contains(t.as_str())).count();
    if goal_matches > 0 {
        score += (cfg.goal_match_base_bonus
            + cfg.goal_match_extra_bonus * (goal_matches - 1) as f64)
            .min(cfg.goal_match_max_bonus);
    }

    if HEDGING.is_match(sentence) {
        score -= cfg.hedging_penalty;
    }
    if HYPE.is_match(sentence) {
        score -= cfg.hype_penalty;
    }
    if STRONG_VERB.is_match(sentence) {
        score += cfg.strong_verb_bonus;
    }

    let len = sentence.chars().count();
    if len < cfg.short_len_threshold {
        score -= cfg.short_len_penalty;
    }
    if len > cfg.long_len_threshold {
        score -= cfg.long_len_penalty;
    }

    if let Some(year) = latest_year(sentence)
        && current_year - year > cfg.stale_year_threshold
    {
        score -= cfg.stale_year_penalty;
    }

    round_to(score.clamp(cfg.min, cfg.max), cfg.decimals)
}

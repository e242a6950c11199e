//! The reflection gate: asks the reviewing model whether the goal is
//! satisfied and normalizes its answer into a [`Reflection`].
//!
//! Parsing is lenient — a fenced code block is accepted, malformed gap
//! lists coerce to empty — and a response that fails to parse entirely is
//! replaced by a synthesized reflection with `goal_satisfied = true` and
//! `fallback = true`. That bias toward terminating is deliberate (it
//! prevents looping forever on unparseable output); the flag keeps the
//! path distinguishable for callers wanting stricter semantics.

use delver_core::error::GenerateError;
use delver_core::observation::Observation;
use delver_core::reflection::{Contradiction, Decision, LowConfidenceClaim, Reflection};
use delver_core::{GenerateRequest, Generator, ModelParams, Usage};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*\n(.*?)```").unwrap());

const SYSTEM_PROMPT: &str = "You are a reflection module. Given the observation and prior \
summary, return JSON with: critique, decision (PROGRESS|ADJUST|STOP), goal_satisfied (bool), \
memory_note (optional), updated_summary, unmet_criteria[], missing_facts[], \
low_confidence_claims[{claim,reason}], contradictions[{topic,sources[]}]. Focus on actionable \
gaps; leave arrays empty if none.";

/// The gate's verdict plus the usage its generation reported.
#[derive(Debug)]
pub struct ReflectOutcome {
    pub reflection: Reflection,
    pub usage: Option<Usage>,
}

/// Run the reflection gate over an observation and the Run's prior running
/// summary.
///
/// An `Err` here is the generation *invocation* failing — a fatal condition
/// for the loop. Unparseable content is not an error; it resolves to the
/// fallback reflection.
pub async fn reflect(
    generator: &dyn Generator,
    params: &ModelParams,
    observation: &Observation,
    prior_summary: Option<&str>,
) -> Result<ReflectOutcome, GenerateError> {
    let observation_json =
        serde_json::to_string(observation).unwrap_or_else(|_| observation.headline.clone());
    let prompt = format!(
        "Observation: {observation_json}\nPrior Summary: {}\nReturn ONLY JSON with required keys.",
        prior_summary.filter(|s| !s.is_empty()).unwrap_or("(none)")
    );
    let request = GenerateRequest {
        system: SYSTEM_PROMPT.into(),
        prompt,
        params: params.clone(),
    };

    let output = generator.generate_collect(request).await?;
    let reflection = parse_reflection(&output.text, observation, prior_summary);
    if reflection.fallback {
        tracing::warn!("reflection response did not parse; fallback reflection terminates run");
    }
    Ok(ReflectOutcome {
        reflection,
        usage: output.usage,
    })
}

/// Coverage estimate for an unsatisfied goal: 1 when nothing is missing,
/// otherwise `1 - min(1, gaps / divisor)` floored at 0. Non-increasing in
/// the gap count for a fixed divisor.
pub fn coverage_score(gap_count: usize, divisor: f64) -> f64 {
    if gap_count == 0 {
        1.0
    } else {
        (1.0 - (gap_count as f64 / divisor).min(1.0)).max(0.0)
    }
}

fn build_fallback(observation: &Observation, prior_summary: Option<&str>) -> Reflection {
    Reflection {
        critique: observation.headline.clone(),
        decision: Some(Decision::Progress),
        goal_satisfied: true,
        memory_note: None,
        updated_summary: Some(observation.details.clone())
            .filter(|d| !d.is_empty())
            .or_else(|| prior_summary.map(str::to_string)),
        fallback: true,
        unmet_criteria: vec![],
        missing_facts: vec![],
        low_confidence_claims: vec![],
        contradictions: vec![],
    }
}

fn parse_reflection(
    text: &str,
    observation: &Observation,
    prior_summary: Option<&str>,
) -> Reflection {
    let candidate = FENCED
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);
    if candidate.trim().is_empty() {
        return build_fallback(observation, prior_summary);
    }
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) else {
        return build_fallback(observation, prior_summary);
    };

    let as_str = |key: &str| -> Option<String> {
        map.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let critique = as_str("critique")
        .or_else(|| as_str("headline"))
        .unwrap_or_else(|| "No critique".into());
    let decision = as_str("decision").as_deref().and_then(Decision::parse);
    let goal_satisfied = match map.get("goal_satisfied") {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().parse().unwrap_or(true),
        Some(_) => true,
    };
    let updated_summary = as_str("updated_summary")
        .or_else(|| as_str("details"))
        .or_else(|| prior_summary.map(str::to_string))
        .or_else(|| Some(observation.details.clone()).filter(|d| !d.is_empty()));

    Reflection {
        critique,
        decision,
        goal_satisfied,
        memory_note: as_str("memory_note"),
        updated_summary,
        fallback: false,
        unmet_criteria: string_list(map.get("unmet_criteria")),
        missing_facts: string_list(map.get("missing_facts")),
        low_confidence_claims: low_claims(map.get("low_confidence_claims")),
        contradictions: contradictions(map.get("contradictions")),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => vec![],
    }
}

fn low_claims(value: Option<&Value>) -> Vec<LowConfidenceClaim> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let claim = item.get("claim")?.as_str()?.to_string();
                let reason = item
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unclear")
                    .to_string();
                Some(LowConfidenceClaim { claim, reason })
            })
            .collect(),
        _ => vec![],
    }
}

fn contradictions(value: Option<&Value>) -> Vec<Contradiction> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let topic = item.get("topic")?.as_str()?.to_string();
                let sources = match item.get("sources") {
                    Some(Value::Array(urls)) => urls
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    _ => vec![],
                };
                Some(Contradiction { topic, sources })
            })
            .collect(),
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delver_core::observation::Quality;
    use std::collections::BTreeMap;

    fn observation() -> Observation {
        Observation {
            headline: "Strong signal across sources".into(),
            details: "Both sources agree on the 2025 release window.".into(),
            artifacts: vec![],
            quality: Quality::Ok,
            promoted_from_partial: false,
            parse_error: false,
            counters: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn parses_complete_response() {
        let text = r#"{
            "critique": "Good coverage of the release window.",
            "decision": "PROGRESS",
            "goal_satisfied": false,
            "updated_summary": "Release window confirmed; pricing unknown.",
            "unmet_criteria": ["pricing"],
            "missing_facts": ["launch partners", "regional availability"],
            "low_confidence_claims": [{"claim": "ships in June", "reason": "single source"}],
            "contradictions": [{"topic": "price", "sources": ["https://a", "https://b"]}]
        }"#;
        let reflection = parse_reflection(text, &observation(), None);
        assert!(!reflection.fallback);
        assert!(!reflection.goal_satisfied);
        assert_eq!(reflection.decision, Some(Decision::Progress));
        assert_eq!(reflection.gap_count(), 3);
        assert_eq!(reflection.low_confidence_claims[0].reason, "single source");
        assert_eq!(reflection.contradictions[0].sources.len(), 2);
    }

    #[test]
    fn fenced_response_accepted() {
        let text = "```json\n{\"critique\": \"ok\", \"goal_satisfied\": true}\n```";
        let reflection = parse_reflection(text, &observation(), None);
        assert!(!reflection.fallback);
        assert!(reflection.goal_satisfied);
    }

    #[test]
    fn unparseable_response_falls_back_satisfied() {
        let reflection = parse_reflection("total nonsense, no json", &observation(), Some("prior"));
        assert!(reflection.fallback);
        assert!(reflection.goal_satisfied);
        assert_eq!(reflection.critique, "Strong signal across sources");
        assert_eq!(
            reflection.updated_summary.as_deref(),
            Some("Both sources agree on the 2025 release window.")
        );
    }

    #[test]
    fn empty_response_falls_back() {
        let reflection = parse_reflection("", &observation(), None);
        assert!(reflection.fallback);
        assert!(reflection.goal_satisfied);
    }

    #[test]
    fn missing_goal_satisfied_defaults_true() {
        let reflection = parse_reflection(r#"{"critique": "fine"}"#, &observation(), None);
        assert!(!reflection.fallback);
        assert!(reflection.goal_satisfied);
    }

    #[test]
    fn malformed_gap_lists_coerce_to_empty() {
        let text = r#"{
            "critique": "c",
            "goal_satisfied": false,
            "unmet_criteria": "not an array",
            "missing_facts": [1, 2, 3],
            "low_confidence_claims": [{"reason": "missing claim key"}],
            "contradictions": [{"sources": ["https://a"]}]
        }"#;
        let reflection = parse_reflection(text, &observation(), None);
        assert!(reflection.unmet_criteria.is_empty());
        assert!(reflection.missing_facts.is_empty());
        assert!(reflection.low_confidence_claims.is_empty());
        assert!(reflection.contradictions.is_empty());
    }

    #[test]
    fn unknown_decision_tag_is_none() {
        let text = r#"{"critique": "c", "decision": "RETREAT", "goal_satisfied": false}"#;
        let reflection = parse_reflection(text, &observation(), None);
        assert!(reflection.decision.is_none());
    }

    #[test]
    fn coverage_is_one_with_no_gaps() {
        assert_eq!(coverage_score(0, 5.0), 1.0);
    }

    #[test]
    fn coverage_monotonically_non_increasing() {
        let divisor = 5.0;
        let mut previous = f64::INFINITY;
        for gaps in 0..12 {
            let coverage = coverage_score(gaps, divisor);
            assert!(coverage <= previous, "coverage rose at {gaps} gaps");
            assert!((0.0..=1.0).contains(&coverage));
            previous = coverage;
        }
    }

    #[test]
    fn coverage_saturates_at_zero() {
        assert_eq!(coverage_score(5, 5.0), 0.0);
        assert_eq!(coverage_score(50, 5.0), 0.0);
    }
}

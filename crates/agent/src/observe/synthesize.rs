//! Deterministic artifact and claim synthesis, plus the optional
//! model-review refinement pass.
//!
//! After the reconciler settles an observation, every accumulated summary
//! is turned into a structured artifact: a relevance reason derived from
//! goal-term overlap, and claim sentences scored by the heuristic in
//! [`super::score`]. Model-supplied artifacts are kept only when all of
//! them are already structured objects; otherwise the derived set replaces
//! them entirely (no merge).

use delver_config::ObserveConfig;
use delver_core::observation::{Artifact, ArtifactValue, Claim, Observation};
use delver_core::source::{SourceResult, SummaryMap};
use delver_core::{GenerateRequest, Generator, ModelParams, Usage};
use serde::Deserialize;
use std::collections::HashMap;
use super::score;

/// Lowercased whitespace-split terms of the goal query.
pub fn goal_terms(goal: &str) -> Vec<String> {
    goal.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Split text into sentences at punctuation boundaries (`.`/`!`/`?`
/// followed by whitespace).
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?')
            && let Some(&(j, next)) = chars.peek()
            && next.is_whitespace()
        {
            let sentence = text[start..j].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = j;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Extract scored claims from one summary.
///
/// A sentence is claim-worthy when it carries a numeric/currency/percent
/// token or exceeds the length threshold; candidates scoring below the
/// keep-threshold are discarded, and at most `artifact_max_claims` survive.
pub fn derive_claims(
    text: &str,
    goal_terms: &[String],
    cfg: &ObserveConfig,
    current_year: i32,
) -> Vec<Claim> {
    let mut claims = Vec::new();
    for sentence in split_sentences(text)
        .into_iter()
        .take(cfg.claim_sentences_max)
    {
        let claim_worthy = score::has_numeric_token(sentence)
            || sentence.chars().count() > cfg.claim_long_sentence_threshold;
        if !claim_worthy {
            continue;
        }
        let heuristic =
            score::heuristic_confidence(sentence, goal_terms, &cfg.scoring, current_year);
        if heuristic < cfg.scoring.keep_min {
            continue;
        }
        claims.push(Claim::heuristic(sentence, heuristic));
        if claims.len() >= cfg.artifact_max_claims {
            break;
        }
    }
    claims
}

fn relevance_reason(summary: &str, goal: &str, terms: &[String]) -> String {
    let lc = summary.to_lowercase();
    let matched: Vec<&str> = terms
        .iter()
        .filter(|t| lc.contains(t.as_str()))
        .map(String::as_str)
        .collect();
    if !matched.is_empty() {
        format!("Contains goal term(s): {}", matched.join(", "))
    } else if !terms.is_empty() {
        format!("Provides context relevant to goal: {goal}")
    } else {
        "Relevant to task context".into()
    }
}

/// Build one artifact per summarized URL, deterministically.
pub fn derive_artifacts(
    summaries: &SummaryMap,
    source_index: &HashMap<String, SourceResult>,
    goal: &str,
    cfg: &ObserveConfig,
    current_year: i32,
) -> Vec<Artifact> {
    let terms = goal_terms(goal);
    summaries
        .iter()
        .map(|(url, summary)| {
            let title = source_index
                .get(url)
                .map(|s| s.title.clone())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| url.clone());
            Artifact {
                title,
                summary: summary.clone(),
                relevance_reason: relevance_reason(summary, goal, &terms),
                claims: derive_claims(summary, &terms, cfg, current_year),
                source_url: Some(url.clone()),
            }
        })
        .collect()
}

/// The replacement rule: model-supplied artifacts survive only when every
/// one of them is already a structured object; anything else is replaced
/// wholesale by the derived set.
pub fn apply_derived(observation: &mut Observation, derived: Vec<Artifact>) {
    if !observation.artifacts_structured() {
        observation.artifacts = derived.into_iter().map(ArtifactValue::Structured).collect();
    }
}

/// Refresh the sources/artifacts/claims counters, preserving any other
/// counters the model supplied.
pub fn update_counters(observation: &mut Observation, source_count: usize) {
    let claims = observation.claim_count() as u64;
    observation
        .counters
        .insert("sources".into(), source_count as u64);
    observation
        .counters
        .insert("artifacts".into(), observation.artifacts.len() as u64);
    observation.counters.insert("claims".into(), claims);
}

/// Backstops for semantically empty fields: rebuild blank details from the
/// source list and fall back to bare URLs when no artifacts exist at all.
pub fn fill_empty_fields(
    observation: &mut Observation,
    summaries: &SummaryMap,
    cfg: &ObserveConfig,
    artifact_url_limit: usize,
) {
    if observation.details.trim().is_empty() || observation.details == "(no details)" {
        let listed: Vec<String> = summaries
            .keys()
            .take(cfg.max_sources_listed)
            .map(|u| format!("- {u}"))
            .collect();
        observation.details = format!(
            "Synthesis over {} sources. Key sources:\n{}",
            summaries.len(),
            listed.join("\n")
        );
    }
    if observation.artifacts.is_empty() {
        observation.artifacts = summaries
            .keys()
            .take(artifact_url_limit)
            .cloned()
            .map(ArtifactValue::Bare)
            .collect();
    }
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    claims: Option<Vec<ReviewedClaim>>,
}

#[derive(Debug, Deserialize)]
struct ReviewedClaim {
    id: Option<String>,
    model_confidence: Option<f64>,
    rationale: Option<String>,
}

fn review_system_prompt() -> String {
    "You are a meticulous fact confidence evaluator. Output ONLY JSON with schema \
     {claims: [{id, model_confidence: number (0-1), rationale: string}]}. Be conservative; \
     penalize hedging or unverifiable marketing language. Confidence is the probability the \
     statement is factually correct given typical reliable web sources in the current year."
        .into()
}

/// Batch claims into a single review request and blend the reviewer's
/// confidences back in.
///
/// A malformed or partial response leaves unmatched claims at their
/// heuristic confidence, and a generation failure only logs a warning —
/// this pass refines scores, it never blocks an observation. Returns usage
/// when the review call completed.
pub async fn review_claims(
    generator: &dyn Generator,
    params: &ModelParams,
    goal: &str,
    observation: &mut Observation,
    cfg: &ObserveConfig,
    current_year: i32,
) -> Option<Usage> {
    let mut batch = Vec::new();
    for (ai, artifact) in observation.artifacts.iter().enumerate() {
        let Some(artifact) = artifact.as_structured() else {
            continue;
        };
        for (ci, claim) in artifact.claims.iter().enumerate() {
            batch.push(serde_json::json!({
                "id": format!("a{ai}_c{ci}"),
                "statement": claim.statement.clone(),
                "heuristic_confidence": claim.heuristic_confidence,
                "source_url": artifact.source_url.clone(),
                "summary_snippet": artifact
                    .summary
                    .chars()
                    .take(cfg.summary_snippet_chars)
                    .collect::<String>(),
            }));
            if batch.len() >= cfg.review_max_claims {
                break;
            }
        }
        if batch.len() >= cfg.review_max_claims {
            break;
        }
    }
    if batch.is_empty() {
        return None;
    }

    let payload = serde_json::json!({
        "year": current_year,
        "goal": goal,
        "claims": batch,
    });
    let request = GenerateRequest {
        system: review_system_prompt(),
        prompt: payload.to_string(),
        params: params.clone(),
    };

    let output = match generator.generate_collect(request).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("claim review failed: {e}");
            return None;
        }
    };

    match parse_review(&output.text) {
        Some(parsed) => {
            let scores: HashMap<String, (f64, Option<String>)> = parsed
                .claims
                .unwrap_or_default()
                .into_iter()
                .filter_map(|c| {
                    let id = c.id?;
                    let confidence = c.model_confidence?.clamp(0.0, 1.0);
                    Some((id, (confidence, c.rationale)))
                })
                .collect();
            merge_review_scores(observation, &scores, cfg);
        }
        None => tracing::warn!("claim review response did not parse; keeping heuristic scores"),
    }
    output.usage
}

/// Crude extraction mirroring the reviewer's tendency to preface JSON with
/// prose: parse from the first `{` to the end, falling back to the whole
/// text.
fn parse_review(text: &str) -> Option<ReviewResponse> {
    let from_brace = text.find('{').map(|i| &text[i..]).unwrap_or(text);
    serde_json::from_str(from_brace)
        .ok()
        .or_else(|| serde_json::from_str(text).ok())
}

fn merge_review_scores(
    observation: &mut Observation,
    scores: &HashMap<String, (f64, Option<String>)>,
    cfg: &ObserveConfig,
) {
    let decimals = cfg.scoring.decimals;
    for (ai, artifact) in observation.artifacts.iter_mut().enumerate() {
        let ArtifactValue::Structured(artifact) = artifact else {
            continue;
        };
        for (ci, claim) in artifact.claims.iter_mut().enumerate() {
            let key = format!("a{ai}_c{ci}");
            if let Some((model_confidence, rationale)) = scores.get(&key) {
                claim.model_confidence = Some(score::round_to(*model_confidence, decimals));
                claim.confidence =
                    score::blend(claim.heuristic_confidence, *model_confidence, decimals);
                if let Some(rationale) = rationale {
                    claim.rationale =
                        Some(rationale.chars().take(cfg.rationale_max_chars).collect());
                }
            } else {
                // No matching id in the response — heuristic stands.
                claim.confidence = claim.heuristic_confidence;
            }
        }
    }
}

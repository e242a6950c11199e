//! Observation domain types — the structured synthesis of accumulated
//! source summaries at a point in time.
//!
//! An [`Observation`] is produced once per iteration by the observe phase.
//! Its artifacts may arrive from the model as full structured objects, as
//! bare URL strings, or as partially-shaped values; [`ArtifactValue`] keeps
//! all three representable so the synthesizer can decide whether to keep or
//! rebuild them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single scored factual statement extracted from a source summary.
///
/// `confidence` is the blended value used downstream. It always equals the
/// heuristic score until a reviewer score arrives, at which point it becomes
/// the rounded mean of the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub statement: String,

    /// Blended confidence in [0,1] — the value consumers act on.
    pub confidence: f64,

    /// Deterministic lexical score. Always set on derived claims; claims
    /// kept verbatim from model output default it to 0.
    #[serde(default)]
    pub heuristic_confidence: f64,

    /// Independent reviewer score, present only after a refinement pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_confidence: Option<f64>,

    /// Reviewer's short justification, truncated at the boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Claim {
    /// A claim carrying only its heuristic score (blended = heuristic).
    pub fn heuristic(statement: impl Into<String>, score: f64) -> Self {
        Self {
            statement: statement.into(),
            confidence: score,
            heuristic_confidence: score,
            model_confidence: None,
            rationale: None,
        }
    }
}

/// One source's structured contribution to an Observation.
///
/// Only `title` is required at the deserialization boundary — model output
/// that names a source but omits the rest still counts as structured, the
/// same bar the replacement rule applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub relevance_reason: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims: Vec<Claim>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// An artifact as it may appear in raw model output.
///
/// Deserialization order matters: a JSON string becomes `Bare`, a fully
/// shaped object becomes `Structured`, and anything else (partial objects,
/// numbers, nested arrays) is preserved opaquely as `Other` rather than
/// failing the parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactValue {
    Bare(String),
    Structured(Artifact),
    Other(serde_json::Value),
}

impl ArtifactValue {
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    pub fn as_structured(&self) -> Option<&Artifact> {
        match self {
            Self::Structured(a) => Some(a),
            _ => None,
        }
    }
}

/// Whether the observation came out of a clean parse or a salvage path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Ok,
    Fallback,
}

/// The output of one iteration's synthesis. Immutable once the observe
/// phase finalizes it; consumed by the reflection gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub headline: String,
    pub details: String,

    #[serde(default)]
    pub artifacts: Vec<ArtifactValue>,

    pub quality: Quality,

    /// Set when the final buffer failed to parse and an earlier valid
    /// partial was promoted in its place.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub promoted_from_partial: bool,

    /// Set when neither the final buffer nor any partial parsed and the
    /// observation was synthesized from raw text.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parse_error: bool,

    /// Small counters map (sources / artifacts / claims, plus anything the
    /// model supplied).
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,

    /// Unknown fields from the model response, preserved opaquely.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Observation {
    /// Total claims across structured artifacts.
    pub fn claim_count(&self) -> usize {
        self.artifacts
            .iter()
            .filter_map(ArtifactValue::as_structured)
            .map(|a| a.claims.len())
            .sum()
    }

    /// True when every artifact is a fully shaped object.
    pub fn artifacts_structured(&self) -> bool {
        !self.artifacts.is_empty() && self.artifacts.iter().all(ArtifactValue::is_structured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_value_bare_string_round_trips() {
        let value: ArtifactValue = serde_json::from_str(r#""https://example.com""#).unwrap();
        assert!(matches!(value, ArtifactValue::Bare(ref u) if u == "https://example.com"));
    }

    #[test]
    fn artifact_value_structured_object() {
        let json = r#"{
            "title": "Example",
            "summary": "A summary.",
            "relevance_reason": "Contains goal term(s): example",
            "source_url": "https://example.com"
        }"#;
        let value: ArtifactValue = serde_json::from_str(json).unwrap();
        assert!(value.is_structured());
        assert_eq!(value.as_structured().unwrap().title, "Example");
    }

    #[test]
    fn artifact_value_title_only_object_is_structured() {
        let value: ArtifactValue = serde_json::from_str(r#"{"title": "Partial"}"#).unwrap();
        assert!(value.is_structured());
        assert!(value.as_structured().unwrap().summary.is_empty());
    }

    #[test]
    fn artifact_value_untitled_object_preserved_as_other() {
        // No title — must not fail, must not become Structured.
        let value: ArtifactValue =
            serde_json::from_str(r#"{"summary": "text", "note": 3}"#).unwrap();
        assert!(matches!(value, ArtifactValue::Other(_)));
    }

    #[test]
    fn claim_count_ignores_unstructured_artifacts() {
        let obs = Observation {
            headline: "h".into(),
            details: "d".into(),
            artifacts: vec![
                ArtifactValue::Bare("https://a.example".into()),
                ArtifactValue::Structured(Artifact {
                    title: "t".into(),
                    summary: "s".into(),
                    relevance_reason: "r".into(),
                    claims: vec![
                        Claim::heuristic("one", 0.5),
                        Claim::heuristic("two", 0.6),
                    ],
                    source_url: None,
                }),
            ],
            quality: Quality::Ok,
            promoted_from_partial: false,
            parse_error: false,
            counters: BTreeMap::new(),
            extra: serde_json::Map::new(),
        };
        assert_eq!(obs.claim_count(), 2);
        assert!(!obs.artifacts_structured());
    }

    #[test]
    fn extra_fields_survive_round_trip() {
        let json = r#"{
            "headline": "h",
            "details": "d",
            "artifacts": [],
            "quality": "ok",
            "counters": {},
            "model_notes": "kept opaquely"
        }"#;
        let obs: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.extra["model_notes"], "kept opaquely");
        let out = serde_json::to_string(&obs).unwrap();
        assert!(out.contains("kept opaquely"));
    }
}

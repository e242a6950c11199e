//! Reflection domain types — the judgment of whether the goal is satisfied,
//! plus the gap lists that drive the coverage estimate.

use serde::{Deserialize, Serialize};

/// The reviewer's coarse recommendation for the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Progress,
    Adjust,
    Stop,
}

impl Decision {
    /// Lenient parse of the reviewer's decision tag; unknown tags are None.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "PROGRESS" => Some(Self::Progress),
            "ADJUST" => Some(Self::Adjust),
            "STOP" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// A claim the reviewer flagged as weakly supported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowConfidenceClaim {
    pub claim: String,
    pub reason: String,
}

/// Sources that disagree on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub topic: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// One iteration's critique of its Observation.
///
/// `fallback` marks a reflection synthesized after the reviewer's response
/// failed to parse. The synthesized path reports `goal_satisfied = true` —
/// a deliberate bias toward terminating rather than looping forever on
/// unparseable output — and the flag lets callers opt into stricter
/// semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub critique: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,

    pub goal_satisfied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_note: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_summary: Option<String>,

    #[serde(default)]
    pub fallback: bool,

    #[serde(default)]
    pub unmet_criteria: Vec<String>,

    #[serde(default)]
    pub missing_facts: Vec<String>,

    #[serde(default)]
    pub low_confidence_claims: Vec<LowConfidenceClaim>,

    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
}

impl Reflection {
    /// Combined count of unmet criteria and missing facts — the input to
    /// the coverage estimate.
    pub fn gap_count(&self) -> usize {
        self.unmet_criteria.len() + self.missing_facts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parse_is_case_insensitive() {
        assert_eq!(Decision::parse("progress"), Some(Decision::Progress));
        assert_eq!(Decision::parse(" STOP "), Some(Decision::Stop));
        assert_eq!(Decision::parse("retreat"), None);
    }

    #[test]
    fn gap_count_sums_both_lists() {
        let reflection = Reflection {
            critique: "needs more".into(),
            decision: Some(Decision::Adjust),
            goal_satisfied: false,
            memory_note: None,
            updated_summary: None,
            fallback: false,
            unmet_criteria: vec!["pricing".into(), "release date".into()],
            missing_facts: vec!["benchmark numbers".into()],
            low_confidence_claims: vec![],
            contradictions: vec![],
        };
        assert_eq!(reflection.gap_count(), 3);
    }

    #[test]
    fn decision_serializes_uppercase() {
        let json = serde_json::to_string(&Decision::Progress).unwrap();
        assert_eq!(json, "\"PROGRESS\"");
    }
}

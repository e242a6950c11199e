//! Streaming JSON reconciler for the observe phase.
//!
//! Consumes a live token stream from the generator and opportunistically
//! extracts a JSON observation on every chunk. At end-of-stream the final
//! result falls through three tiers: full-buffer parse, promotion of the
//! last good partial, and synthesis from raw text. There is no hard-failure
//! path — [`ObservationReconciler::finish`] always returns an Observation
//! with non-empty headline and details.

use delver_config::ObserveConfig;
use delver_core::observation::{ArtifactValue, Observation, Quality};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```(?:json)?\s*\n(.*?)```").unwrap());

/// Locate the JSON object substring inside raw model output: the contents
/// of a fenced code block if present, else the span between the first `{`
/// and the last `}`.
pub fn extract_json_block(raw: &str) -> Option<&str> {
    if raw.is_empty() {
        return None;
    }
    let target = FENCED
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);
    let first = target.find('{')?;
    let last = target.rfind('}')?;
    if last < first {
        return None;
    }
    Some(&target[first..=last])
}

/// The observation shape as the model emits it — everything optional,
/// unknown fields retained.
#[derive(Debug, Deserialize)]
struct RawObservation {
    headline: Option<String>,
    details: Option<String>,
    artifacts: Option<serde_json::Value>,
    quality: Option<String>,
    counters: Option<serde_json::Value>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn parse_raw(raw: &str) -> Option<RawObservation> {
    let candidate = extract_json_block(raw).unwrap_or(raw);
    serde_json::from_str(candidate).ok()
}

/// Apply the normalization rules: placeholder headline/details, artifacts
/// coerced to an array (a single non-array value is wrapped), counters
/// coerced to a numeric map, extra fields preserved opaquely.
fn normalize(raw: RawObservation) -> Observation {
    let headline = raw
        .headline
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "Observation".into());
    let details = raw
        .details
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| "(no details)".into());

    let artifacts = match raw.artifacts {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(values)) => values.into_iter().map(to_artifact).collect(),
        Some(single) => vec![to_artifact(single)],
    };

    let mut counters = BTreeMap::new();
    if let Some(serde_json::Value::Object(map)) = raw.counters {
        for (key, value) in map {
            if let Some(n) = value.as_u64() {
                counters.insert(key, n);
            }
        }
    }

    Observation {
        headline,
        details,
        artifacts,
        quality: match raw.quality.as_deref() {
            Some("fallback") => Quality::Fallback,
            _ => Quality::Ok,
        },
        promoted_from_partial: false,
        parse_error: false,
        counters,
        extra: raw.extra,
    }
}

fn to_artifact(value: serde_json::Value) -> ArtifactValue {
    serde_json::from_value(value.clone()).unwrap_or(ArtifactValue::Other(value))
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Incrementally reconciles a generation stream into an Observation.
///
/// Feed each chunk through [`push`](Self::push); when the stream ends,
/// [`finish`](Self::finish) resolves the final value through the three
/// tiers described in the module docs.
#[derive(Debug, Default)]
pub struct ObservationReconciler {
    buffer: String,
    last_partial: Option<Observation>,
}

impl ObservationReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and attempt an incremental parse. Returns the fresh
    /// partial when this chunk completed a valid observation, for live
    /// progress reporting.
    pub fn push(&mut self, chunk: &str) -> Option<Observation> {
        self.buffer.push_str(chunk);
        let candidate = extract_json_block(&self.buffer)?;
        let raw: RawObservation = serde_json::from_str(candidate).ok()?;
        let normalized = normalize(raw);
        self.last_partial = Some(normalized.clone());
        Some(normalized)
    }

    /// Everything received so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Resolve the final observation:
    ///
    /// 1. the complete buffer parses → use it (`quality = ok`);
    /// 2. else a last good partial exists → promote it, tagged;
    /// 3. else synthesize from raw text (`quality = fallback`,
    ///    `parse_error = true`).
    pub fn finish(self, cfg: &ObserveConfig) -> Observation {
        if let Some(raw) = parse_raw(&self.buffer) {
            return normalize(raw);
        }

        if let Some(mut partial) = self.last_partial {
            partial.promoted_from_partial = true;
            return partial;
        }

        let raw_text = self.buffer.trim();
        let first_line = raw_text
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or(raw_text);
        let headline = if first_line.is_empty() {
            "Observation".to_string()
        } else {
            truncate_chars(first_line, cfg.headline_max_chars)
        };
        let details = if raw_text.is_empty() {
            "(no details)".to_string()
        } else {
            truncate_chars(raw_text, cfg.details_max_chars)
        };
        tracing::warn!("observation parse failed; synthesized fallback from raw text");
        Observation {
            headline,
            details,
            artifacts: Vec::new(),
            quality: Quality::Fallback,
            promoted_from_partial: false,
            parse_error: true,
            counters: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

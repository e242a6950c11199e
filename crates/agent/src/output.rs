//! Final report generation.
//!
//! Invoked once, when a reflection reports the goal satisfied: drives the
//! generator with a technical-writer prompt over the goal and every
//! successfully summarized source, streaming deltas to the progress channel
//! and returning the accumulated Markdown.

use crate::stream_event::RunStreamEvent;
use delver_config::OutputConfig;
use delver_core::error::GenerateError;
use delver_core::source::SummarizedSource;
use delver_core::{GenerateRequest, Generator, ModelParams, Usage};
use tokio::sync::mpsc;

/// The generated report plus the usage its generation reported.
#[derive(Debug)]
pub struct ReportOutput {
    pub markdown: String,
    pub usage: Option<Usage>,
}

fn system_prompt(goal_title: &str, target_words: u32) -> String {
    format!(
        "You are a senior technical writer (your goal is: {goal_title}). Produce a complete \
         blog post in Markdown. Ground claims strictly in the provided sources/summaries. If a \
         claim is uncertain, qualify it. Do not invent facts or citations. Target length: \
         ~{target_words} words (as close as possible within the output token limit). Structure: \
         Title, TL;DR, Introduction, Key Findings (bullets), Deep Dive (sections), Conclusion, \
         Sources (bulleted URLs). Aim for a substantive long-form post (do not stop early)."
    )
}

/// Generate the final Markdown report.
///
/// The requested generation length is clamped to the configured
/// floor/ceiling — small local models default to short generations when no
/// limit is passed.
pub async fn generate_report(
    generator: &dyn Generator,
    params: &ModelParams,
    goal_title: &str,
    sources: &[SummarizedSource],
    cfg: &OutputConfig,
    progress: Option<&mpsc::Sender<RunStreamEvent>>,
) -> Result<ReportOutput, GenerateError> {
    let requested = params.max_tokens.unwrap_or(cfg.max_tokens);
    let effective_max_tokens = requested.clamp(cfg.min_tokens, cfg.max_tokens);

    let payload = serde_json::json!({
        "goal_title": goal_title,
        "search_results_with_summaries": sources,
    });
    let request = GenerateRequest {
        system: system_prompt(goal_title, cfg.target_words),
        prompt: payload.to_string(),
        params: ModelParams {
            max_tokens: Some(effective_max_tokens),
            ..params.clone()
        },
    };

    let mut rx = generator.generate(request).await?;
    let mut markdown = String::new();
    let mut usage = None;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            Ok(chunk) => {
                if let Some(text) = chunk.text {
                    if let Some(progress) = progress {
                        let _ = progress
                            .send(RunStreamEvent::OutputDelta {
                                chunk: text.clone(),
                            })
                            .await;
                    }
                    markdown.push_str(&text);
                }
                if chunk.usage.is_some() {
                    usage = chunk.usage;
                }
            }
            Err(e) => {
                tracing::warn!("output stream interrupted: {e}");
                break;
            }
        }
    }

    Ok(ReportOutput {
        markdown: markdown.trim().to_string(),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use delver_collab::ScriptedGenerator;

    fn params() -> ModelParams {
        ModelParams {
            model: "mock-model".into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    fn sources() -> Vec<SummarizedSource> {
        vec![SummarizedSource {
            title: "Source".into(),
            url: "https://a.example".into(),
            snippet: "snippet".into(),
            summary: "summary".into(),
        }]
    }

    #[tokio::test]
    async fn report_accumulates_and_trims() {
        let generator = ScriptedGenerator::single("  # Report\n\nBody text.  ");
        let report = generate_report(
            &generator,
            &params(),
            "rust async runtimes",
            &sources(),
            &OutputConfig::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(report.markdown, "# Report\n\nBody text.");
        assert!(report.usage.is_some());
    }

    #[tokio::test]
    async fn report_streams_deltas_to_progress() {
        let generator = ScriptedGenerator::single("# Long report body").with_chunk_size(4);
        let (tx, mut rx) = mpsc::channel(64);
        let report = generate_report(
            &generator,
            &params(),
            "goal",
            &sources(),
            &OutputConfig::default(),
            Some(&tx),
        )
        .await
        .unwrap();
        drop(tx);

        let mut streamed = String::new();
        while let Some(event) = rx.recv().await {
            if let RunStreamEvent::OutputDelta { chunk } = event {
                streamed.push_str(&chunk);
            }
        }
        assert_eq!(streamed, "# Long report body");
        assert_eq!(report.markdown, "# Long report body");
    }

    #[tokio::test]
    async fn failed_invocation_propagates() {
        let generator = ScriptedGenerator::sequence(Vec::<String>::new());
        let result = generate_report(
            &generator,
            &params(),
            "goal",
            &sources(),
            &OutputConfig::default(),
            None,
        )
        .await;
        assert!(result.is_err());
    }
}

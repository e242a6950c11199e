//! The research loop implementation.
//!
//! Drives one Run through repeated search → fetch → summarize → observe →
//! reflect iterations until a reflection reports the goal satisfied, the
//! iteration budget runs out, or a fatal collaborator error aborts the Run.
//!
//! Ownership rules: the visited-URL set, the accumulated summary map, and
//! the Run's running summary belong to the loop alone. Fan-out workers
//! (fetch, summarize) return values; the loop folds them in between phases.
//! Contained failures (one URL's fetch or summarize) become marker values,
//! degraded model output becomes tagged fallback observations, and only
//! errors from the search/observe/reflect invocations themselves abort the
//! Run.

use crate::observe::{synthesize, ObservationReconciler};
use crate::output;
use crate::reflect;
use crate::stream_event::RunStreamEvent;
use chrono::{Datelike, Utc};
use delver_config::AppConfig;
use delver_core::error::Error;
use delver_core::event::{DomainEvent, EventBus};
use delver_core::observation::{Observation, Quality};
use delver_core::reflection::Reflection;
use delver_core::run::{Phase, Run, RunConfig, RunStatus, TerminalStatus};
use delver_core::source::{
    FetchedContent, SourceResult, SummarizedSource, SummaryMap, SUMMARIZE_ERROR_MARKER,
};
use delver_core::{
    AuditRecord, AuditSink, Fetcher, GenerateRequest, Generator, SearchEngine, Usage,
};
use delver_telemetry::{PricingTable, RunMeter};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const OBSERVE_SYSTEM_PROMPT: &str = "You are a senior AI agent analyst. Your job is to OBSERVE \
and extract key findings, headlines, and artifacts from the accumulated source summaries. \
Return a JSON object with headline, details, artifacts (array), quality, and counters.";

const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a precise summarizer. Condense the provided page \
content into a short factual summary, keeping concrete figures, names, and dates.";

/// 1-based pagination cursor for a 0-based iteration index. Bit-exact by
/// contract so result pages never overlap.
pub fn pagination_start(iteration_index: u32, page_size: u32) -> u32 {
    1 + iteration_index * page_size
}

/// An audit/UI-facing bundle of everything one iteration produced.
#[derive(Debug, Clone, Default)]
pub struct IterationBlock {
    pub iteration: u32,
    pub query: String,
    pub search_start: u32,
    pub search_results: Vec<SourceResult>,
    pub fetched: Vec<FetchedContent>,
    pub summaries: SummaryMap,
    pub observation: Option<Observation>,
    pub reflection: Option<Reflection>,

    /// Set when the observation could not be durably persisted; it remains
    /// authoritative for the reflection gate regardless.
    pub degraded: bool,
}

/// The mutable state of one Run plus the read model a reporting layer
/// consumes: iteration history, final output, and terminal status.
#[derive(Debug)]
pub struct RunHandle {
    pub run: Run,
    pub history: Vec<IterationBlock>,
    pub output_markdown: Option<String>,
    pub output_error: Option<String>,
    pub status: Option<TerminalStatus>,
}

impl RunHandle {
    fn new(run: Run) -> Self {
        Self {
            run,
            history: Vec::new(),
            output_markdown: None,
            output_error: None,
            status: None,
        }
    }
}

/// The research loop controller.
pub struct ResearchLoop {
    search: Arc<dyn SearchEngine>,
    fetcher: Arc<dyn Fetcher>,
    generator: Arc<dyn Generator>,
    audit: Arc<dyn AuditSink>,
    event_bus: Arc<EventBus>,
    config: AppConfig,
    pricing: Arc<PricingTable>,
}

impl ResearchLoop {
    /// Create a loop over the four collaborators with default configuration.
    pub fn new(
        search: Arc<dyn SearchEngine>,
        fetcher: Arc<dyn Fetcher>,
        generator: Arc<dyn Generator>,
        audit: Arc<dyn AuditSink>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            search,
            fetcher,
            generator,
            audit,
            event_bus,
            config: AppConfig::default_with_fallbacks(),
            pricing: Arc::new(PricingTable::with_defaults()),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the pricing table used for cost metering.
    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = pricing;
        self
    }

    /// Start a new Run. The handle owns all per-Run state; drive it with
    /// [`run_loop`](Self::run_loop).
    pub fn start_run(&self, config: RunConfig) -> RunHandle {
        RunHandle::new(Run::new(config))
    }

    /// Execute the loop to a terminal status.
    pub async fn run_loop(&self, handle: &mut RunHandle) -> TerminalStatus {
        self.drive(handle, None).await
    }

    /// Execute the loop, streaming [`RunStreamEvent`]s as it progresses.
    pub async fn run_loop_streaming(
        &self,
        handle: &mut RunHandle,
        progress: mpsc::Sender<RunStreamEvent>,
    ) -> TerminalStatus {
        self.drive(handle, Some(progress)).await
    }

    async fn drive(
        &self,
        handle: &mut RunHandle,
        progress: Option<mpsc::Sender<RunStreamEvent>>,
    ) -> TerminalStatus {
        let progress = progress.as_ref();
        let meter = RunMeter::new(self.pricing.clone());
        let run_id = handle.run.id.to_string();
        let query = handle.run.goal.title.trim().to_string();
        let max_iterations = handle.run.budget.max_iterations;
        let page_size = self.config.loop_cfg.page_size;

        info!(run_id = %run_id, goal = %query, max_iterations, "Research loop starting");

        if query.is_empty() {
            let error = Error::Config {
                message: "missing goal query".into(),
            };
            return self.fail(handle, &meter, 0, error, progress).await;
        }

        // Run-scoped state, owned by the loop alone.
        let mut visited: HashSet<String> = HashSet::new();
        let mut all_summaries = SummaryMap::new();
        let mut source_index: HashMap<String, SourceResult> = HashMap::new();
        let mut failed_fetches: HashSet<String> = HashSet::new();

        for i in 0..max_iterations {
            let iteration = i + 1;
            let start = pagination_start(i, page_size);
            debug!(run_id = %run_id, iteration, start, "Loop iteration");

            let mut block = IterationBlock {
                iteration,
                query: query.clone(),
                search_start: start,
                ..Default::default()
            };

            // ── Search ──
            self.phase(&run_id, iteration, Phase::Searching, progress).await;
            let results = match self
                .search_phase(&handle.run, iteration, &query, start, &meter)
                .await
            {
                Ok(results) => results,
                Err(e) => {
                    handle.history.push(block);
                    return self.fail(handle, &meter, i, e, progress).await;
                }
            };
            let total = results.len();
            let fresh: Vec<SourceResult> = results
                .into_iter()
                .filter(|r| !r.url.is_empty() && visited.insert(r.url.clone()))
                .collect();
            for result in &fresh {
                source_index.insert(result.url.clone(), result.clone());
            }
            self.event_bus.publish(DomainEvent::SearchCompleted {
                run_id: run_id.clone(),
                iteration,
                start,
                new_results: fresh.len(),
                duplicates_dropped: total - fresh.len(),
                timestamp: Utc::now(),
            });
            if let Some(p) = progress {
                let _ = p
                    .send(RunStreamEvent::SearchResults {
                        iteration,
                        results: fresh.clone(),
                    })
                    .await;
            }
            block.search_results = fresh.clone();

            // ── Fetch (fan-out per URL) ──
            self.phase(&run_id, iteration, Phase::Fetching, progress).await;
            let urls: Vec<String> = fresh.iter().map(|r| r.url.clone()).collect();
            let fetched = self.fetch_phase(&run_id, &urls, &meter).await;
            for content in &fetched {
                if !content.ok {
                    failed_fetches.insert(content.url.clone());
                }
            }
            block.fetched = fetched.clone();

            // ── Summarize (fan-out per URL) ──
            self.phase(&run_id, iteration, Phase::Summarizing, progress).await;
            let batch = self
                .summarize_phase(&handle.run, &fetched, &meter, progress)
                .await;
            for (url, summary) in &batch {
                all_summaries.insert(url.clone(), summary.clone());
            }
            block.summaries = batch.into_iter().collect();

            self.check_advisory_budgets(&handle.run, &meter);

            // ── Observe (over the union of all summaries so far) ──
            self.phase(&run_id, iteration, Phase::Observing, progress).await;
            let (observation, degraded) = match self
                .observe_phase(&handle.run, iteration, &all_summaries, &source_index, &meter, progress)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    handle.history.push(block);
                    return self.fail(handle, &meter, i, e, progress).await;
                }
            };
            block.observation = Some(observation.clone());
            block.degraded = degraded;

            // ── Reflect ──
            self.phase(&run_id, iteration, Phase::Reflecting, progress).await;
            let reflection = match self
                .reflect_phase(&handle.run, iteration, &observation, &meter)
                .await
            {
                Ok(reflection) => reflection,
                Err(e) => {
                    handle.history.push(block);
                    return self.fail(handle, &meter, i, e, progress).await;
                }
            };
            if let Some(p) = progress {
                let _ = p
                    .send(RunStreamEvent::ReflectionFinal {
                        reflection: reflection.clone(),
                    })
                    .await;
            }

            // Fold reflection results into the Run, single-threadedly.
            if let Some(summary) = &reflection.updated_summary {
                handle.run.summary = Some(summary.clone());
            }
            if !reflection.goal_satisfied {
                handle.run.coverage_score = Some(reflect::coverage_score(
                    reflection.gap_count(),
                    self.config.reflect.coverage_gap_divisor,
                ));
            }
            let satisfied = reflection.goal_satisfied;
            block.reflection = Some(reflection);
            handle.history.push(block);
            self.fold_counters(&mut handle.run, &meter, Some(iteration));

            // ── Decide ──
            if satisfied {
                self.phase(&run_id, iteration, Phase::Outputting, progress).await;
                self.output_phase(handle, iteration, &all_summaries, &source_index, &failed_fetches, &meter, progress)
                    .await;
                handle.run.status = RunStatus::Complete;
                let status = TerminalStatus::Complete;
                self.finish(handle, &meter, iteration, status.clone(), progress)
                    .await;
                return status;
            }
            info!(run_id = %run_id, iteration, "Goal not satisfied, continuing");
        }

        // Iteration budget spent — a normal terminal outcome, not an error.
        let status = TerminalStatus::Exhausted {
            iterations: max_iterations,
        };
        info!(run_id = %run_id, %status, "Research loop exhausted");
        self.finish(handle, &meter, max_iterations, status.clone(), progress)
            .await;
        status
    }

    // ── Phases ────────────────────────────────────────────────────────────

    async fn search_phase(
        &self,
        run: &Run,
        iteration: u32,
        query: &str,
        start: u32,
        meter: &RunMeter,
    ) -> Result<Vec<SourceResult>, Error> {
        self.persist(AuditRecord::PlanStep {
            run_id: run.id.clone(),
            iteration,
            tool_name: "web_search".into(),
            rationale: "Paginated search against the goal query".into(),
            args: serde_json::json!({ "query": query, "start": start }),
        })
        .await;
        meter.record_step();
        let results = self.search.search(query, start).await?;
        self.persist(AuditRecord::ToolOutcome {
            run_id: run.id.clone(),
            iteration,
            tool_name: "web_search".into(),
            ok: true,
            data: Some(serde_json::json!({ "count": results.len() })),
            error: None,
        })
        .await;
        Ok(results)
    }

    async fn fetch_phase(
        &self,
        run_id: &str,
        urls: &[String],
        meter: &RunMeter,
    ) -> Vec<FetchedContent> {
        let tasks = urls.iter().map(|url| {
            let fetcher = self.fetcher.clone();
            let url = url.clone();
            async move { fetcher.fetch(&url).await }
        });
        let fetched = join_all(tasks).await;
        for content in &fetched {
            meter.record_step();
            if !content.ok {
                debug!(url = %content.url, "Fetch failed, contained as marker value");
            }
            self.event_bus.publish(DomainEvent::SourceFetched {
                run_id: run_id.into(),
                url: content.url.clone(),
                ok: content.ok,
                timestamp: Utc::now(),
            });
        }
        fetched
    }

    /// Summarize each fetched item concurrently. Workers return `(url,
    /// summary, invoked, usage)` tuples; failures degrade to marker values
    /// per URL. A URL whose fetch already failed keeps its fetch marker as
    /// its summary without a generation call.
    async fn summarize_phase(
        &self,
        run: &Run,
        contents: &[FetchedContent],
        meter: &RunMeter,
        progress: Option<&mpsc::Sender<RunStreamEvent>>,
    ) -> Vec<(String, String)> {
        let tasks = contents.iter().map(|content| {
            let generator = self.generator.clone();
            let params = run.model.clone();
            let content = content.clone();
            let progress = progress.cloned();
            async move {
                if !content.ok {
                    return (content.url.clone(), content.content.clone(), false, None);
                }
                let request = GenerateRequest {
                    system: SUMMARIZE_SYSTEM_PROMPT.into(),
                    prompt: format!(
                        "Summarize content from URL: {}\n\n{}",
                        content.url, content.content
                    ),
                    params,
                };
                let mut rx = match generator.generate(request).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!(url = %content.url, "Summarize failed: {e}");
                        return (
                            content.url.clone(),
                            SUMMARIZE_ERROR_MARKER.to_string(),
                            true,
                            None,
                        );
                    }
                };
                let mut text = String::new();
                let mut usage = None;
                let mut interrupted = false;
                while let Some(chunk) = rx.recv().await {
                    match chunk {
                        Ok(chunk) => {
                            if let Some(delta) = chunk.text {
                                if let Some(p) = &progress {
                                    let _ = p
                                        .send(RunStreamEvent::SummaryDelta {
                                            url: content.url.clone(),
                                            chunk: delta.clone(),
                                        })
                                        .await;
                                }
                                text.push_str(&delta);
                            }
                            if chunk.usage.is_some() {
                                usage = chunk.usage;
                            }
                        }
                        Err(e) => {
                            warn!(url = %content.url, "Summarize stream interrupted: {e}");
                            interrupted = true;
                            break;
                        }
                    }
                }
                if interrupted || text.trim().is_empty() {
                    (
                        content.url.clone(),
                        SUMMARIZE_ERROR_MARKER.to_string(),
                        true,
                        usage,
                    )
                } else {
                    (content.url.clone(), text, true, usage)
                }
            }
        });

        let results = join_all(tasks).await;
        let run_id = run.id.to_string();
        for (url, summary, invoked, usage) in &results {
            if *invoked {
                meter.record_step();
            }
            if let Some(usage) = usage {
                self.record_usage(&run_id, &run.model.model, meter, usage);
            }
            self.event_bus.publish(DomainEvent::SummaryReady {
                run_id: run_id.clone(),
                url: url.clone(),
                ok: *invoked && summary.as_str() != SUMMARIZE_ERROR_MARKER,
                timestamp: Utc::now(),
            });
        }
        results
            .into_iter()
            .map(|(url, summary, _, _)| (url, summary))
            .collect()
    }

    async fn observe_phase(
        &self,
        run: &Run,
        iteration: u32,
        summaries: &SummaryMap,
        source_index: &HashMap<String, SourceResult>,
        meter: &RunMeter,
        progress: Option<&mpsc::Sender<RunStreamEvent>>,
    ) -> Result<(Observation, bool), Error> {
        self.persist(AuditRecord::PlanStep {
            run_id: run.id.clone(),
            iteration,
            tool_name: "observe".into(),
            rationale: "Observation synthesis over summaries".into(),
            args: serde_json::json!({ "summary_keys": summaries.keys().collect::<Vec<_>>() }),
        })
        .await;

        let request = GenerateRequest {
            system: OBSERVE_SYSTEM_PROMPT.into(),
            prompt: observe_prompt(run, summaries),
            params: run.model.clone(),
        };
        meter.record_step();
        let mut rx = self.generator.generate(request).await.map_err(Error::from)?;

        let mut reconciler = ObservationReconciler::new();
        let mut usage = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(chunk) => {
                    if let Some(delta) = chunk.text
                        && !delta.is_empty()
                        && let Some(partial) = reconciler.push(&delta)
                        && let Some(p) = progress
                    {
                        let _ = p
                            .send(RunStreamEvent::PartialObservation {
                                observation: partial,
                            })
                            .await;
                    }
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                }
                Err(e) => {
                    // Degraded, not fatal: the reconciler salvages whatever
                    // already arrived.
                    warn!("Observe stream interrupted: {e}");
                    break;
                }
            }
        }
        if let Some(usage) = &usage {
            self.record_usage(&run.id.to_string(), &run.model.model, meter, usage);
        }

        let mut observation = reconciler.finish(&self.config.observe);

        // Deterministic artifact synthesis over everything summarized so far.
        let current_year = Utc::now().year();
        let derived = synthesize::derive_artifacts(
            summaries,
            source_index,
            &run.goal.title,
            &self.config.observe,
            current_year,
        );
        synthesize::apply_derived(&mut observation, derived);
        synthesize::fill_empty_fields(
            &mut observation,
            summaries,
            &self.config.observe,
            self.config.loop_cfg.page_size as usize,
        );
        synthesize::update_counters(&mut observation, summaries.len());

        // Optional reviewer refinement of claim confidence.
        if self.config.loop_cfg.claim_review && observation.claim_count() > 0 {
            meter.record_step();
            if let Some(usage) = synthesize::review_claims(
                self.generator.as_ref(),
                &run.model,
                &run.goal.title,
                &mut observation,
                &self.config.observe,
                current_year,
            )
            .await
            {
                self.record_usage(&run.id.to_string(), &run.model.model, meter, &usage);
            }
            self.persist_claim_confidences(run, &observation).await;
        }

        self.persist(AuditRecord::ToolOutcome {
            run_id: run.id.clone(),
            iteration,
            tool_name: "observe".into(),
            ok: true,
            data: Some(serde_json::json!({
                "quality": observation.quality,
                "artifacts": observation.artifacts.len(),
            })),
            error: None,
        })
        .await;

        // The observation is authoritative for the reflection gate whether
        // or not a durable record exists; a missing id only marks the
        // iteration degraded.
        let record_id = self
            .persist(AuditRecord::Observation {
                run_id: run.id.clone(),
                iteration,
                observation: observation.clone(),
            })
            .await;
        let degraded = record_id.is_none();
        if degraded {
            warn!(run_id = %run.id, iteration, "Observation not durably persisted; proceeding degraded");
            self.event_bus.publish(DomainEvent::PersistDegraded {
                run_id: run.id.to_string(),
                context: "observation".into(),
                timestamp: Utc::now(),
            });
        }

        self.event_bus.publish(DomainEvent::ObservationSynthesized {
            run_id: run.id.to_string(),
            iteration,
            quality: match observation.quality {
                Quality::Ok => "ok".into(),
                Quality::Fallback => "fallback".into(),
            },
            sources: summaries.len(),
            artifacts: observation.artifacts.len(),
            claims: observation.claim_count(),
            timestamp: Utc::now(),
        });
        if let Some(p) = progress {
            let _ = p
                .send(RunStreamEvent::ObservationFinal {
                    observation: observation.clone(),
                })
                .await;
        }
        Ok((observation, degraded))
    }

    async fn reflect_phase(
        &self,
        run: &Run,
        iteration: u32,
        observation: &Observation,
        meter: &RunMeter,
    ) -> Result<Reflection, Error> {
        self.persist(AuditRecord::PlanStep {
            run_id: run.id.clone(),
            iteration,
            tool_name: "reflect".into(),
            rationale: "Reflection over observation".into(),
            args: serde_json::json!({ "headline": observation.headline.clone() }),
        })
        .await;
        meter.record_step();
        let outcome = reflect::reflect(
            self.generator.as_ref(),
            &run.model,
            observation,
            run.summary.as_deref(),
        )
        .await
        .map_err(Error::from)?;
        if let Some(usage) = &outcome.usage {
            self.record_usage(&run.id.to_string(), &run.model.model, meter, usage);
        }
        self.persist(AuditRecord::Reflection {
            run_id: run.id.clone(),
            iteration,
            reflection: outcome.reflection.clone(),
        })
        .await;
        self.event_bus.publish(DomainEvent::ReflectionRecorded {
            run_id: run.id.to_string(),
            iteration,
            goal_satisfied: outcome.reflection.goal_satisfied,
            fallback: outcome.reflection.fallback,
            timestamp: Utc::now(),
        });
        Ok(outcome.reflection)
    }

    async fn output_phase(
        &self,
        handle: &mut RunHandle,
        iteration: u32,
        summaries: &SummaryMap,
        source_index: &HashMap<String, SourceResult>,
        failed_fetches: &HashSet<String>,
        meter: &RunMeter,
        progress: Option<&mpsc::Sender<RunStreamEvent>>,
    ) {
        // Sources whose fetch failed never reach the report.
        let sources: Vec<SummarizedSource> = summaries
            .iter()
            .filter(|(url, _)| !failed_fetches.contains(*url))
            .map(|(url, summary)| {
                let hit = source_index.get(url);
                SummarizedSource {
                    title: hit
                        .map(|s| s.title.clone())
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| url.clone()),
                    url: url.clone(),
                    snippet: hit.map(|s| s.snippet.clone()).unwrap_or_default(),
                    summary: summary.clone(),
                }
            })
            .collect();

        meter.record_step();
        match output::generate_report(
            self.generator.as_ref(),
            &handle.run.model,
            &handle.run.goal.title,
            &sources,
            &self.config.output,
            progress,
        )
        .await
        {
            Ok(report) => {
                if let Some(usage) = &report.usage {
                    self.record_usage(&handle.run.id.to_string(), &handle.run.model.model, meter, usage);
                }
                if report.markdown.is_empty() {
                    handle.output_error = Some("Output generation failed".into());
                } else {
                    self.persist(AuditRecord::ToolOutcome {
                        run_id: handle.run.id.clone(),
                        iteration,
                        tool_name: "output".into(),
                        ok: true,
                        data: Some(serde_json::json!({ "chars_out": report.markdown.len() })),
                        error: None,
                    })
                    .await;
                    handle.output_markdown = Some(report.markdown);
                }
            }
            Err(e) => {
                // Output failure never fails a satisfied Run.
                warn!(run_id = %handle.run.id, "Output generation failed: {e}");
                handle.output_error = Some("Output generation failed".into());
            }
        }
    }

    // ── Plumbing ──────────────────────────────────────────────────────────

    async fn phase(
        &self,
        run_id: &str,
        iteration: u32,
        phase: Phase,
        progress: Option<&mpsc::Sender<RunStreamEvent>>,
    ) {
        self.event_bus.publish(DomainEvent::PhaseChanged {
            run_id: run_id.into(),
            iteration,
            phase,
            timestamp: Utc::now(),
        });
        if let Some(p) = progress {
            let _ = p.send(RunStreamEvent::Phase { iteration, phase }).await;
        }
    }

    /// Persist an audit record; failures are logged, never propagated.
    async fn persist(&self, record: AuditRecord) -> Option<String> {
        match self.audit.persist(record).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Audit persist failed: {e}");
                None
            }
        }
    }

    async fn persist_claim_confidences(&self, run: &Run, observation: &Observation) {
        for (ai, artifact) in observation.artifacts.iter().enumerate() {
            let Some(artifact) = artifact.as_structured() else {
                continue;
            };
            for (ci, claim) in artifact.claims.iter().enumerate() {
                self.persist(AuditRecord::ClaimConfidence {
                    run_id: run.id.clone(),
                    artifact_index: ai,
                    claim_index: ci,
                    statement: claim.statement.clone(),
                    heuristic_confidence: claim.heuristic_confidence,
                    model_confidence: claim.model_confidence,
                    blended_confidence: claim.confidence,
                    rationale: claim.rationale.clone(),
                })
                .await;
            }
        }
    }

    fn record_usage(&self, run_id: &str, model: &str, meter: &RunMeter, usage: &Usage) {
        meter.record_generation(model, usage);
        self.event_bus.publish(DomainEvent::GenerationUsage {
            run_id: run_id.into(),
            model: model.into(),
            tokens_used: usage.total_tokens,
            timestamp: Utc::now(),
        });
    }

    /// Tracked-but-not-enforced budget ceilings: log when crossed.
    fn check_advisory_budgets(&self, run: &Run, meter: &RunMeter) {
        let snapshot = meter.snapshot();
        if let Some(max) = run.budget.max_tokens
            && snapshot.tokens_used > max
        {
            warn!(used = snapshot.tokens_used, max, "Token budget exceeded (tracked, not enforced)");
        }
        if let Some(max) = run.budget.max_steps
            && snapshot.steps_used > max
        {
            warn!(used = snapshot.steps_used, max, "Step budget exceeded (tracked, not enforced)");
        }
        if let Some(max) = run.budget.max_cost_usd
            && snapshot.cost_used > max
        {
            warn!(used = snapshot.cost_used, max, "Cost budget exceeded (tracked, not enforced)");
        }
        if let Some(max) = run.budget.max_elapsed_ms
            && snapshot.elapsed_ms > max
        {
            warn!(used = snapshot.elapsed_ms, max, "Time budget exceeded (tracked, not enforced)");
        }
    }

    fn fold_counters(&self, run: &mut Run, meter: &RunMeter, completed: Option<u32>) {
        let snapshot = meter.snapshot();
        if let Some(iterations) = completed {
            run.counters.iterations_completed = iterations;
        }
        run.counters.steps_used = snapshot.steps_used;
        run.counters.tokens_used = snapshot.tokens_used;
        run.counters.cost_used = snapshot.cost_used;
        run.counters.elapsed_ms = snapshot.elapsed_ms;
        run.updated_at = Utc::now();
    }

    async fn fail(
        &self,
        handle: &mut RunHandle,
        meter: &RunMeter,
        completed_iterations: u32,
        error: Error,
        progress: Option<&mpsc::Sender<RunStreamEvent>>,
    ) -> TerminalStatus {
        warn!(run_id = %handle.run.id, error = %error, "Fatal error aborted the loop");
        handle.run.status = RunStatus::Error;
        let status = TerminalStatus::Failed {
            message: error.to_string(),
        };
        self.finish(handle, meter, completed_iterations, status.clone(), progress)
            .await;
        status
    }

    async fn finish(
        &self,
        handle: &mut RunHandle,
        meter: &RunMeter,
        iterations: u32,
        status: TerminalStatus,
        progress: Option<&mpsc::Sender<RunStreamEvent>>,
    ) {
        self.fold_counters(&mut handle.run, meter, None);
        handle.status = Some(status.clone());
        self.event_bus.publish(DomainEvent::RunFinished {
            run_id: handle.run.id.to_string(),
            status: status.to_string(),
            iterations,
            timestamp: Utc::now(),
        });
        if let Some(p) = progress {
            if let TerminalStatus::Failed { message } = &status {
                let _ = p
                    .send(RunStreamEvent::Error {
                        message: message.clone(),
                    })
                    .await;
            }
            let _ = p
                .send(RunStreamEvent::Done {
                    status: status.to_string(),
                    iterations,
                })
                .await;
        }
        info!(run_id = %handle.run.id, %status, "Research loop finished");
    }
}

fn observe_prompt(run: &Run, summaries: &SummaryMap) -> String {
    let summaries_text = summaries
        .iter()
        .map(|(url, summary)| format!("URL: {url}\nSummary: {summary}"))
        .collect::<Vec<_>>()
        .join("\n---\n");
    let mut prompt = format!(
        "Given the following accumulated summaries, perform the OBSERVE step.\n{summaries_text}\nGoal: {}",
        run.goal.title
    );
    if !run.goal.instructions.is_empty() {
        prompt.push_str(&format!("\nInstructions: {}", run.goal.instructions));
    }
    if let Some(summary) = &run.summary {
        prompt.push_str(&format!("\nRunning summary: {summary}"));
    }
    prompt.push_str(
        "\nReturn a JSON object with headline, details, artifacts (array), quality, and \
         counters. Each artifact should align with a source summary.",
    );
    prompt
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use delver_collab::{
        FixtureFetcher, MemoryAuditSink, NoopAuditSink, ScriptedGenerator, StaticSearchEngine,
        FETCH_ERROR_MARKER,
    };
    use delver_core::error::SearchError;
    use delver_core::run::{BudgetLimits, GoalSpec, ModelParams};
    use std::sync::Mutex;

    /// Returns the same results on every call and records each start offset.
    struct FixedSearch {
        results: Vec<SourceResult>,
        starts: Mutex<Vec<u32>>,
    }

    impl FixedSearch {
        fn new(results: Vec<SourceResult>) -> Self {
            Self {
                results,
                starts: Mutex::new(Vec::new()),
            }
        }

        fn starts(&self) -> Vec<u32> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SearchEngine for FixedSearch {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn search(
            &self,
            _query: &str,
            start: u32,
        ) -> Result<Vec<SourceResult>, SearchError> {
            self.starts.lock().unwrap().push(start);
            Ok(self.results.clone())
        }
    }

    struct FailingSearch;

    #[async_trait]
    impl SearchEngine for FailingSearch {
        fn name(&self) -> &str {
            "failing"
        }

        async fn search(
            &self,
            _query: &str,
            _start: u32,
        ) -> Result<Vec<SourceResult>, SearchError> {
            Err(SearchError::Backend {
                status_code: 503,
                message: "upstream unavailable".into(),
            })
        }
    }

    fn source(url: &str, title: &str) -> SourceResult {
        SourceResult {
            title: title.into(),
            url: url.into(),
            snippet: format!("snippet for {title}"),
            origin: "fixed".into(),
        }
    }

    fn run_config(goal: &str, max_iterations: u32) -> RunConfig {
        RunConfig {
            goal: GoalSpec {
                title: goal.into(),
                instructions: String::new(),
            },
            model: ModelParams {
                model: "mock-model".into(),
                temperature: 0.7,
                max_tokens: None,
            },
            budget: BudgetLimits {
                max_iterations,
                ..BudgetLimits::default()
            },
        }
    }

    const OBSERVE_JSON: &str = r#"{
        "headline": "Tokio speedups confirmed",
        "details": "Sources agree on major performance gains.",
        "artifacts": [{
            "title": "Tokio 1.40 benchmarks",
            "summary": "Tokio 1.40 delivers a 30% latency reduction.",
            "relevance_reason": "Directly addresses the goal",
            "source_url": "https://a.example",
            "claims": [
                {"statement": "Tokio 1.40 delivers a 30% latency reduction.",
                 "confidence": 0.9, "heuristic_confidence": 0.9},
                {"statement": "Broader gains are expected later.",
                 "confidence": 0.3, "heuristic_confidence": 0.3}
            ]
        }],
        "quality": "ok",
        "counters": {"sources": 2}
    }"#;

    const REFLECT_SATISFIED: &str = r#"{
        "critique": "Goal fully covered.",
        "decision": "STOP",
        "goal_satisfied": true,
        "updated_summary": "Tokio performance improvements are well documented."
    }"#;

    const REFLECT_UNSATISFIED: &str = r#"{
        "critique": "Needs pricing data.",
        "decision": "PROGRESS",
        "goal_satisfied": false,
        "updated_summary": "Partial coverage so far.",
        "unmet_criteria": ["pricing"],
        "missing_facts": ["release date"]
    }"#;

    fn scripted_generator(observe: &str, reflect: &str) -> ScriptedGenerator {
        ScriptedGenerator::sequence(Vec::<String>::new())
            .with_keyed_response(
                "Summarize content from URL: https://a.example",
                "Tokio 1.40 delivers a 30% latency reduction in 2025 benchmarks.",
            )
            .with_keyed_response(
                "Summarize content from URL: https://b.example",
                "The scheduler rewrite reports 2x throughput gains for async workloads.",
            )
            .with_keyed_response("OBSERVE step", observe)
            .with_keyed_response("confidence evaluator", r#"{"claims": []}"#)
            .with_keyed_response("reflection module", reflect)
            .with_keyed_response("technical writer", "# Research Report\n\nFindings hold up.")
    }

    fn fixtures() -> FixtureFetcher {
        FixtureFetcher::from_pairs([
            ("https://a.example", "Tokio 1.40 announcement page content."),
            ("https://b.example", "Scheduler rewrite details page."),
        ])
    }

    fn research_loop(
        search: Arc<dyn SearchEngine>,
        fetcher: Arc<dyn Fetcher>,
        generator: Arc<dyn Generator>,
        audit: Arc<dyn AuditSink>,
    ) -> ResearchLoop {
        ResearchLoop::new(search, fetcher, generator, audit, Arc::new(EventBus::default()))
    }

    #[test]
    fn pagination_cursor_is_bit_exact() {
        assert_eq!(pagination_start(0, 10), 1);
        assert_eq!(pagination_start(1, 10), 11);
        assert_eq!(pagination_start(2, 10), 21);
        assert_eq!(pagination_start(3, 7), 22);
    }

    #[tokio::test]
    async fn single_iteration_success_invokes_output() {
        let search = Arc::new(FixedSearch::new(vec![
            source("https://a.example", "Tokio 1.40"),
            source("https://b.example", "Scheduler rewrite"),
        ]));
        let audit = Arc::new(MemoryAuditSink::new());
        let agent = research_loop(
            search.clone(),
            Arc::new(fixtures()),
            Arc::new(scripted_generator(OBSERVE_JSON, REFLECT_SATISFIED)),
            audit.clone(),
        );

        let mut handle = agent.start_run(run_config("tokio performance", 5));
        let status = agent.run_loop(&mut handle).await;

        assert_eq!(status, TerminalStatus::Complete);
        assert_eq!(handle.run.status, RunStatus::Complete);
        assert_eq!(handle.history.len(), 1);
        assert_eq!(handle.run.counters.iterations_completed, 1);
        assert_eq!(search.starts(), vec![1]);

        // Output was generated.
        let markdown = handle.output_markdown.as_deref().unwrap();
        assert!(markdown.contains("# Research Report"));
        assert!(handle.output_error.is_none());

        // Model-supplied structured artifacts were kept, confidences intact.
        let observation = handle.history[0].observation.as_ref().unwrap();
        let artifact = observation.artifacts[0].as_structured().unwrap();
        assert_eq!(artifact.claims.len(), 2);
        assert_eq!(artifact.claims[0].confidence, 0.9);
        assert_eq!(artifact.claims[1].confidence, 0.3);
        assert_eq!(observation.counters["claims"], 2);

        // Reflection folded into the Run.
        assert_eq!(
            handle.run.summary.as_deref(),
            Some("Tokio performance improvements are well documented.")
        );

        // Usage was metered and the audit trail populated.
        assert!(handle.run.counters.steps_used > 0);
        assert!(handle.run.counters.tokens_used > 0);
        assert!(!handle.history[0].degraded);
        let records = audit.records();
        assert!(records
            .iter()
            .any(|(_, r)| matches!(r, AuditRecord::Observation { .. })));
        assert!(records
            .iter()
            .any(|(_, r)| matches!(r, AuditRecord::Reflection { .. })));
        assert!(records
            .iter()
            .any(|(_, r)| matches!(r, AuditRecord::ClaimConfidence { .. })));
    }

    #[tokio::test]
    async fn exhausted_run_cites_iterations_and_never_outputs() {
        let search = Arc::new(FixedSearch::new(vec![
            source("https://a.example", "Tokio 1.40"),
            source("https://b.example", "Scheduler rewrite"),
        ]));
        let agent = research_loop(
            search.clone(),
            Arc::new(fixtures()),
            Arc::new(scripted_generator(OBSERVE_JSON, REFLECT_UNSATISFIED)),
            Arc::new(MemoryAuditSink::new()),
        );

        let mut handle = agent.start_run(run_config("tokio performance", 2));
        let status = agent.run_loop(&mut handle).await;

        assert_eq!(status, TerminalStatus::Exhausted { iterations: 2 });
        assert_eq!(status.to_string(), "goal not satisfied after 2 iterations");
        assert!(handle.output_markdown.is_none());
        assert!(handle.output_error.is_none());
        // Exhaustion is not an error state.
        assert_eq!(handle.run.status, RunStatus::Active);
        assert_eq!(handle.history.len(), 2);
        assert_eq!(handle.run.counters.iterations_completed, 2);

        // Pagination advanced, query unchanged.
        assert_eq!(search.starts(), vec![1, 11]);
        assert_eq!(handle.history[0].query, handle.history[1].query);

        // Deduplication: the second iteration saw no fresh URLs.
        assert!(handle.history[1].search_results.is_empty());
        assert!(handle.history[1].fetched.is_empty());

        // Coverage derives from the two reported gaps: 1 - 2/5.
        let coverage = handle.run.coverage_score.unwrap();
        assert!((coverage - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fetch_failure_is_contained_to_its_url() {
        let search = Arc::new(FixedSearch::new(vec![
            source("https://a.example", "Tokio 1.40"),
            source("https://b.example", "Scheduler rewrite"),
            source("https://c.example", "Missing page"),
        ]));
        // Observe returns prose, forcing the raw-text fallback tier and the
        // deterministic artifact rebuild.
        let agent = research_loop(
            search,
            Arc::new(fixtures()),
            Arc::new(scripted_generator(
                "This is not JSON whatsoever.",
                REFLECT_SATISFIED,
            )),
            Arc::new(MemoryAuditSink::new()),
        );

        let mut handle = agent.start_run(run_config("tokio performance", 5));
        let status = agent.run_loop(&mut handle).await;
        assert_eq!(status, TerminalStatus::Complete);

        let block = &handle.history[0];
        // The failed URL appears with an error marker, not silently absent.
        let failed = block
            .fetched
            .iter()
            .find(|f| f.url == "https://c.example")
            .unwrap();
        assert!(!failed.ok);
        assert!(block.summaries["https://c.example"].starts_with(FETCH_ERROR_MARKER));

        // The other two URLs were summarized normally.
        assert!(block.summaries["https://a.example"].contains("30% latency"));
        assert!(block.summaries["https://b.example"].contains("2x throughput"));

        // Fallback observation, artifacts rebuilt for every summarized URL.
        let observation = block.observation.as_ref().unwrap();
        assert_eq!(observation.quality, Quality::Fallback);
        assert!(observation.parse_error);
        assert_eq!(observation.artifacts.len(), 3);
        assert!(observation.artifacts_structured());
    }

    #[tokio::test]
    async fn search_error_fails_the_run() {
        let agent = research_loop(
            Arc::new(FailingSearch),
            Arc::new(fixtures()),
            Arc::new(scripted_generator(OBSERVE_JSON, REFLECT_SATISFIED)),
            Arc::new(MemoryAuditSink::new()),
        );

        let mut handle = agent.start_run(run_config("tokio performance", 5));
        let status = agent.run_loop(&mut handle).await;

        match &status {
            TerminalStatus::Failed { message } => {
                assert!(message.contains("upstream unavailable"), "{message}");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(handle.run.status, RunStatus::Error);
        assert_eq!(handle.run.counters.iterations_completed, 0);
        assert_eq!(handle.status, Some(status));
    }

    #[tokio::test]
    async fn missing_goal_query_fails_fast() {
        let agent = research_loop(
            Arc::new(StaticSearchEngine::generated("x", 5)),
            Arc::new(fixtures()),
            Arc::new(scripted_generator(OBSERVE_JSON, REFLECT_SATISFIED)),
            Arc::new(NoopAuditSink),
        );
        let mut handle = agent.start_run(run_config("   ", 5));
        let status = agent.run_loop(&mut handle).await;
        assert!(matches!(status, TerminalStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn missing_durable_id_marks_degraded_but_proceeds() {
        let search = Arc::new(FixedSearch::new(vec![
            source("https://a.example", "Tokio 1.40"),
            source("https://b.example", "Scheduler rewrite"),
        ]));
        let agent = research_loop(
            search,
            Arc::new(fixtures()),
            Arc::new(scripted_generator(OBSERVE_JSON, REFLECT_SATISFIED)),
            Arc::new(NoopAuditSink),
        );

        let mut handle = agent.start_run(run_config("tokio performance", 5));
        let status = agent.run_loop(&mut handle).await;

        // The observation stayed authoritative: reflection ran and the run
        // completed, with the iteration flagged degraded.
        assert_eq!(status, TerminalStatus::Complete);
        assert!(handle.history[0].degraded);
        assert!(handle.history[0].reflection.is_some());
    }

    #[tokio::test]
    async fn empty_search_results_are_not_fatal() {
        let agent = research_loop(
            Arc::new(FixedSearch::new(vec![])),
            Arc::new(fixtures()),
            Arc::new(scripted_generator(
                "Nothing retrieved, nothing to observe.",
                REFLECT_SATISFIED,
            )),
            Arc::new(MemoryAuditSink::new()),
        );

        let mut handle = agent.start_run(run_config("tokio performance", 3));
        let status = agent.run_loop(&mut handle).await;

        assert_eq!(status, TerminalStatus::Complete);
        let observation = handle.history[0].observation.as_ref().unwrap();
        assert!(!observation.headline.is_empty());
        assert!(observation.artifacts.is_empty());
        assert_eq!(observation.counters["sources"], 0);
    }

    #[tokio::test]
    async fn streaming_loop_emits_progress_events() {
        let search = Arc::new(FixedSearch::new(vec![
            source("https://a.example", "Tokio 1.40"),
            source("https://b.example", "Scheduler rewrite"),
        ]));
        let agent = research_loop(
            search,
            Arc::new(fixtures()),
            Arc::new(scripted_generator(OBSERVE_JSON, REFLECT_SATISFIED)),
            Arc::new(MemoryAuditSink::new()),
        );

        let (tx, mut rx) = mpsc::channel(1024);
        let mut handle = agent.start_run(run_config("tokio performance", 5));
        let status = agent.run_loop_streaming(&mut handle, tx).await;
        assert_eq!(status, TerminalStatus::Complete);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, RunStreamEvent::SummaryDelta { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunStreamEvent::PartialObservation { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunStreamEvent::ObservationFinal { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunStreamEvent::OutputDelta { .. })));
        match events.last().unwrap() {
            RunStreamEvent::Done { status, iterations } => {
                assert_eq!(status, "complete");
                assert_eq!(*iterations, 1);
            }
            other => panic!("expected Done last, got {other:?}"),
        }
    }
}

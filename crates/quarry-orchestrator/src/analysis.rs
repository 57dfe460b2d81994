use crate::config::OrchestratorConfig;
use crate::planner::Plan;
use crate::scheduler::{Scheduler, SchedulerError};
use async_trait::async_trait;
use quarry_agent::LlmBackend;
use quarry_core::{
    Contradiction, ContradictionNature, CostBreakdown, Event, EventPayload, EventPublisher, Fact,
    Gap, GapKind, Message, Perspective, QuarryError, QuarryResult, SessionId, Source, Worker,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Confidence given to facts recovered without the model's help.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Facts extracted from worker output, with the cost of extracting them.
#[derive(Debug, Clone, Default)]
pub struct FactSet {
    pub facts: Vec<Fact>,
    pub cost: CostBreakdown,
}

/// Result of one gap analysis.
#[derive(Debug, Clone, Default)]
pub struct GapAnalysis {
    /// Gaps worth a follow-up, most important first.
    pub gaps: Vec<Gap>,
    pub contradictions: Vec<Contradiction>,
    /// Per-URL quality: mean fact confidence plus a citation bonus of 0.1 per
    /// fact (at most 0.2), capped at 1.
    pub source_quality: BTreeMap<String, f64>,
    pub cost: CostBreakdown,
}

/// A failed detection. Carries the cost of the calls that succeeded before
/// the failure so it still lands in the session overhead.
#[derive(Debug)]
pub struct DetectionFailure {
    pub error: QuarryError,
    pub spent: CostBreakdown,
}

impl DetectionFailure {
    pub fn new(error: QuarryError, spent: CostBreakdown) -> Self {
        Self { error, spent }
    }
}

impl From<QuarryError> for DetectionFailure {
    fn from(error: QuarryError) -> Self {
        Self::new(error, CostBreakdown::default())
    }
}

impl fmt::Display for DetectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for DetectionFailure {}

/// Strategy that judges collected facts for contradictions and coverage gaps.
#[async_trait]
pub trait GapDetector: Send + Sync {
    /// Returns raw findings. Filtering and ranking are done by [`Analyzer`].
    async fn detect(
        &self,
        query: &str,
        perspectives: &[Perspective],
        facts: &[Fact],
        cancel: &CancellationToken,
    ) -> Result<GapAnalysis, DetectionFailure>;
}

#[derive(Debug, Deserialize)]
struct RawFact {
    #[serde(default)]
    content: String,
    #[serde(default)]
    source_url: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    FALLBACK_CONFIDENCE
}

#[derive(Debug, Deserialize)]
struct RawContradiction {
    #[serde(alias = "claim1")]
    claim_a: String,
    #[serde(default, alias = "source1")]
    source_a: String,
    #[serde(alias = "claim2")]
    claim_b: String,
    #[serde(default, alias = "source2")]
    source_b: String,
    #[serde(default)]
    nature: Option<ContradictionNature>,
}

#[derive(Debug, Deserialize)]
struct RawGap {
    description: String,
    #[serde(default = "default_confidence")]
    importance: f64,
    #[serde(default)]
    suggested_queries: Vec<String>,
    #[serde(default)]
    perspective: Option<String>,
}

/// Parses the JSON array between the first `[` and the last `]`.
fn parse_json_array<T: DeserializeOwned>(content: &str) -> Option<Vec<T>> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

async fn ask(
    llm: &dyn LlmBackend,
    messages: &[Message],
    cancel: &CancellationToken,
    what: &str,
) -> QuarryResult<(String, CostBreakdown)> {
    let completion = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(QuarryError::cancelled(format!("cancelled during {what}"))),
        r = llm.chat(messages) => r.map_err(|e| QuarryError::Analysis(format!("{what} failed: {e}")))?,
    };
    let cost = completion.cost(llm.model_id(), messages);
    Ok((completion.content, cost))
}

/// Default [`GapDetector`]: asks the model which facts contradict each
/// other and which seed questions are still unanswered.
pub struct LlmGapDetector {
    llm: Arc<dyn LlmBackend>,
}

impl LlmGapDetector {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }

    async fn contradictions(
        &self,
        facts: &[Fact],
        cancel: &CancellationToken,
    ) -> QuarryResult<(Vec<Contradiction>, CostBreakdown)> {
        if facts.len() < 2 {
            return Ok((Vec::new(), CostBreakdown::default()));
        }
        let listing: String = facts
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let url = f.source.as_ref().map_or("unknown", |s| s.url.as_str());
                format!("{}. [{url}] {}\n", i + 1, f.content)
            })
            .collect();
        let prompt = format!(
            "Identify any contradictions between these facts:\n\n{listing}\n\
             Look for direct contradictions (opposite claims), nuanced contradictions \
             (different implications) and scope contradictions (claims about different \
             conditions).\n\n\
             Return a JSON array, empty if none found:\n\
             [{{\"claim_a\": \"...\", \"source_a\": \"url\", \"claim_b\": \"...\", \
             \"source_b\": \"url\", \"nature\": \"direct|nuanced|scope\"}}]"
        );
        let messages = [Message::user(prompt)];
        let (content, cost) = ask(self.llm.as_ref(), &messages, cancel, "contradiction detection").await?;
        let contradictions = parse_json_array::<RawContradiction>(&content)
            .unwrap_or_default()
            .into_iter()
            .filter(|c| !c.claim_a.trim().is_empty() && !c.claim_b.trim().is_empty())
            .map(|c| Contradiction {
                claim_a: c.claim_a,
                source_a: c.source_a,
                claim_b: c.claim_b,
                source_b: c.source_b,
                nature: c.nature.unwrap_or(ContradictionNature::Nuanced),
            })
            .collect();
        Ok((contradictions, cost))
    }

    async fn coverage_gaps(
        &self,
        query: &str,
        perspectives: &[Perspective],
        facts: &[Fact],
        cancel: &CancellationToken,
    ) -> QuarryResult<(Vec<Gap>, CostBreakdown)> {
        let mut coverage = String::new();
        for p in perspectives {
            for q in &p.questions {
                coverage.push_str(&format!("- [{}] {q}\n", p.name));
            }
        }
        if coverage.is_empty() {
            coverage.push_str("- General comprehensive coverage of the topic\n");
        }
        let gathered: String = facts.iter().map(|f| format!("- {}\n", f.content)).collect();
        let prompt = format!(
            "Topic: {query}\n\nExpected coverage:\n{coverage}\nFacts gathered:\n{gathered}\n\
             Identify knowledge gaps: important questions above that the facts do not \
             answer yet.\n\n\
             Return a JSON array, empty if coverage is sufficient:\n\
             [{{\"description\": \"what is missing\", \"importance\": 0.8, \
             \"suggested_queries\": [\"search query\"], \"perspective\": \"name\"}}]"
        );
        let messages = [Message::user(prompt)];
        let (content, cost) = ask(self.llm.as_ref(), &messages, cancel, "gap identification").await?;
        let gaps = parse_json_array::<RawGap>(&content)
            .unwrap_or_default()
            .into_iter()
            .filter(|g| !g.description.trim().is_empty())
            .map(|g| {
                let description = g.description.trim().to_string();
                let suggested_queries = if g.suggested_queries.is_empty() {
                    vec![description.clone()]
                } else {
                    g.suggested_queries
                };
                Gap {
                    description,
                    kind: GapKind::Coverage,
                    importance: g.importance.clamp(0.0, 1.0),
                    suggested_queries,
                    perspective: g
                        .perspective
                        .filter(|name| perspectives.iter().any(|p| &p.name == name)),
                }
            })
            .collect();
        Ok((gaps, cost))
    }
}

#[async_trait]
impl GapDetector for LlmGapDetector {
    async fn detect(
        &self,
        query: &str,
        perspectives: &[Perspective],
        facts: &[Fact],
        cancel: &CancellationToken,
    ) -> Result<GapAnalysis, DetectionFailure> {
        let (contradictions, contradiction_cost) = self.contradictions(facts, cancel).await?;
        let (mut gaps, gap_cost) = self
            .coverage_gaps(query, perspectives, facts, cancel)
            .await
            .map_err(|error| DetectionFailure::new(error, contradiction_cost))?;
        gaps.extend(contradictions.iter().map(contradiction_gap));
        Ok(GapAnalysis {
            gaps,
            contradictions,
            source_quality: BTreeMap::new(),
            cost: contradiction_cost.add(gap_cost),
        })
    }
}

/// A follow-up that tries to settle a contradiction.
fn contradiction_gap(c: &Contradiction) -> Gap {
    let importance = match c.nature {
        ContradictionNature::Direct => 0.8,
        ContradictionNature::Nuanced => 0.6,
        ContradictionNature::Scope => 0.5,
    };
    Gap {
        description: format!("Resolve conflicting claims: \"{}\" vs \"{}\"", c.claim_a, c.claim_b),
        kind: GapKind::Contradiction,
        importance,
        suggested_queries: vec![c.claim_a.clone(), c.claim_b.clone()],
        perspective: None,
    }
}

/// Extracts facts and finds gaps between rounds of research.
pub struct Analyzer {
    llm: Arc<dyn LlmBackend>,
    detector: Arc<dyn GapDetector>,
    config: OrchestratorConfig,
}

impl Analyzer {
    /// Uses [`LlmGapDetector`] over the same model.
    pub fn new(llm: Arc<dyn LlmBackend>, config: OrchestratorConfig) -> Self {
        let detector = Arc::new(LlmGapDetector::new(Arc::clone(&llm)));
        Self::with_detector(llm, detector, config)
    }

    pub fn with_detector(
        llm: Arc<dyn LlmBackend>,
        detector: Arc<dyn GapDetector>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            llm,
            detector,
            config,
        }
    }

    /// Pulls atomic claims out of the completed workers' output.
    ///
    /// When the model's answer cannot be parsed each completed worker
    /// contributes its first paragraph as a single fact instead.
    pub async fn extract_facts(
        &self,
        query: &str,
        workers: &[Worker],
        cancel: &CancellationToken,
    ) -> QuarryResult<FactSet> {
        let completed: Vec<&Worker> = workers
            .iter()
            .filter(|w| w.is_complete() && !w.output.trim().is_empty())
            .collect();
        if completed.is_empty() {
            return Ok(FactSet::default());
        }

        let mut findings = String::new();
        for w in &completed {
            findings.push_str(&format!("## {}\n{}\n", w.objective, w.output.trim()));
            if !w.sources.is_empty() {
                findings.push_str("Sources:\n");
                for s in &w.sources {
                    findings.push_str(&format!("- {} ({})\n", s.url, s.title));
                }
            }
            findings.push('\n');
        }
        let prompt = format!(
            "Extract the key factual claims about \"{query}\" from these findings.\n\n\
             {findings}\
             Return a JSON array:\n\
             [{{\"content\": \"one atomic claim\", \"source_url\": \"url it came from\", \
             \"confidence\": 0.8}}]"
        );
        let messages = [Message::user(prompt)];
        let (content, cost) = ask(self.llm.as_ref(), &messages, cancel, "fact extraction").await?;

        let known: Vec<&Source> = completed.iter().flat_map(|w| w.sources.iter()).collect();
        let facts = match parse_json_array::<RawFact>(&content) {
            Some(raw) => merge_facts(raw.into_iter().filter_map(|f| {
                let text = f.content.trim();
                if text.is_empty() {
                    return None;
                }
                let source = known
                    .iter()
                    .find(|s| s.url == f.source_url.trim())
                    .map(|s| (*s).clone());
                Some(Fact::new(text, source, f.confidence))
            })),
            None => {
                debug!("Fact extraction response unparseable, using worker summaries");
                fallback_facts(&completed)
            }
        };
        Ok(FactSet { facts, cost })
    }

    /// Finds contradictions and gaps, keeping the most important gaps above
    /// the configured threshold.
    pub async fn find_gaps(
        &self,
        query: &str,
        perspectives: &[Perspective],
        facts: &[Fact],
        cancel: &CancellationToken,
    ) -> Result<GapAnalysis, DetectionFailure> {
        let mut analysis = self
            .detector
            .detect(query, perspectives, facts, cancel)
            .await?;
        analysis
            .gaps
            .retain(|g| g.importance >= self.config.min_gap_importance);
        analysis.gaps.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        analysis.gaps.truncate(self.config.max_gaps_per_round);
        analysis.source_quality = source_quality(facts);
        Ok(analysis)
    }
}

/// Collapses facts with the same claim into one, recording the other
/// sources as corroboration.
fn merge_facts(facts: impl IntoIterator<Item = Fact>) -> Vec<Fact> {
    let mut merged: Vec<Fact> = Vec::new();
    for fact in facts {
        let key = normalize(&fact.content);
        match merged.iter_mut().find(|f| normalize(&f.content) == key) {
            Some(existing) => {
                if let Some(source) = fact.source {
                    let duplicate = existing.source.as_ref().is_some_and(|s| s.url == source.url)
                        || existing.corroborated_by.iter().any(|s| s.url == source.url);
                    if !duplicate {
                        existing.corroborated_by.push(source);
                    }
                }
                existing.confidence = existing.confidence.max(fact.confidence);
            }
            None => merged.push(fact),
        }
    }
    merged
}

fn fallback_facts(completed: &[&Worker]) -> Vec<Fact> {
    completed
        .iter()
        .filter_map(|w| {
            let paragraph = w
                .output
                .split("\n\n")
                .map(str::trim)
                .find(|p| !p.is_empty())?;
            Some(Fact::new(
                paragraph,
                w.sources.first().cloned(),
                FALLBACK_CONFIDENCE,
            ))
        })
        .collect()
}

fn source_quality(facts: &[Fact]) -> BTreeMap<String, f64> {
    let mut tally: BTreeMap<String, (usize, f64)> = BTreeMap::new();
    for fact in facts {
        if let Some(source) = &fact.source {
            let entry = tally.entry(source.url.clone()).or_default();
            entry.0 += 1;
            entry.1 += fact.confidence;
        }
    }
    tally
        .into_iter()
        .map(|(url, (count, sum))| {
            let mean = sum / count as f64;
            let bonus = (0.1 * count as f64).min(0.2);
            (url, (mean + bonus).min(1.0))
        })
        .collect()
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard similarity of the word sets of two gap lists.
pub fn gap_similarity(a: &[Gap], b: &[Gap]) -> f64 {
    let words = |gaps: &[Gap]| -> HashSet<String> {
        gaps.iter()
            .flat_map(|g| {
                g.normalized()
                    .split(' ')
                    .filter(|w| !w.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    };
    let (a, b) = (words(a), words(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let shared = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    shared / union
}

/// Why the gap-filling loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The configured number of rounds ran.
    Budget,
    /// Analysis found nothing that had not already been targeted.
    NoNewGaps,
    /// This round's gaps were too similar to the previous round's.
    Converged,
    /// Analysis failed; the facts gathered so far are kept.
    AnalysisFailed,
    Cancelled,
}

/// What the gap-filling loop produced.
#[derive(Debug, Clone)]
pub struct GapFillOutcome {
    pub rounds: u32,
    /// Gap-fill workers in their final state.
    pub workers: Vec<Worker>,
    /// Facts from the last analysis.
    pub facts: Vec<Fact>,
    /// Contradictions found across all rounds.
    pub contradictions: Vec<Contradiction>,
    /// Cost of analysis LLM calls. Worker cost is merged by the scheduler.
    pub overhead: CostBreakdown,
    pub stop: LoopStop,
}

/// Repeatedly analyzes the evidence and dispatches workers for the gaps it
/// finds.
pub struct GapFillLoop<'a> {
    analyzer: &'a Analyzer,
    scheduler: &'a Scheduler,
    events: Arc<dyn EventPublisher>,
    config: &'a OrchestratorConfig,
}

impl<'a> GapFillLoop<'a> {
    pub fn new(
        analyzer: &'a Analyzer,
        scheduler: &'a Scheduler,
        events: Arc<dyn EventPublisher>,
        config: &'a OrchestratorConfig,
    ) -> Self {
        Self {
            analyzer,
            scheduler,
            events,
            config,
        }
    }

    /// Runs at most `budget` rounds on top of the workers already in the
    /// session.
    pub async fn run(
        &self,
        session_id: &SessionId,
        plan: &Plan,
        existing: &[Worker],
        budget: u32,
        cancel: &CancellationToken,
    ) -> GapFillOutcome {
        let mut outcome = GapFillOutcome {
            rounds: 0,
            workers: Vec::new(),
            facts: Vec::new(),
            contradictions: Vec::new(),
            overhead: CostBreakdown::default(),
            stop: LoopStop::Budget,
        };
        let mut history: HashSet<String> = HashSet::new();
        let mut previous: Vec<Gap> = Vec::new();
        let mut next_sequence = existing.iter().map(|w| w.sequence).max().unwrap_or(0) + 1;

        for round in 1..=budget {
            if cancel.is_cancelled() {
                outcome.stop = LoopStop::Cancelled;
                break;
            }

            let analysis = match self
                .analyze(session_id, plan, existing, round, &mut outcome, cancel)
                .await
            {
                Ok(analysis) => analysis,
                Err(e) if e.is_cancelled() => {
                    outcome.stop = LoopStop::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!(session_id = %session_id, round, error = %e, "Gap analysis failed, keeping facts gathered so far");
                    outcome.stop = LoopStop::AnalysisFailed;
                    break;
                }
            };

            let fresh: Vec<Gap> = analysis
                .gaps
                .into_iter()
                .filter(|g| !history.contains(&g.normalized()))
                .collect();
            self.events.publish(Event::new(
                session_id.clone(),
                EventPayload::AnalysisComplete {
                    round,
                    facts: outcome.facts.len(),
                    gaps: fresh.len(),
                    contradictions: analysis.contradictions.len(),
                },
            ));

            if fresh.is_empty() {
                info!(session_id = %session_id, round, "No new gaps");
                outcome.stop = LoopStop::NoNewGaps;
                break;
            }
            if !previous.is_empty() {
                let similarity = gap_similarity(&previous, &fresh);
                if similarity >= self.config.gap_similarity_threshold {
                    info!(session_id = %session_id, round, similarity, "Gaps converged");
                    outcome.stop = LoopStop::Converged;
                    break;
                }
            }
            history.extend(fresh.iter().map(Gap::normalized));

            let workers: Vec<Worker> = fresh
                .iter()
                .cloned()
                .map(|gap| {
                    let worker = Worker::for_gap(next_sequence, round, gap);
                    next_sequence += 1;
                    worker
                })
                .collect();
            previous = fresh;
            outcome.rounds = round;
            info!(session_id = %session_id, round, workers = workers.len(), "Dispatching gap-fill workers");

            match self.scheduler.run(session_id, workers, cancel).await {
                Ok(report) => outcome.workers.extend(report.workers),
                Err(SchedulerError::AllFailed(report)) => {
                    warn!(session_id = %session_id, round, "Every gap-fill worker failed");
                    outcome.workers.extend(report.workers);
                }
                Err(SchedulerError::Cancelled(report)) => {
                    outcome.workers.extend(report.workers);
                    outcome.stop = LoopStop::Cancelled;
                    break;
                }
                Err(SchedulerError::InvalidGraph(e)) => {
                    warn!(session_id = %session_id, round, error = %e, "Gap-fill round rejected");
                    outcome.stop = LoopStop::AnalysisFailed;
                    break;
                }
            }
        }
        outcome
    }

    async fn analyze(
        &self,
        session_id: &SessionId,
        plan: &Plan,
        existing: &[Worker],
        round: u32,
        outcome: &mut GapFillOutcome,
        cancel: &CancellationToken,
    ) -> QuarryResult<GapAnalysis> {
        let all: Vec<Worker> = existing
            .iter()
            .chain(outcome.workers.iter())
            .cloned()
            .collect();
        let extracted = self.analyzer.extract_facts(&plan.query, &all, cancel).await?;
        outcome.overhead += extracted.cost;
        outcome.facts = extracted.facts;

        let analysis = match self
            .analyzer
            .find_gaps(&plan.query, &plan.perspectives, &outcome.facts, cancel)
            .await
        {
            Ok(analysis) => analysis,
            Err(failure) => {
                outcome.overhead += failure.spent;
                return Err(failure.error);
            }
        };
        outcome.overhead += analysis.cost;
        for c in &analysis.contradictions {
            let seen = outcome
                .contradictions
                .iter()
                .any(|k| k.claim_a == c.claim_a && k.claim_b == c.claim_b);
            if !seen {
                outcome.contradictions.push(c.clone());
            }
        }
        debug!(
            session_id = %session_id,
            round,
            facts = outcome.facts.len(),
            gaps = analysis.gaps.len(),
            contradictions = analysis.contradictions.len(),
            "Gap analysis finished"
        );
        Ok(analysis)
    }
}

use crate::config::OrchestratorConfig;
use crate::dag::WorkerGraph;
use quarry_agent::LlmBackend;
use quarry_core::{CostBreakdown, Message, Mode, Perspective, QuarryError, QuarryResult, Worker};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Name of the single perspective used in fast mode.
pub const GENERAL_PERSPECTIVE: &str = "General Research";

const CONJUNCTIONS: &[&str] = &[
    "and", "or", "versus", "vs", "between", "while", "whereas", "compare", "compared",
    "comparison", "tradeoffs", "trade-offs", "impact", "implications",
];

const COMPARATIVES: &[&str] = &[
    "better", "worse", "faster", "slower", "more", "less", "than", "best", "worst",
];

/// The research plan: perspectives and the root workers that cover them.
#[derive(Debug, Clone)]
pub struct Plan {
    pub query: String,
    pub mode: Mode,
    /// 0 to 1.
    pub complexity: f64,
    pub perspectives: Vec<Perspective>,
    /// One root worker per perspective, sequence numbers 1..n.
    pub workers: Vec<Worker>,
}

impl Plan {
    /// Validates that `workers` form an acyclic graph with known dependencies.
    pub fn new(
        query: impl Into<String>,
        mode: Mode,
        complexity: f64,
        perspectives: Vec<Perspective>,
        workers: Vec<Worker>,
    ) -> QuarryResult<Self> {
        WorkerGraph::new(workers.clone())?;
        Ok(Self {
            query: query.into(),
            mode,
            complexity,
            perspectives,
            workers,
        })
    }

    /// Gap-filling rounds allowed for this plan.
    pub fn gap_budget(&self, max_iterations: u32) -> u32 {
        gap_budget(self.mode, self.complexity, max_iterations)
    }
}

/// A plan together with the cost of producing it.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub cost: CostBreakdown,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    complexity: Option<f64>,
    #[serde(default)]
    perspectives: Vec<RawPerspective>,
}

#[derive(Debug, Deserialize)]
struct RawPerspective {
    #[serde(default)]
    name: String,
    #[serde(default)]
    focus: String,
    #[serde(default)]
    questions: Vec<String>,
}

/// Turns a query into a [`Plan`].
pub struct Planner {
    llm: Arc<dyn LlmBackend>,
    config: OrchestratorConfig,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmBackend>, config: OrchestratorConfig) -> Self {
        Self { llm, config }
    }

    /// Plans a research run.
    ///
    /// Fast mode makes no LLM call. Deep mode asks the model for a complexity
    /// score and a set of perspectives, then bounds the fan-out by complexity.
    pub async fn plan(
        &self,
        query: &str,
        mode: Mode,
        cancel: &CancellationToken,
    ) -> QuarryResult<PlanOutcome> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QuarryError::Planning("query is empty".into()));
        }

        match mode {
            Mode::Fast => {
                let perspective =
                    Perspective::new(GENERAL_PERSPECTIVE, query, vec![query.to_string()]);
                let workers = vec![Worker::for_perspective(1, &perspective)];
                let plan = Plan::new(
                    query,
                    mode,
                    heuristic_complexity(query),
                    vec![perspective],
                    workers,
                )?;
                debug!(complexity = plan.complexity, "Fast plan created");
                Ok(PlanOutcome {
                    plan,
                    cost: CostBreakdown::default(),
                })
            }
            Mode::Deep => self.plan_deep(query, cancel).await,
        }
    }

    async fn plan_deep(&self, query: &str, cancel: &CancellationToken) -> QuarryResult<PlanOutcome> {
        let messages = vec![
            Message::system(
                "You are a research planner. You break research questions into distinct \
                 expert perspectives. Respond with JSON only.",
            ),
            Message::user(planning_prompt(query, self.config.max_perspectives)),
        ];

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QuarryError::cancelled("cancelled during planning")),
            r = self.llm.chat(&messages) => {
                r.map_err(|e| QuarryError::Planning(format!("planner LLM call failed: {e}")))?
            }
        };
        let cost = completion.cost(self.llm.model_id(), &messages);

        let raw = parse_plan(&completion.content)?;
        let complexity = match raw.complexity {
            Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
            _ => heuristic_complexity(query),
        };

        let mut perspectives = normalize_perspectives(raw.perspectives, query);
        if perspectives.is_empty() {
            return Err(QuarryError::Planning(
                "planner returned no usable perspectives".into(),
            ));
        }
        let keep = perspectives_for_complexity(complexity, self.config.max_perspectives)
            .min(self.config.max_perspectives)
            .max(1);
        perspectives.truncate(keep);

        let workers = perspectives
            .iter()
            .zip(1u32..)
            .map(|(p, seq)| Worker::for_perspective(seq, p))
            .collect();
        let plan = Plan::new(query, Mode::Deep, complexity, perspectives, workers)?;

        info!(
            complexity = plan.complexity,
            perspectives = plan.perspectives.len(),
            "Deep plan created"
        );
        Ok(PlanOutcome { plan, cost })
    }
}

fn planning_prompt(query: &str, max_perspectives: usize) -> String {
    format!(
        "Research question: \"{query}\"\n\n\
         1. Rate the complexity of this question from 0.0 (a single fact) to 1.0 \
         (a multi-faceted comparison needing many sources).\n\
         2. Identify up to {max_perspectives} distinct expert perspectives that together \
         give comprehensive coverage. For each give a name, the focus it prioritizes and \
         2-4 questions it would ask.\n\n\
         Return a JSON object:\n\
         {{\"complexity\": 0.5, \"perspectives\": [{{\"name\": \"...\", \"focus\": \"...\", \
         \"questions\": [\"...\"]}}]}}"
    )
}

/// Parses the JSON object between the first `{` and the last `}`.
fn parse_plan(content: &str) -> QuarryResult<RawPlan> {
    let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) else {
        return Err(QuarryError::Planning(
            "no JSON object in planner response".into(),
        ));
    };
    if end < start {
        return Err(QuarryError::Planning(
            "no JSON object in planner response".into(),
        ));
    }
    serde_json::from_str(&content[start..=end])
        .map_err(|e| QuarryError::Planning(format!("invalid planner response: {e}")))
}

fn normalize_perspectives(raw: Vec<RawPerspective>, query: &str) -> Vec<Perspective> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|p| {
            let name = p.name.trim().to_string();
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                return None;
            }
            let focus = match p.focus.trim() {
                "" => query.to_string(),
                f => f.to_string(),
            };
            let questions: Vec<String> = p
                .questions
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
            let questions = if questions.is_empty() {
                vec![focus.clone()]
            } else {
                questions
            };
            Some(Perspective::new(name, focus, questions))
        })
        .collect()
}

/// Estimates complexity from the shape of the query: its length, how many
/// things it connects or compares, and how many questions it asks.
pub fn heuristic_complexity(query: &str) -> f64 {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-')
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();

    let length = (words.len() as f64 / 40.0).min(0.4);
    let conjunctions = words
        .iter()
        .filter(|w| CONJUNCTIONS.contains(&w.as_str()))
        .count()
        .min(3) as f64
        * 0.1;
    let comparatives = if words.iter().any(|w| COMPARATIVES.contains(&w.as_str())) {
        0.1
    } else {
        0.0
    };
    let questions = if query.matches('?').count() > 1 { 0.2 } else { 0.0 };

    (0.1 + length + conjunctions + comparatives + questions).clamp(0.0, 1.0)
}

/// Number of perspectives warranted by a complexity score.
pub fn perspectives_for_complexity(complexity: f64, max_perspectives: usize) -> usize {
    if complexity < 0.3 {
        1
    } else if complexity < 0.6 {
        3
    } else {
        max_perspectives
    }
}

/// Gap-filling rounds: none in fast mode, otherwise `ceil(c * max)` kept
/// within `1..=max`.
pub fn gap_budget(mode: Mode, complexity: f64, max_iterations: u32) -> u32 {
    if mode == Mode::Fast || max_iterations == 0 {
        return 0;
    }
    let rounds = (complexity.clamp(0.0, 1.0) * f64::from(max_iterations)).ceil() as u32;
    rounds.clamp(1, max_iterations)
}

//! In-memory doubles for the LLM, tool and worker-agent ports.
//!
//! They let the orchestrator run end to end without network access and are
//! used by the test suites of every crate above this one.

use crate::agent::{AgentFailure, AgentOutput, AgentResult, WorkerAgent, WorkerAssignment};
use crate::backends::{LlmBackend, LlmCompletion};
use crate::stream::StreamEvent;
use crate::tools::ToolExecutor;
use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_core::{CostBreakdown, Message, QuarryError, QuarryResult, Source, TokenUsage, WorkerId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct LlmRule {
    pattern: String,
    responses: Vec<Result<String, String>>,
    hits: usize,
}

/// An [`LlmBackend`] that answers from a script.
///
/// Rules are checked in insertion order against the whole prompt; the first
/// rule whose pattern occurs anywhere in it answers. A rule with several
/// responses returns them in turn and then keeps repeating the last one.
pub struct ScriptedLlm {
    model_id: String,
    rules: Mutex<Vec<LlmRule>>,
    fallback: Option<String>,
    usage: TokenUsage,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            model_id: "openai/gpt-4o-mini".into(),
            rules: Mutex::new(Vec::new()),
            fallback: None,
            usage: TokenUsage::default(),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn push_rule(self, pattern: &str, responses: Vec<Result<String, String>>) -> Self {
        self.rules.lock().push(LlmRule {
            pattern: pattern.to_string(),
            responses,
            hits: 0,
        });
        self
    }

    pub fn on(self, pattern: &str, response: &str) -> Self {
        self.push_rule(pattern, vec![Ok(response.to_string())])
    }

    pub fn on_sequence(self, pattern: &str, responses: &[&str]) -> Self {
        let responses = responses.iter().map(|r| Ok(r.to_string())).collect();
        self.push_rule(pattern, responses)
    }

    /// Prompts containing `pattern` fail with `QuarryError::Llm(message)`.
    pub fn fail_on(self, pattern: &str, message: &str) -> Self {
        self.push_rule(pattern, vec![Err(message.to_string())])
    }

    /// Response for prompts no rule matches. Without one they fail.
    pub fn with_fallback(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    /// Usage reported with every completion.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_model(mut self, model_id: &str) -> Self {
        self.model_id = model_id.to_string();
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Every prompt seen so far, flattened to text.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn respond(&self, messages: &[Message]) -> QuarryResult<LlmCompletion> {
        let text = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().push(text.clone());

        let mut rules = self.rules.lock();
        let chosen = rules
            .iter_mut()
            .find(|r| text.contains(&r.pattern))
            .and_then(|rule| {
                let idx = rule.hits.min(rule.responses.len().saturating_sub(1));
                rule.hits += 1;
                rule.responses.get(idx).cloned()
            });

        let response = match (chosen, &self.fallback) {
            (Some(r), _) => r,
            (None, Some(fallback)) => Ok(fallback.clone()),
            (None, None) => Err("no scripted response".to_string()),
        };
        response
            .map(|content| LlmCompletion::new(content, self.usage))
            .map_err(QuarryError::Llm)
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(&self, messages: &[Message]) -> QuarryResult<LlmCompletion> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.respond(messages)
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
    ) -> QuarryResult<(
        mpsc::Receiver<StreamEvent>,
        JoinHandle<QuarryResult<LlmCompletion>>,
    )> {
        let completion = self.chat(messages).await?;
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            for word in completion.content.split_inclusive(' ') {
                let _ = tx
                    .send(StreamEvent::TextDelta {
                        text: word.to_string(),
                    })
                    .await;
            }
            let _ = tx.send(StreamEvent::Done).await;
            Ok(completion)
        });
        Ok((rx, handle))
    }
}

struct ToolRule {
    tool: String,
    args_contain: Option<String>,
    result: Result<String, String>,
}

/// A [`ToolExecutor`] with canned results, optionally keyed on a substring of
/// the serialized arguments. First matching rule wins.
#[derive(Default)]
pub struct StaticTools {
    rules: Vec<ToolRule>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl StaticTools {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(mut self, tool: &str, args_contain: Option<&str>, result: Result<String, String>) -> Self {
        self.rules.push(ToolRule {
            tool: tool.to_string(),
            args_contain: args_contain.map(str::to_string),
            result,
        });
        self
    }

    pub fn with_output(self, tool: &str, output: &str) -> Self {
        self.rule(tool, None, Ok(output.to_string()))
    }

    pub fn with_output_for(self, tool: &str, args_contain: &str, output: &str) -> Self {
        self.rule(tool, Some(args_contain), Ok(output.to_string()))
    }

    pub fn with_error(self, tool: &str, message: &str) -> Self {
        self.rule(tool, None, Err(message.to_string()))
    }

    pub fn with_error_for(self, tool: &str, args_contain: &str, message: &str) -> Self {
        self.rule(tool, Some(args_contain), Err(message.to_string()))
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ToolExecutor for StaticTools {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> QuarryResult<String> {
        self.calls.lock().push((name.to_string(), args.clone()));
        let serialized = args.to_string();
        let rule = self.rules.iter().find(|r| {
            r.tool == name
                && r.args_contain
                    .as_deref()
                    .map_or(true, |needle| serialized.contains(needle))
        });
        match rule {
            Some(rule) => rule.result.clone().map_err(QuarryError::Tool),
            None => Err(QuarryError::Tool(format!("Unknown tool: {name}"))),
        }
    }

    fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.iter().map(|r| r.tool.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// What a [`ScriptedAgent`] does for a matching objective.
#[derive(Debug, Clone, Default)]
pub struct AgentScript {
    pub output: String,
    pub sources: Vec<Source>,
    pub cost: CostBreakdown,
    pub delay: Duration,
    pub error: Option<String>,
}

impl AgentScript {
    pub fn answer(output: &str) -> Self {
        Self {
            output: output.to_string(),
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_cost(mut self, cost: CostBreakdown) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Timing of one [`ScriptedAgent`] invocation.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub worker_id: WorkerId,
    pub objective: String,
    pub started_at: Instant,
    pub finished_at: Instant,
}

/// A [`WorkerAgent`] that plays back [`AgentScript`]s keyed on a substring of
/// the objective, and records concurrency and timing for assertions.
pub struct ScriptedAgent {
    rules: Vec<(String, AgentScript)>,
    fallback: AgentScript,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    runs: Mutex<Vec<AgentRun>>,
}

impl ScriptedAgent {
    pub fn new(fallback: AgentScript) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, objective_contains: &str, script: AgentScript) -> Self {
        self.rules.push((objective_contains.to_string(), script));
        self
    }

    /// Highest number of simultaneous `execute` calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Finished or cancelled runs in completion order.
    pub fn runs(&self) -> Vec<AgentRun> {
        self.runs.lock().clone()
    }

    pub fn invocations(&self) -> usize {
        self.runs.lock().len()
    }

    fn script_for(&self, objective: &str) -> &AgentScript {
        self.rules
            .iter()
            .find(|(needle, _)| objective.contains(needle.as_str()))
            .map(|(_, script)| script)
            .unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl WorkerAgent for ScriptedAgent {
    async fn execute(&self, assignment: &WorkerAssignment, cancel: CancellationToken) -> AgentResult {
        let script = self.script_for(&assignment.objective).clone();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let started_at = Instant::now();

        let cancelled = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(script.delay) => false,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.runs.lock().push(AgentRun {
            worker_id: assignment.worker_id,
            objective: assignment.objective.clone(),
            started_at,
            finished_at: Instant::now(),
        });

        let output = AgentOutput {
            output: script.output,
            sources: script.sources,
            cost: script.cost,
            ..AgentOutput::default()
        };
        if cancelled {
            return Err(AgentFailure::new(
                QuarryError::cancelled("worker cancelled"),
                output,
            ));
        }
        match script.error {
            Some(message) => Err(AgentFailure::new(QuarryError::Worker(message), output)),
            None => Ok(output),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_llm_first_match_and_sequence() {
        let llm = ScriptedLlm::new()
            .on_sequence("plan", &["first", "second"])
            .on("p", "generic");
        let plan = [Message::user("make a plan")];
        assert_eq!(llm.chat(&plan).await.unwrap().content, "first");
        assert_eq!(llm.chat(&plan).await.unwrap().content, "second");
        assert_eq!(llm.chat(&plan).await.unwrap().content, "second");
        assert_eq!(llm.chat(&[Message::user("pick")]).await.unwrap().content, "generic");
        assert!(llm.chat(&[Message::user("zzz")]).await.is_err());
        assert_eq!(llm.call_count(), 5);
    }

    #[tokio::test]
    async fn test_static_tools_argument_matching() {
        let tools = StaticTools::new()
            .with_error_for("search", "broken", "boom")
            .with_output("search", "ok");
        assert!(tools
            .execute("search", &serde_json::json!({"query": "broken thing"}))
            .await
            .is_err());
        assert_eq!(
            tools
                .execute("search", &serde_json::json!({"query": "fine"}))
                .await
                .unwrap(),
            "ok"
        );
        assert_eq!(tools.tool_names(), vec!["search"]);
        assert_eq!(tools.calls().len(), 2);
    }
}

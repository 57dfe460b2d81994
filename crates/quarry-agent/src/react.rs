use crate::agent::{AgentFailure, AgentOutput, AgentResult, WorkerAgent, WorkerAssignment};
use crate::backends::{LlmBackend, LlmCompletion};
use crate::config::AgentConfig;
use crate::context::ContextWindow;
use crate::stream::StreamEvent;
use crate::tools::{extract_sources, ToolExecutor};
use async_trait::async_trait;
use chrono::Utc;
use quarry_core::events::{preview, PREVIEW_LEN};
use quarry_core::{
    merge_sources, Event, EventPayload, EventPublisher, Message, QuarryError, QuarryResult,
    ReactStep, Source, ToolCallRecord, WorkerStatus, WorkerUpdate,
};
use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_ITERATIONS_OUTPUT: &str = "Research concluded after maximum iterations.";
const BUDGET_NUDGE: &str = "Token budget nearly exhausted. Please provide your final answer \
                            now using <answer></answer> tags.";
const CONTEXT_MESSAGES: usize = 100;

/// A tool invocation parsed from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool: String,
    pub arguments: serde_json::Value,
}

/// Compiled patterns for the ReAct text protocol.
struct Protocol {
    tool: Regex,
    answer: Regex,
}

impl Protocol {
    fn new() -> QuarryResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| QuarryError::Config(format!("regex: {e}")))
        };
        Ok(Self {
            tool: compile(r#"(?s)<tool\s+name="([^"]+)">\s*(\{.*?\})\s*</tool>"#)?,
            answer: compile(r"(?s)<answer>(.*?)</answer>")?,
        })
    }

    fn tool_calls(&self, content: &str) -> Vec<ParsedToolCall> {
        self.tool
            .captures_iter(content)
            .filter_map(|cap| {
                let tool = cap.get(1)?.as_str().to_string();
                let raw = cap.get(2)?.as_str();
                match serde_json::from_str::<serde_json::Value>(raw) {
                    Ok(arguments) if arguments.is_object() => {
                        Some(ParsedToolCall { tool, arguments })
                    }
                    _ => {
                        debug!(tool = %tool, "Skipping tool call with malformed arguments");
                        None
                    }
                }
            })
            .collect()
    }

    fn answer(&self, content: &str) -> Option<String> {
        self.answer
            .captures(content)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string())
    }
}

/// The ReAct worker: reason, call tools, observe, repeat until an
/// `<answer>` is produced or the iteration budget runs out.
pub struct ReactAgent {
    llm: Arc<dyn LlmBackend>,
    tools: Arc<dyn ToolExecutor>,
    events: Arc<dyn EventPublisher>,
    config: AgentConfig,
    protocol: Protocol,
}

impl ReactAgent {
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        tools: Arc<dyn ToolExecutor>,
        events: Arc<dyn EventPublisher>,
        config: AgentConfig,
    ) -> QuarryResult<Self> {
        Ok(Self {
            llm,
            tools,
            events,
            config,
            protocol: Protocol::new()?,
        })
    }

    /// Parses every well-formed `<tool name="...">{...}</tool>` block.
    pub fn parse_tool_calls(&self, content: &str) -> Vec<ParsedToolCall> {
        self.protocol.tool_calls(content)
    }

    fn system_prompt(&self) -> String {
        let descriptors = self.tools.descriptors();
        let tool_lines: Vec<String> = if descriptors.is_empty() {
            self.tools
                .tool_names()
                .into_iter()
                .map(|name| format!("- {name}: Usage: <tool name=\"{name}\">{{...}}</tool>"))
                .collect()
        } else {
            descriptors
                .iter()
                .map(|d| format!("- {}: {} Usage: {}", d.name, d.description, d.usage))
                .collect()
        };

        format!(
            "You are a research assistant. Your goal is to thoroughly research the given \
             topic using the available tools.\n\n\
             Available tools:\n{}\n\n\
             Process:\n\
             1. Think about what information you need\n\
             2. Use tools to gather information\n\
             3. Analyze the results and continue researching if needed\n\
             4. When you have enough information, provide your final answer\n\n\
             When you have a complete answer, wrap it in <answer></answer> tags.\n\
             Be thorough but efficient. Always cite your sources by URL.",
            tool_lines.join("\n")
        )
    }

    fn task_prompt(assignment: &WorkerAssignment) -> String {
        let mut prompt = format!("Research this topic: {}", assignment.objective);
        if let Some(perspective) = &assignment.perspective {
            prompt.push_str(&format!("\nPerspective: {perspective}"));
        }
        if !assignment.questions.is_empty() {
            prompt.push_str("\n\nQuestions to answer:");
            for q in &assignment.questions {
                prompt.push_str(&format!("\n- {q}"));
            }
        }
        prompt
    }

    fn publish(&self, assignment: &WorkerAssignment, payload: EventPayload) {
        self.events
            .publish(Event::new(assignment.session_id.clone(), payload));
    }

    /// One model turn, streamed or not, abandoned as soon as `cancel` fires.
    async fn complete(
        &self,
        prompt: &[Message],
        assignment: &WorkerAssignment,
        cancel: &CancellationToken,
    ) -> QuarryResult<LlmCompletion> {
        let call = async {
            if !self.config.stream {
                return self.llm.chat(prompt).await;
            }
            let (mut rx, handle) = self.llm.chat_stream(prompt).await?;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::TextDelta { text } => self.publish(
                        assignment,
                        EventPayload::WorkerProgress(WorkerUpdate {
                            worker_id: assignment.worker_id,
                            sequence: assignment.sequence,
                            objective: assignment.objective.clone(),
                            status: WorkerStatus::Running,
                            message: Some(text),
                        }),
                    ),
                    StreamEvent::Error { message } => {
                        warn!(worker_id = %assignment.worker_id, error = %message, "Stream error")
                    }
                    StreamEvent::Done => {}
                }
            }
            handle
                .await
                .map_err(|e| QuarryError::Llm(format!("stream task failed: {e}")))?
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QuarryError::cancelled("worker cancelled")),
            result = call => result,
        }
    }

    async fn run_tool(
        &self,
        call: &ParsedToolCall,
        cancel: &CancellationToken,
    ) -> QuarryResult<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QuarryError::cancelled("worker cancelled")),
            result = self.tools.execute(&call.tool, &call.arguments) => result,
        }
    }

    fn collect_sources(call: &ParsedToolCall, result: &str) -> Vec<Source> {
        match call.tool.as_str() {
            "search" => extract_sources(result),
            "fetch" => call.arguments["url"]
                .as_str()
                .filter(|u| !u.trim().is_empty())
                .map(|u| vec![Source::new(u.trim(), u.trim())])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn run(
        &self,
        assignment: &WorkerAssignment,
        cancel: &CancellationToken,
        out: &mut AgentOutput,
    ) -> QuarryResult<()> {
        let mut ctx = ContextWindow::new(CONTEXT_MESSAGES);
        ctx.set_system_prompt(self.system_prompt());
        ctx.push(Message::user(Self::task_prompt(assignment)));

        let model_id = self.llm.model_id().to_string();
        let mut tokens_used: u64 = 0;
        let mut last_content = String::new();

        info!(
            session_id = %assignment.session_id,
            worker_id = %assignment.worker_id,
            objective = %assignment.objective,
            "Starting ReAct loop"
        );

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(QuarryError::cancelled("worker cancelled"));
            }

            let prompt = ctx.to_prompt();
            let completion = self
                .complete(&prompt, assignment, cancel)
                .await
                .map_err(|e| match e {
                    QuarryError::Cancelled { .. } => e,
                    other => QuarryError::Worker(format!("LLM call failed: {other}")),
                })?;

            let cost = completion.cost(&model_id, &prompt);
            tokens_used = tokens_used.saturating_add(cost.total_tokens);
            out.cost += cost;

            let content = completion.content;
            if content.trim().is_empty() {
                return Err(QuarryError::Worker("empty response from LLM".into()));
            }

            let calls = self.protocol.tool_calls(&content);
            out.steps.push(ReactStep {
                iteration,
                content: content.clone(),
                tool_calls: calls.len(),
            });

            if let Some(answer) = self.protocol.answer(&content) {
                check_tool_failures(&out.tool_calls)?;
                info!(
                    worker_id = %assignment.worker_id,
                    iterations = iteration,
                    sources = out.sources.len(),
                    "Worker produced an answer"
                );
                out.output = answer;
                return Ok(());
            }

            ctx.push(Message::assistant(content.clone()));

            for call in &calls {
                self.publish(
                    assignment,
                    EventPayload::AgentToolCall {
                        worker_id: assignment.worker_id,
                        tool: call.tool.clone(),
                        arguments: call.arguments.clone(),
                    },
                );

                let (result, is_error) = match self.run_tool(call, cancel).await {
                    Ok(result) => (result, false),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        warn!(
                            worker_id = %assignment.worker_id,
                            tool = %call.tool,
                            error = %e,
                            "Tool call failed"
                        );
                        (format!("Error: {e}"), true)
                    }
                };

                let result_preview = preview(&result, PREVIEW_LEN);
                self.publish(
                    assignment,
                    EventPayload::AgentToolResult {
                        worker_id: assignment.worker_id,
                        tool: call.tool.clone(),
                        preview: result_preview.clone(),
                        is_error,
                    },
                );
                out.tool_calls.push(ToolCallRecord {
                    tool: call.tool.clone(),
                    arguments: call.arguments.clone(),
                    preview: result_preview,
                    is_error,
                    at: Utc::now(),
                });

                if !is_error {
                    merge_sources(&mut out.sources, Self::collect_sources(call, &result));
                }
                ctx.push(Message::user(format!(
                    "Tool result for {}:\n{result}",
                    call.tool
                )));
            }

            last_content = content;

            if tokens_used.saturating_mul(10) > self.config.max_tokens.saturating_mul(9) {
                debug!(worker_id = %assignment.worker_id, tokens_used, "Token budget nudge");
                ctx.push(Message::system(BUDGET_NUDGE));
            }
        }

        check_tool_failures(&out.tool_calls)?;
        warn!(
            worker_id = %assignment.worker_id,
            max_iterations = self.config.max_iterations,
            "Worker hit the iteration limit"
        );
        out.output = if last_content.trim().is_empty() {
            MAX_ITERATIONS_OUTPUT.to_string()
        } else {
            format!("{MAX_ITERATIONS_OUTPUT}\n\n{}", last_content.trim())
        };
        Ok(())
    }
}

/// A worker whose every tool call failed has nothing to stand on.
fn check_tool_failures(calls: &[ToolCallRecord]) -> QuarryResult<()> {
    if !calls.is_empty() && calls.iter().all(|c| c.is_error) {
        return Err(QuarryError::Worker(format!(
            "all {} tool calls failed",
            calls.len()
        )));
    }
    Ok(())
}

#[async_trait]
impl WorkerAgent for ReactAgent {
    async fn execute(
        &self,
        assignment: &WorkerAssignment,
        cancel: CancellationToken,
    ) -> AgentResult {
        let mut out = AgentOutput::default();
        match self.run(assignment, &cancel, &mut out).await {
            Ok(()) => Ok(out),
            Err(error) => Err(AgentFailure::new(error, out)),
        }
    }
}

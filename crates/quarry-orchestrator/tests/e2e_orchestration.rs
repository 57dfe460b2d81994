//! End-to-end orchestration tests.
//!
//! Runs full research sessions against scripted LLMs, scripted or ReAct
//! worker agents, and in-memory stores. Checks the session lifecycle, cost
//! accounting, citations, cancellation and persistence behavior.

use quarry_agent::mock::{AgentScript, ScriptedAgent, ScriptedLlm, StaticTools};
use quarry_agent::{AgentConfig, ReactAgent};
use quarry_core::{
    CostBreakdown, CostScope, EventBus, EventPayload, EventSubscriber, EventType, Mode,
    Perspective, QuarryError, SessionId, SessionStatus, Source, Worker, WorkerStatus,
};
use quarry_orchestrator::*;
use quarry_session::{MemoryReportWriter, MemorySessionStore, SessionRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const THREE_PERSPECTIVES: &str = r#"{"complexity": 0.5, "perspectives": [
  {"name": "Technical", "focus": "internals", "questions": ["How does it work?"]},
  {"name": "Economic", "focus": "costs", "questions": ["What does it cost?"]},
  {"name": "Social", "focus": "adoption", "questions": ["Who uses it?"]}
]}"#;

/// Orchestration LLM that plans `plan`, finds nothing to follow up on and
/// writes short sections.
fn research_llm(plan: &str) -> ScriptedLlm {
    ScriptedLlm::new()
        .on("Research question", plan)
        .on("Extract the key factual claims", "not json")
        .on("Identify any contradictions", "[]")
        .on("Identify knowledge gaps", "[]")
        .on("Write an executive summary", "Overall findings [1].")
        .on("Write the section", "Section prose citing [1].")
}

fn cost(input: u64, output: u64) -> CostBreakdown {
    CostBreakdown::new("openai/gpt-4o-mini", input, output, 0)
}

struct Harness {
    orchestrator: Arc<ResearchOrchestrator>,
    store: Arc<MemorySessionStore>,
    writer: Arc<MemoryReportWriter>,
}

fn harness(
    llm: ScriptedLlm,
    agent: Arc<dyn quarry_agent::WorkerAgent>,
    store: MemorySessionStore,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
) -> Harness {
    let store = Arc::new(store);
    let writer = Arc::new(MemoryReportWriter::new());
    let orchestrator = ResearchOrchestrator::new(
        Arc::new(llm),
        agent,
        store.clone(),
        bus.clone(),
        config,
    )
    .unwrap()
    .with_report_writer(writer.clone());
    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        writer,
    }
}

async fn wait_for_report(writer: &MemoryReportWriter) -> Vec<(SessionId, String)> {
    for _ in 0..100 {
        let written = writer.written();
        if !written.is_empty() {
            return written;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    writer.written()
}

fn assert_cost_invariant(session: &quarry_core::Session) {
    let tokens: u64 = session.workers.iter().map(|w| w.cost.total_tokens).sum();
    assert_eq!(session.cost.total_tokens, tokens);
    let total: CostBreakdown = session.workers.iter().map(|w| w.cost).sum();
    assert_eq!(session.cost.total_cost, total.total_cost);
}

// ---------------------------------------------------------------------------
// Scenario A: fast mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fast_mode_single_worker() {
    let agent = Arc::new(ScriptedAgent::new(
        AgentScript::answer("Rust guarantees memory safety without a GC.")
            .with_sources(vec![
                Source::new("https://doc.rust-lang.org/book", "The Rust Book"),
                Source::new("https://rust-lang.org", "Rust"),
                Source::new("https://doc.rust-lang.org/book", "Duplicate"),
            ])
            .with_cost(cost(1200, 300)),
    ));
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe(&[]);
    let h = harness(
        research_llm("unused"),
        agent.clone(),
        MemorySessionStore::new(),
        bus,
        OrchestratorConfig::default(),
    );

    let result = h
        .orchestrator
        .research("What is Rust?", ResearchOptions::new(Mode::Fast))
        .await
        .unwrap();
    let session = &result.session;

    assert_eq!(session.status, SessionStatus::Complete);
    assert_eq!(session.workers.len(), 1);
    assert_eq!(agent.invocations(), 1);
    assert_eq!(result.perspectives.len(), 1);
    assert_eq!(result.perspectives[0].name, GENERAL_PERSPECTIVE);

    let urls: Vec<&str> = result.report.citations.iter().map(|c| c.url.as_str()).collect();
    assert_eq!(urls, ["https://doc.rust-lang.org/book", "https://rust-lang.org"]);
    assert_eq!(session.sources.len(), result.report.citations.len());
    assert_eq!(result.report.title, "Research: What is Rust?");
    assert_eq!(result.report.sections.len(), 1);
    assert_eq!(result.report.sections[0].citations, vec![1]);

    assert_cost_invariant(session);
    assert_eq!(session.cost.input_tokens, 1200);
    assert!(!session.overhead_cost.is_zero());
    assert_eq!(
        session.total_cost().total_tokens,
        session.cost.total_tokens + session.overhead_cost.total_tokens
    );

    assert_eq!(h.store.save_count(), 1);
    let saved = h.store.load(&session.id).await.unwrap();
    assert_eq!(&saved, session);
    assert!(h.orchestrator.active_sessions().is_empty());

    let written = wait_for_report(&h.writer).await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, session.id);
    assert!(written[0].1.contains("# Research: What is Rust?"));

    let mut types = Vec::new();
    while let Some(event) = events.try_recv() {
        assert_eq!(event.session_id, session.id);
        types.push(event.event_type());
    }
    assert_eq!(types.first(), Some(&EventType::ResearchStarted));
    assert_eq!(types.get(1), Some(&EventType::PlanCreated));
    assert_eq!(types.last(), Some(&EventType::ResearchComplete));
    assert!(!types.contains(&EventType::AnalysisComplete));
    assert!(types.contains(&EventType::SynthesisStarted));
}

// ---------------------------------------------------------------------------
// Scenario B: deep mode, one worker's tools all fail
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_deep_mode_isolates_failed_worker() {
    let agent_llm = ScriptedLlm::new()
        .on("Tool result for search", "<answer>Findings with evidence.</answer>")
        .on(
            "Perspective: Economic",
            r#"<tool name="search">{"query": "economic costs"}</tool>"#,
        )
        .on(
            "Research this topic",
            r#"<tool name="search">{"query": "general background"}</tool>"#,
        );
    let tools = StaticTools::new()
        .with_error_for("search", "economic", "upstream returned 500")
        .with_output(
            "search",
            "1. The Rust Book\n   URL: https://doc.rust-lang.org/book\n   Ownership explained\n",
        );
    let bus = Arc::new(EventBus::default());
    let mut tool_results = bus.subscribe(&[EventType::AgentToolResult]);
    let agent = Arc::new(
        ReactAgent::new(
            Arc::new(agent_llm),
            Arc::new(tools),
            bus.clone(),
            AgentConfig::default(),
        )
        .unwrap(),
    );
    let h = harness(
        research_llm(THREE_PERSPECTIVES),
        agent,
        MemorySessionStore::new(),
        bus,
        OrchestratorConfig::default(),
    );

    let result = h
        .orchestrator
        .research("Is Rust worth adopting?", ResearchOptions::new(Mode::Deep))
        .await
        .unwrap();
    let session = &result.session;

    assert_eq!(session.status, SessionStatus::Complete);
    assert_eq!(session.complexity_score, 0.5);
    assert_eq!(session.workers.len(), 3);
    let completed = session
        .workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Complete)
        .count();
    let failed: Vec<&Worker> = session
        .workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Failed)
        .collect();
    assert_eq!(completed, 2);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind.perspective(), Some("Economic"));
    assert!(failed[0].error.as_deref().unwrap().contains("tool calls failed"));
    assert!(failed[0].cost.total_tokens > 0);

    let headings: Vec<&str> = result.report.sections.iter().map(|s| s.heading.as_str()).collect();
    assert_eq!(headings, ["Technical", "Social"]);
    assert_eq!(result.report.citations.len(), 1);
    assert_cost_invariant(session);

    let mut errors = 0;
    while let Some(event) = tool_results.try_recv() {
        if let EventPayload::AgentToolResult { is_error: true, .. } = event.payload {
            errors += 1;
        }
    }
    assert_eq!(errors, 1);
}

// ---------------------------------------------------------------------------
// Scenario C: cancellation mid-run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_while_workers_running() {
    let agent = Arc::new(
        ScriptedAgent::new(
            AgentScript::answer("slow")
                .with_delay(Duration::from_secs(30))
                .with_cost(cost(50, 5)),
        )
        .on(
            "Technical",
            AgentScript::answer("Fast technical answer.").with_cost(cost(100, 10)),
        ),
    );
    let bus = Arc::new(EventBus::default());
    let mut completions = bus.subscribe(&[EventType::WorkerComplete]);
    let h = harness(
        research_llm(THREE_PERSPECTIVES),
        agent,
        MemorySessionStore::new(),
        bus,
        OrchestratorConfig::default(),
    );

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .research("Is Rust worth adopting?", ResearchOptions::new(Mode::Deep))
            .await
    });

    let first = tokio::time::timeout(Duration::from_secs(5), completions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.orchestrator.active_sessions(), vec![first.session_id.clone()]);
    h.orchestrator.cancel(&first.session_id).unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(&err, QuarryError::Cancelled { reason } if reason == "cancelled by user"));

    let saved = h.store.load(&first.session_id).await.unwrap();
    assert_eq!(saved.status, SessionStatus::Cancelled);
    let statuses: Vec<WorkerStatus> = saved.workers.iter().map(|w| w.status).collect();
    assert_eq!(
        statuses,
        [
            WorkerStatus::Complete,
            WorkerStatus::Cancelled,
            WorkerStatus::Cancelled
        ]
    );
    assert_eq!(saved.workers[0].output, "Fast technical answer.");
    assert!(saved.report.is_none());
    assert_cost_invariant(&saved);
    assert_eq!(saved.cost.input_tokens, 200);

    assert!(matches!(
        h.orchestrator.cancel(&first.session_id),
        Err(QuarryError::NotFound(_))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.writer.written().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario D: failed dependency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_dependency_skips_subtree_without_invoking_agent() {
    let agent = Arc::new(
        ScriptedAgent::new(AgentScript::answer("ok"))
            .on("Survey", AgentScript::failing("search quota exhausted")),
    );
    let bus = Arc::new(EventBus::default());
    let mut skipped = bus.subscribe(&[EventType::WorkerSkipped]);
    let scheduler = Scheduler::new(
        agent.clone(),
        bus,
        Arc::new(CostAccumulator::new()),
        2,
    );

    let survey = Worker::for_perspective(1, &Perspective::new("Survey", "landscape", vec![]));
    let deep_dive = Worker::for_perspective(2, &Perspective::new("Deep dive", "detail", vec![]))
        .with_dependencies(vec![survey.id]);
    let summary = Worker::for_perspective(3, &Perspective::new("Digest", "wrap-up", vec![]))
        .with_dependencies(vec![deep_dive.id]);
    let independent = Worker::for_perspective(4, &Perspective::new("History", "origins", vec![]));
    let skipped_ids = [deep_dive.id, summary.id];

    let report = scheduler
        .run(
            &SessionId::generate(),
            vec![survey, deep_dive, summary, independent],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(agent.invocations(), 2);
    assert!(agent
        .runs()
        .iter()
        .all(|run| !skipped_ids.contains(&run.worker_id)));
    let results = report.results();
    for id in skipped_ids {
        assert_eq!(results[&id].status, WorkerStatus::Skipped);
        assert!(results[&id].cost.is_zero());
    }
    assert_eq!(report.completed().len(), 1);
    assert_eq!(report.failed().len(), 1);

    let mut count = 0;
    while skipped.try_recv().is_some() {
        count += 1;
    }
    assert_eq!(count, 2);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrency_bound_across_a_deep_run() {
    let plan = r#"{"complexity": 0.9, "perspectives": [
        {"name": "A"}, {"name": "B"}, {"name": "C"}, {"name": "D"}, {"name": "E"}]}"#;
    let agent = Arc::new(ScriptedAgent::new(
        AgentScript::answer("finding")
            .with_delay(Duration::from_millis(25))
            .with_cost(cost(10, 1)),
    ));
    let h = harness(
        research_llm(plan),
        agent.clone(),
        MemorySessionStore::new(),
        Arc::new(EventBus::default()),
        OrchestratorConfig::default(),
    );

    let result = h
        .orchestrator
        .research("broad topic", ResearchOptions::new(Mode::Deep).with_max_workers(2))
        .await
        .unwrap();

    assert_eq!(result.session.workers.len(), 5);
    assert_eq!(agent.peak_concurrency(), 2);
    assert_eq!(result.session.cost.input_tokens, 50);
    assert_cost_invariant(&result.session);
}

#[tokio::test]
async fn test_gap_round_adds_workers_and_stays_within_budget() {
    let llm = ScriptedLlm::new()
        .on("Research question", THREE_PERSPECTIVES)
        .on("Extract the key factual claims", "not json")
        .on("Identify any contradictions", "[]")
        .on_sequence(
            "Identify knowledge gaps",
            &[
                r#"[{"description": "Licensing of the standard library", "importance": 0.9, "perspective": "Economic"}]"#,
                r#"[{"description": "Embedded toolchain maturity", "importance": 0.8}]"#,
                r#"[{"description": "Compile time regressions", "importance": 0.8}]"#,
            ],
        )
        .on("Write an executive summary", "Summary.")
        .on("Write the section", "Prose.");
    let agent = Arc::new(ScriptedAgent::new(
        AgentScript::answer("finding").with_cost(cost(10, 1)),
    ));
    let bus = Arc::new(EventBus::default());
    let mut analysis = bus.subscribe(&[EventType::AnalysisComplete]);
    let h = harness(
        llm,
        agent,
        MemorySessionStore::new(),
        bus,
        OrchestratorConfig::default(),
    );

    let result = h
        .orchestrator
        .research("Is Rust worth adopting?", ResearchOptions::new(Mode::Deep))
        .await
        .unwrap();
    let session = &result.session;

    // complexity 0.5 with three allowed rounds gives a budget of two
    let gap_workers: Vec<&Worker> = session.workers.iter().filter(|w| w.kind.is_gap_fill()).collect();
    assert_eq!(gap_workers.len(), 2);
    assert_eq!(gap_workers[0].sequence, 4);
    assert_eq!(gap_workers[1].sequence, 5);
    assert_eq!(gap_workers[0].kind.perspective(), Some("Economic"));

    let headings: Vec<&str> = result.report.sections.iter().map(|s| s.heading.as_str()).collect();
    assert_eq!(
        headings,
        ["Technical", "Economic", "Social", ADDITIONAL_FINDINGS]
    );

    let mut rounds = 0;
    while analysis.try_recv().is_some() {
        rounds += 1;
    }
    assert_eq!(rounds, 2);
    assert_cost_invariant(session);
}

#[tokio::test]
async fn test_all_workers_failed_ends_in_synthesis_error() {
    let agent = Arc::new(ScriptedAgent::new(
        AgentScript::failing("no network").with_cost(cost(30, 0)),
    ));
    let h = harness(
        research_llm(THREE_PERSPECTIVES),
        agent,
        MemorySessionStore::new(),
        Arc::new(EventBus::default()),
        OrchestratorConfig::default(),
    );

    let err = h
        .orchestrator
        .research("doomed", ResearchOptions::new(Mode::Deep))
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::Synthesis(_)));

    let saved = h.store.load_latest().await.unwrap().unwrap();
    assert_eq!(saved.status, SessionStatus::Failed);
    assert_eq!(saved.workers.len(), 3);
    assert_eq!(saved.cost.input_tokens, 90);
    assert!(saved.error.is_some());
}

#[tokio::test]
async fn test_persistence_failure_still_returns_result() {
    let agent = Arc::new(ScriptedAgent::new(AgentScript::answer("answer")));
    let h = harness(
        research_llm("unused"),
        agent,
        MemorySessionStore::failing(),
        Arc::new(EventBus::default()),
        OrchestratorConfig::default(),
    );

    let result = h
        .orchestrator
        .research("anything", ResearchOptions::new(Mode::Fast))
        .await
        .unwrap();
    assert_eq!(result.session.status, SessionStatus::Complete);
    assert_eq!(h.store.save_count(), 1);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_total_cost_event_precedes_completion() {
    let agent = Arc::new(ScriptedAgent::new(
        AgentScript::answer("answer").with_cost(cost(10, 10)),
    ));
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe(&[EventType::CostUpdated, EventType::ResearchComplete]);
    let h = harness(
        research_llm("unused"),
        agent,
        MemorySessionStore::new(),
        bus,
        OrchestratorConfig::default(),
    );

    let result = h
        .orchestrator
        .research("anything", ResearchOptions::new(Mode::Fast))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.try_recv() {
        seen.push(event.payload);
    }
    let total_at = seen
        .iter()
        .position(|p| matches!(p, EventPayload::CostUpdated { scope: CostScope::Total, .. }))
        .unwrap();
    assert!(matches!(seen.last(), Some(EventPayload::ResearchComplete { .. })));
    assert_eq!(total_at, seen.len() - 2);
    match &seen[total_at] {
        EventPayload::CostUpdated { cost, .. } => assert_eq!(*cost, result.session.total_cost()),
        _ => unreachable!(),
    }
}

use crate::analysis::{Analyzer, GapDetector, GapFillLoop, LoopStop};
use crate::config::{OrchestratorConfig, ResearchOptions};
use crate::cost::CostAccumulator;
use crate::planner::Planner;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::synthesizer::Synthesizer;
use parking_lot::Mutex;
use quarry_agent::{LlmBackend, WorkerAgent};
use quarry_core::{
    Contradiction, CostScope, Event, EventBus, EventPayload, EventPublisher, Perspective,
    QuarryError, QuarryResult, Report, Session, SessionId, SessionStatus,
};
use quarry_session::{ReportWriter, SessionRepository};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A finished research run.
#[derive(Debug, Clone)]
pub struct ResearchResult {
    /// The session in its terminal state, as persisted.
    pub session: Session,
    pub report: Report,
    pub perspectives: Vec<Perspective>,
}

/// Cancellation handle for a running session. The first reason given wins.
#[derive(Clone)]
struct RunHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl RunHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    fn cancel(&self, reason: &str) {
        self.reason.lock().get_or_insert_with(|| reason.to_string());
        self.token.cancel();
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// What a run produced before it ended, successfully or not.
struct RunOutput {
    report: Report,
    perspectives: Vec<Perspective>,
}

/// The research engine.
/// Implements the plan → execute → analyze → synthesize pipeline.
pub struct ResearchOrchestrator {
    agent: Arc<dyn WorkerAgent>,
    repository: Arc<dyn SessionRepository>,
    report_writer: Option<Arc<dyn ReportWriter>>,
    events: Arc<EventBus>,
    config: OrchestratorConfig,
    planner: Planner,
    analyzer: Analyzer,
    synthesizer: Synthesizer,
    active: Mutex<HashMap<SessionId, RunHandle>>,
}

impl ResearchOrchestrator {
    /// Creates an orchestrator. `llm` serves planning, analysis and synthesis;
    /// `agent` runs the workers.
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        agent: Arc<dyn WorkerAgent>,
        repository: Arc<dyn SessionRepository>,
        events: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> QuarryResult<Self> {
        Ok(Self {
            agent,
            repository,
            report_writer: None,
            events,
            planner: Planner::new(Arc::clone(&llm), config.clone()),
            analyzer: Analyzer::new(Arc::clone(&llm), config.clone()),
            synthesizer: Synthesizer::new(llm)?,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Writes a document for every completed session, in the background.
    pub fn with_report_writer(mut self, writer: Arc<dyn ReportWriter>) -> Self {
        self.report_writer = Some(writer);
        self
    }

    /// Replaces the default LLM gap detector.
    pub fn with_gap_detector(mut self, llm: Arc<dyn LlmBackend>, detector: Arc<dyn GapDetector>) -> Self {
        self.analyzer = Analyzer::with_detector(llm, detector, self.config.clone());
        self
    }

    /// The bus every run publishes to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancels a running session. `NotFound` when it is unknown or already
    /// finished.
    pub fn cancel(&self, session_id: &SessionId) -> QuarryResult<()> {
        let handle = self
            .active
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| QuarryError::NotFound(format!("active session {session_id}")))?;
        info!(session_id = %session_id, "Cancellation requested");
        handle.cancel("cancelled by user");
        Ok(())
    }

    /// Runs one research session end to end.
    ///
    /// Returns `Err` only for planning and synthesis failures and for
    /// cancellation. The session is persisted exactly once, in its terminal
    /// state, whatever the outcome.
    pub async fn research(
        &self,
        query: &str,
        options: ResearchOptions,
    ) -> QuarryResult<ResearchResult> {
        let start = Instant::now();
        let mut session = Session::new(query.trim(), options.mode);
        let session_id = session.id.clone();
        let handle = RunHandle::new();
        self.active.lock().insert(session_id.clone(), handle.clone());

        let watchdog = options.timeout.map(|timeout| {
            let handle = handle.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(session_id = %session_id, timeout_ms = timeout.as_millis() as u64, "Research timed out");
                handle.cancel("timed out");
            })
        });

        info!(session_id = %session_id, mode = %options.mode, "Research started");
        self.publish(
            &session_id,
            EventPayload::ResearchStarted {
                query: session.query.clone(),
                mode: options.mode,
            },
        );

        let result = self.run(&mut session, &options, &handle.token).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        self.active.lock().remove(&session_id);

        let result = match result {
            Ok(output) => self.complete(&mut session, output),
            Err(e) if e.is_cancelled() => {
                let reason = handle.reason().unwrap_or_else(|| match &e {
                    QuarryError::Cancelled { reason } => reason.clone(),
                    other => other.to_string(),
                });
                self.end(&mut session, SessionStatus::Cancelled, &reason);
                self.publish(&session_id, EventPayload::ResearchCancelled { reason: reason.clone() });
                Err(QuarryError::cancelled(reason))
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Research failed");
                self.end(&mut session, SessionStatus::Failed, &e.to_string());
                self.publish(&session_id, EventPayload::ResearchFailed { error: e.to_string() });
                Err(e)
            }
        };

        if let Err(e) = self.repository.save(&session).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist session");
        }
        if session.status == SessionStatus::Complete {
            self.spawn_report_writer(&session);
        }

        info!(
            session_id = %session_id,
            status = %session.status,
            workers = session.workers.len(),
            total_tokens = session.total_cost().total_tokens,
            total_cost = %session.total_cost().total_cost,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Research finished"
        );

        result.map(|(report, perspectives)| ResearchResult {
            session,
            report,
            perspectives,
        })
    }

    async fn run(
        &self,
        session: &mut Session,
        options: &ResearchOptions,
        cancel: &CancellationToken,
    ) -> QuarryResult<RunOutput> {
        // Phase 1: plan
        let outcome = self.planner.plan(&session.query, options.mode, cancel).await?;
        let plan = outcome.plan;
        session.overhead_cost += outcome.cost;
        session.complexity_score = plan.complexity;
        self.publish(
            &session.id,
            EventPayload::PlanCreated {
                perspectives: plan.perspectives.clone(),
                worker_count: plan.workers.len(),
                complexity: plan.complexity,
            },
        );

        // Phase 2: initial round
        let max_workers = match options.max_workers {
            0 => self.config.max_workers,
            n => n,
        };
        let accumulator = Arc::new(CostAccumulator::new());
        let scheduler = Scheduler::new(
            Arc::clone(&self.agent),
            Arc::clone(&self.events) as Arc<dyn EventPublisher>,
            Arc::clone(&accumulator),
            max_workers,
        );

        if cancel.is_cancelled() {
            return Err(QuarryError::cancelled("cancelled before dispatch"));
        }
        session.transition(SessionStatus::Running)?;
        session.workers = plan.workers.clone();
        info!(session_id = %session.id, workers = plan.workers.len(), max_workers, "Dispatching workers");

        let round = scheduler.run(&session.id, plan.workers.clone(), cancel).await;
        session.cost = accumulator.snapshot();
        match round {
            Ok(report) => session.workers = report.workers,
            Err(SchedulerError::AllFailed(report)) => {
                warn!(session_id = %session.id, "Every initial worker failed");
                session.workers = report.workers;
            }
            Err(SchedulerError::Cancelled(report)) => {
                session.workers = report.workers;
                return Err(QuarryError::cancelled("cancelled while workers were running"));
            }
            Err(SchedulerError::InvalidGraph(e)) => return Err(QuarryError::Planning(e.to_string())),
        }

        // Phase 3: gap filling
        let mut contradictions: Vec<Contradiction> = Vec::new();
        let budget = plan.gap_budget(self.config.max_gap_iterations);
        if budget > 0 && session.workers.iter().any(|w| w.is_complete()) {
            let gap_loop = GapFillLoop::new(
                &self.analyzer,
                &scheduler,
                Arc::clone(&self.events) as Arc<dyn EventPublisher>,
                &self.config,
            );
            let filled = gap_loop
                .run(&session.id, &plan, &session.workers, budget, cancel)
                .await;
            session.workers.extend(filled.workers);
            session.overhead_cost += filled.overhead;
            session.cost = accumulator.snapshot();
            contradictions = filled.contradictions;
            info!(session_id = %session.id, rounds = filled.rounds, stop = ?filled.stop, "Gap filling finished");
            if filled.stop == LoopStop::Cancelled {
                return Err(QuarryError::cancelled("cancelled during gap filling"));
            }
        }

        // Phase 4: synthesize
        self.publish(
            &session.id,
            EventPayload::SynthesisStarted {
                completed_workers: session.workers.iter().filter(|w| w.is_complete()).count(),
            },
        );
        let synthesis = self
            .synthesizer
            .build(&session.query, &plan, &session.workers, &contradictions, cancel)
            .await?;
        session.overhead_cost += synthesis.cost;
        session.sources = synthesis.sources;

        Ok(RunOutput {
            report: synthesis.report,
            perspectives: plan.perspectives,
        })
    }

    fn complete(
        &self,
        session: &mut Session,
        output: RunOutput,
    ) -> QuarryResult<(Report, Vec<Perspective>)> {
        session.report = Some(output.report.clone());
        session.transition(SessionStatus::Complete)?;
        let total = session.total_cost();
        self.publish(
            &session.id,
            EventPayload::CostUpdated {
                scope: CostScope::Total,
                cost: total,
            },
        );
        self.publish(
            &session.id,
            EventPayload::ResearchComplete {
                cost: total,
                citations: output.report.citations.len(),
            },
        );
        Ok((output.report, output.perspectives))
    }

    fn end(&self, session: &mut Session, status: SessionStatus, reason: &str) {
        session.error = Some(reason.to_string());
        if let Err(e) = session.transition(status) {
            warn!(session_id = %session.id, error = %e, "Unexpected session state at end of run");
        }
        self.publish(
            &session.id,
            EventPayload::CostUpdated {
                scope: CostScope::Total,
                cost: session.total_cost(),
            },
        );
    }

    fn spawn_report_writer(&self, session: &Session) {
        let Some(writer) = self.report_writer.clone() else {
            return;
        };
        let snapshot = session.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.write_session(&snapshot).await {
                warn!(session_id = %snapshot.id, error = %e, "Failed to write report");
            }
        });
    }

    fn publish(&self, session_id: &SessionId, payload: EventPayload) {
        self.events.publish(Event::new(session_id.clone(), payload));
    }
}

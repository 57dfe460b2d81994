use crate::cost::CostAccumulator;
use crate::dag::WorkerGraph;
use quarry_agent::{AgentFailure, AgentResult, WorkerAgent, WorkerAssignment};
use quarry_core::{
    CostBreakdown, CostScope, Event, EventPayload, EventPublisher, QuarryError, SessionId, Source,
    Worker, WorkerId, WorkerStatus, WorkerUpdate,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal outcome of one worker, keyed by id in [`RoundReport::results`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    pub output: String,
    pub sources: Vec<Source>,
    pub cost: CostBreakdown,
    pub error: Option<String>,
}

/// Workers of one scheduler round in their final state, plus the cost the
/// round merged.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub workers: Vec<Worker>,
    pub cost: CostBreakdown,
}

impl RoundReport {
    pub fn completed(&self) -> Vec<&Worker> {
        self.with_status(WorkerStatus::Complete)
    }

    pub fn failed(&self) -> Vec<&Worker> {
        self.with_status(WorkerStatus::Failed)
    }

    fn with_status(&self, status: WorkerStatus) -> Vec<&Worker> {
        self.workers.iter().filter(|w| w.status == status).collect()
    }

    pub fn results(&self) -> HashMap<WorkerId, WorkerResult> {
        self.workers
            .iter()
            .map(|w| {
                (
                    w.id,
                    WorkerResult {
                        status: w.status,
                        output: w.output.clone(),
                        sources: w.sources.clone(),
                        cost: w.cost,
                        error: w.error.clone(),
                    },
                )
            })
            .collect()
    }
}

/// A round that did not produce a usable result. Every variant that ran
/// workers carries the round report so their cost and output are kept.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler round cancelled")]
    Cancelled(Box<RoundReport>),
    #[error("all {} workers failed", .0.workers.len())]
    AllFailed(Box<RoundReport>),
    #[error(transparent)]
    InvalidGraph(QuarryError),
}

impl SchedulerError {
    /// The round report, if workers were run.
    pub fn into_report(self) -> Option<RoundReport> {
        match self {
            SchedulerError::Cancelled(report) | SchedulerError::AllFailed(report) => Some(*report),
            SchedulerError::InvalidGraph(_) => None,
        }
    }
}

/// Runs a batch of workers as a dependency graph with bounded concurrency.
pub struct Scheduler {
    agent: Arc<dyn WorkerAgent>,
    events: Arc<dyn EventPublisher>,
    cost: Arc<CostAccumulator>,
    max_workers: usize,
}

struct Round<'a> {
    session_id: &'a SessionId,
    graph: WorkerGraph,
    cost: CostBreakdown,
}

impl Scheduler {
    pub fn new(
        agent: Arc<dyn WorkerAgent>,
        events: Arc<dyn EventPublisher>,
        cost: Arc<CostAccumulator>,
        max_workers: usize,
    ) -> Self {
        Self {
            agent,
            events,
            cost,
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs `workers` to completion.
    ///
    /// Nodes are dispatched in sequence order as soon as their dependencies
    /// complete and a slot is free. A node whose dependency fails, is skipped
    /// or is cancelled is Skipped without running. This loop is the only
    /// writer of worker state; spawned tasks just return the agent result.
    pub async fn run(
        &self,
        session_id: &SessionId,
        workers: Vec<Worker>,
        cancel: &CancellationToken,
    ) -> Result<RoundReport, SchedulerError> {
        let graph = WorkerGraph::new(workers).map_err(SchedulerError::InvalidGraph)?;
        let mut round = Round {
            session_id,
            graph,
            cost: CostBreakdown::default(),
        };
        let mut tasks: JoinSet<(usize, AgentResult)> = JoinSet::new();
        let mut task_nodes: HashMap<Id, usize> = HashMap::new();
        let mut cancelled = false;

        debug!(session_id = %session_id, workers = round.graph.len(), max_workers = self.max_workers, "Scheduler round started");

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
            }
            if !cancelled {
                self.skip_blocked(&mut round);
                for i in round.graph.ready() {
                    if tasks.len() >= self.max_workers {
                        break;
                    }
                    let handle = self.dispatch(&mut round, i, &mut tasks, cancel);
                    task_nodes.insert(handle, i);
                }
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    info!(session_id = %session_id, in_flight = tasks.len(), "Cancelling scheduler round");
                    cancelled = true;
                }
                joined = tasks.join_next_with_id() => match joined {
                    Some(Ok((id, (i, result)))) => {
                        task_nodes.remove(&id);
                        self.apply(&mut round, i, result, cancelled);
                    }
                    Some(Err(join_err)) => {
                        let Some(i) = task_nodes.remove(&join_err.id()) else {
                            warn!(error = %join_err, "Lost track of a worker task");
                            continue;
                        };
                        let failure = AgentFailure::from(QuarryError::Worker(format!(
                            "worker task aborted: {join_err}"
                        )));
                        self.apply(&mut round, i, Err(failure), cancelled);
                    }
                    None => break,
                }
            }
        }

        if cancelled {
            for i in round.graph.pending() {
                if round.graph.transition(i, WorkerStatus::Cancelled).is_ok() {
                    round.graph.worker_mut(i).error = Some("cancelled before dispatch".into());
                    self.publish_worker(&round, i, WorkerStatus::Cancelled);
                }
            }
        }

        let Round { graph, cost, .. } = round;
        let report = RoundReport {
            workers: graph.into_workers(),
            cost,
        };
        if cancelled {
            return Err(SchedulerError::Cancelled(Box::new(report)));
        }
        if !report.workers.is_empty() && report.completed().is_empty() {
            warn!(session_id = %session_id, workers = report.workers.len(), "No worker completed");
            return Err(SchedulerError::AllFailed(Box::new(report)));
        }
        debug!(
            session_id = %session_id,
            completed = report.completed().len(),
            failed = report.failed().len(),
            "Scheduler round finished"
        );
        Ok(report)
    }

    /// Skips every pending node that can no longer run.
    fn skip_blocked(&self, round: &mut Round<'_>) {
        for i in round.graph.blocked() {
            if round.graph.worker(i).status != WorkerStatus::Pending {
                continue;
            }
            if round.graph.transition(i, WorkerStatus::Skipped).is_ok() {
                round.graph.worker_mut(i).error = Some("dependency did not complete".into());
                self.publish_worker(round, i, WorkerStatus::Skipped);
                self.skip_downstream(round, i);
            }
        }
    }

    fn skip_downstream(&self, round: &mut Round<'_>, i: usize) {
        for skipped in round.graph.skip_dependents_of(i) {
            let worker = round.graph.worker(skipped);
            info!(
                session_id = %round.session_id,
                worker_id = %worker.id,
                sequence = worker.sequence,
                "Worker skipped"
            );
            self.publish_worker(round, skipped, WorkerStatus::Skipped);
        }
    }

    fn dispatch(
        &self,
        round: &mut Round<'_>,
        i: usize,
        tasks: &mut JoinSet<(usize, AgentResult)>,
        cancel: &CancellationToken,
    ) -> Id {
        if let Err(e) = round.graph.transition(i, WorkerStatus::Running) {
            warn!(error = %e, "Dispatching worker in unexpected state");
        }
        let worker = round.graph.worker(i);
        let assignment = WorkerAssignment {
            session_id: round.session_id.clone(),
            worker_id: worker.id,
            sequence: worker.sequence,
            objective: worker.objective.clone(),
            questions: worker.kind.questions().to_vec(),
            perspective: worker.kind.perspective().map(str::to_string),
        };
        info!(
            session_id = %round.session_id,
            worker_id = %worker.id,
            sequence = worker.sequence,
            "Worker started"
        );
        self.publish_worker(round, i, WorkerStatus::Running);

        let agent = Arc::clone(&self.agent);
        let token = cancel.child_token();
        tasks
            .spawn(async move {
                // Agent branch first so a cooperative agent can hand back its
                // partial cost when cancellation fires.
                let result = tokio::select! {
                    biased;
                    r = agent.execute(&assignment, token.clone()) => r,
                    _ = token.cancelled() => Err(AgentFailure::from(
                        QuarryError::cancelled("worker cancelled"),
                    )),
                };
                (i, result)
            })
            .id()
    }

    /// Applies a finished agent run to node `i` and merges its cost.
    fn apply(&self, round: &mut Round<'_>, i: usize, result: AgentResult, cancelled: bool) {
        let (status, output, error) = match result {
            Ok(output) => (WorkerStatus::Complete, output, None),
            Err(failure) => {
                let status = if failure.error.is_cancelled() {
                    WorkerStatus::Cancelled
                } else {
                    WorkerStatus::Failed
                };
                (status, failure.partial, Some(failure.error.to_string()))
            }
        };

        if let Err(e) = round.graph.transition(i, status) {
            warn!(error = %e, "Ignoring result for worker in unexpected state");
            return;
        }
        let worker = round.graph.worker_mut(i);
        worker.output = output.output;
        worker.sources = output.sources;
        worker.cost = output.cost;
        worker.steps = output.steps;
        worker.tool_calls = output.tool_calls;
        worker.error = error;
        let worker_cost = worker.cost;

        round.cost += worker_cost;
        let session_total = self.cost.add(&worker_cost);

        let worker = round.graph.worker(i);
        match status {
            WorkerStatus::Complete => info!(
                session_id = %round.session_id,
                worker_id = %worker.id,
                sequence = worker.sequence,
                sources = worker.sources.len(),
                tokens = worker_cost.total_tokens,
                "Worker complete"
            ),
            WorkerStatus::Cancelled => info!(
                session_id = %round.session_id,
                worker_id = %worker.id,
                sequence = worker.sequence,
                "Worker cancelled"
            ),
            _ => error!(
                session_id = %round.session_id,
                worker_id = %worker.id,
                sequence = worker.sequence,
                error = worker.error.as_deref().unwrap_or_default(),
                "Worker failed"
            ),
        }
        self.publish_worker(round, i, status);
        self.publish(
            round.session_id,
            EventPayload::CostUpdated {
                scope: CostScope::Worker,
                cost: worker_cost,
            },
        );
        self.publish(
            round.session_id,
            EventPayload::CostUpdated {
                scope: CostScope::Session,
                cost: session_total,
            },
        );

        if status != WorkerStatus::Complete && !cancelled {
            self.skip_downstream(round, i);
        }
    }

    fn publish_worker(&self, round: &Round<'_>, i: usize, status: WorkerStatus) {
        let worker = round.graph.worker(i);
        let update = WorkerUpdate {
            worker_id: worker.id,
            sequence: worker.sequence,
            objective: worker.objective.clone(),
            status,
            message: worker.error.clone(),
        };
        let payload = match status {
            WorkerStatus::Running => EventPayload::WorkerStarted(update),
            WorkerStatus::Complete => EventPayload::WorkerComplete(update),
            WorkerStatus::Skipped => EventPayload::WorkerSkipped(update),
            WorkerStatus::Failed | WorkerStatus::Cancelled | WorkerStatus::Pending => {
                EventPayload::WorkerFailed(update)
            }
        };
        self.publish(round.session_id, payload);
    }

    fn publish(&self, session_id: &SessionId, payload: EventPayload) {
        self.events.publish(Event::new(session_id.clone(), payload));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use quarry_agent::mock::{AgentScript, ScriptedAgent};
    use quarry_core::{EventBus, EventSubscriber, EventType, Perspective};
    use std::time::Duration;

    fn node(seq: u32, name: &str) -> Worker {
        Worker::for_perspective(seq, &Perspective::new(name, "focus", vec![]))
    }

    fn unit_cost(tokens: u64) -> CostBreakdown {
        CostBreakdown::new("openai/gpt-4o-mini", tokens, tokens / 2, 0)
    }

    fn scheduler(agent: Arc<ScriptedAgent>, bus: Arc<EventBus>, max: usize) -> Scheduler {
        Scheduler::new(agent, bus, Arc::new(CostAccumulator::new()), max)
    }

    #[tokio::test]
    async fn test_runs_all_and_merges_cost() {
        let agent = Arc::new(
            ScriptedAgent::new(AgentScript::answer("ok").with_cost(unit_cost(100)))
                .on("Beta", AgentScript::answer("beta").with_cost(unit_cost(300))),
        );
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe(&[EventType::WorkerStarted, EventType::WorkerComplete]);
        let acc = Arc::new(CostAccumulator::new());
        let scheduler = Scheduler::new(agent.clone(), bus, acc.clone(), 2);

        let workers = vec![node(1, "Alpha"), node(2, "Beta"), node(3, "Gamma")];
        let report = scheduler
            .run(&SessionId::generate(), workers, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.completed().len(), 3);
        assert_eq!(report.cost.input_tokens, 500);
        assert_eq!(acc.snapshot(), report.cost);
        let sum: CostBreakdown = report.workers.iter().map(|w| w.cost).sum();
        assert_eq!(sum, report.cost);
        assert!(report
            .workers
            .iter()
            .all(|w| w.started_at.is_some() && w.completed_at.is_some()));

        let results = report.results();
        assert_eq!(results[&report.workers[1].id].output, "beta");

        let mut started = 0;
        let mut complete = 0;
        while let Some(event) = events.try_recv() {
            match event.event_type() {
                EventType::WorkerStarted => started += 1,
                EventType::WorkerComplete => complete += 1,
                _ => {}
            }
        }
        assert_eq!((started, complete), (3, 3));
        assert!(agent.peak_concurrency() <= 2);
    }

    #[test]
    fn test_rejected_result_leaves_worker_and_cost_untouched() {
        let acc = Arc::new(CostAccumulator::new());
        let scheduler = Scheduler::new(
            Arc::new(ScriptedAgent::new(AgentScript::answer("ok"))),
            Arc::new(EventBus::default()),
            acc.clone(),
            1,
        );
        let session_id = SessionId::generate();
        let mut round = Round {
            session_id: &session_id,
            graph: WorkerGraph::new(vec![node(1, "Alpha")]).unwrap(),
            cost: CostBreakdown::default(),
        };
        let output = quarry_agent::AgentOutput {
            output: "late answer".into(),
            cost: unit_cost(100),
            ..Default::default()
        };

        // Pending cannot move straight to Complete.
        scheduler.apply(&mut round, 0, Ok(output), false);

        let worker = round.graph.worker(0);
        assert_eq!(worker.status, WorkerStatus::Pending);
        assert!(worker.output.is_empty());
        assert!(worker.cost.is_zero());
        assert!(round.cost.is_zero());
        assert!(acc.snapshot().is_zero());
    }

    #[tokio::test]
    async fn test_concurrency_bound_holds() {
        let agent = Arc::new(ScriptedAgent::new(
            AgentScript::answer("ok").with_delay(Duration::from_millis(20)),
        ));
        let scheduler = scheduler(agent.clone(), Arc::new(EventBus::default()), 2);
        let workers = (1..=6).map(|i| node(i, &format!("W{i}"))).collect();
        let report = scheduler
            .run(&SessionId::generate(), workers, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.completed().len(), 6);
        assert_eq!(agent.peak_concurrency(), 2);
        assert_eq!(agent.invocations(), 6);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_transitively() {
        let agent = Arc::new(
            ScriptedAgent::new(AgentScript::answer("ok"))
                .on("Root", AgentScript::failing("search exploded").with_cost(unit_cost(40))),
        );
        let bus = Arc::new(EventBus::default());
        let mut skipped_events = bus.subscribe(&[EventType::WorkerSkipped]);
        let scheduler = scheduler(agent.clone(), bus, 3);

        let root = node(1, "Root");
        let child = node(2, "Child").with_dependencies(vec![root.id]);
        let grandchild = node(3, "Grandchild").with_dependencies(vec![child.id]);
        let other = node(4, "Other");
        let report = scheduler
            .run(
                &SessionId::generate(),
                vec![root, child, grandchild, other],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let statuses: Vec<WorkerStatus> = report.workers.iter().map(|w| w.status).collect();
        assert_eq!(
            statuses,
            [
                WorkerStatus::Failed,
                WorkerStatus::Skipped,
                WorkerStatus::Skipped,
                WorkerStatus::Complete
            ]
        );
        assert_eq!(agent.invocations(), 2);
        assert_eq!(report.workers[0].cost.input_tokens, 40);
        assert_eq!(report.cost.input_tokens, 40);
        assert!(report.workers[0]
            .error
            .as_deref()
            .unwrap()
            .contains("search exploded"));

        assert!(skipped_events.try_recv().is_some());
        assert!(skipped_events.try_recv().is_some());
        assert!(skipped_events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dependents_start_after_dependency_finishes() {
        let agent = Arc::new(ScriptedAgent::new(
            AgentScript::answer("ok").with_delay(Duration::from_millis(10)),
        ));
        let scheduler = scheduler(agent.clone(), Arc::new(EventBus::default()), 4);
        let first = node(1, "First");
        let second = node(2, "Second").with_dependencies(vec![first.id]);
        let (first_id, second_id) = (first.id, second.id);
        scheduler
            .run(
                &SessionId::generate(),
                vec![second, first],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let runs = agent.runs();
        let first_run = runs.iter().find(|r| r.worker_id == first_id).unwrap();
        let second_run = runs.iter().find(|r| r.worker_id == second_id).unwrap();
        assert!(second_run.started_at >= first_run.finished_at);
    }

    #[tokio::test]
    async fn test_all_failed_carries_report() {
        let agent = Arc::new(ScriptedAgent::new(
            AgentScript::failing("nope").with_cost(unit_cost(10)),
        ));
        let scheduler = scheduler(agent, Arc::new(EventBus::default()), 2);
        let err = scheduler
            .run(
                &SessionId::generate(),
                vec![node(1, "A"), node(2, "B")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let SchedulerError::AllFailed(report) = err else {
            panic!("expected AllFailed");
        };
        assert_eq!(report.failed().len(), 2);
        assert_eq!(report.cost.input_tokens, 20);
    }

    #[tokio::test]
    async fn test_empty_batch_is_ok() {
        let agent = Arc::new(ScriptedAgent::new(AgentScript::answer("ok")));
        let scheduler = scheduler(agent, Arc::new(EventBus::default()), 2);
        let report = scheduler
            .run(&SessionId::generate(), Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.workers.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_round() {
        let agent = Arc::new(
            ScriptedAgent::new(
                AgentScript::answer("slow")
                    .with_delay(Duration::from_secs(30))
                    .with_cost(unit_cost(7)),
            )
            .on("Quick", AgentScript::answer("quick")),
        );
        let scheduler = scheduler(agent, Arc::new(EventBus::default()), 2);
        let workers = vec![node(1, "Quick"), node(2, "Slow1"), node(3, "Slow2"), node(4, "Slow3")];
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = scheduler
            .run(&SessionId::generate(), workers, &cancel)
            .await
            .unwrap_err();

        let SchedulerError::Cancelled(report) = err else {
            panic!("expected Cancelled");
        };
        let statuses: Vec<WorkerStatus> = report.workers.iter().map(|w| w.status).collect();
        assert_eq!(
            statuses,
            [
                WorkerStatus::Complete,
                WorkerStatus::Cancelled,
                WorkerStatus::Cancelled,
                WorkerStatus::Cancelled
            ]
        );
        // Two in-flight workers report partial cost; the undispatched one has none.
        assert_eq!(report.cost.input_tokens, 14);
        assert_eq!(
            report.workers[3].error.as_deref(),
            Some("cancelled before dispatch")
        );
    }

    #[tokio::test]
    async fn test_invalid_graph_is_rejected() {
        let agent = Arc::new(ScriptedAgent::new(AgentScript::answer("ok")));
        let scheduler = scheduler(agent, Arc::new(EventBus::default()), 2);
        let orphan = node(1, "A").with_dependencies(vec![uuid::Uuid::new_v4()]);
        let err = scheduler
            .run(&SessionId::generate(), vec![orphan], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidGraph(_)));
        assert!(err.into_report().is_none());
    }
}

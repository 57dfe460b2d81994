use async_trait::async_trait;
use quarry_core::{
    CostBreakdown, QuarryError, ReactStep, SessionId, Source, ToolCallRecord, WorkerId,
};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Everything a worker agent needs to know about its job.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub session_id: SessionId,
    pub worker_id: WorkerId,
    pub sequence: u32,
    pub objective: String,
    pub questions: Vec<String>,
    pub perspective: Option<String>,
}

/// The result of a finished worker run.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub output: String,
    pub sources: Vec<Source>,
    pub cost: CostBreakdown,
    pub steps: Vec<ReactStep>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// A failed worker run. Carries whatever was consumed before the failure so
/// the cost still lands in the session totals.
#[derive(Debug)]
pub struct AgentFailure {
    pub error: QuarryError,
    pub partial: AgentOutput,
}

impl AgentFailure {
    pub fn new(error: QuarryError, partial: AgentOutput) -> Self {
        Self { error, partial }
    }
}

impl From<QuarryError> for AgentFailure {
    fn from(error: QuarryError) -> Self {
        Self::new(error, AgentOutput::default())
    }
}

impl fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

pub type AgentResult = Result<AgentOutput, AgentFailure>;

/// A research worker. One call runs one worker to completion.
///
/// Implementations must return a [`QuarryError::Cancelled`] failure promptly
/// once `cancel` fires.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    async fn execute(&self, assignment: &WorkerAssignment, cancel: CancellationToken)
        -> AgentResult;
}

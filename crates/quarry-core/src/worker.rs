use crate::cost::CostBreakdown;
use crate::error::{QuarryError, QuarryResult};
use crate::evidence::{Gap, Perspective, Source};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a worker node.
pub type WorkerId = Uuid;

/// Lifecycle of a worker. Monotonic: terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting for dispatch.
    Pending,
    /// Agent logic is executing.
    Running,
    /// Finished with output.
    Complete,
    /// The agent returned an error.
    Failed,
    /// Never ran because a dependency did not complete.
    Skipped,
    /// Stopped by the cancellation signal.
    Cancelled,
}

impl WorkerStatus {
    /// Returns `true` for Complete, Failed, Skipped and Cancelled.
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkerStatus::Pending | WorkerStatus::Running)
    }

    fn can_transition_to(self, to: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Skipped | Cancelled) | (Running, Complete | Failed | Cancelled)
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Running => "running",
            WorkerStatus::Complete => "complete",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Skipped => "skipped",
            WorkerStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a worker was created for, with the data specific to that origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerKind {
    /// Root node planned from a perspective.
    Perspective {
        /// Perspective name.
        perspective: String,
        /// Seed questions to answer.
        questions: Vec<String>,
    },
    /// Follow-up node created by the gap-filling loop.
    GapFill {
        /// 1-based gap-filling round.
        round: u32,
        /// The gap being filled.
        gap: Gap,
    },
}

impl WorkerKind {
    /// Perspective the output belongs to, if any.
    pub fn perspective(&self) -> Option<&str> {
        match self {
            WorkerKind::Perspective { perspective, .. } => Some(perspective),
            WorkerKind::GapFill { gap, .. } => gap.perspective.as_deref(),
        }
    }

    /// Questions the worker should answer.
    pub fn questions(&self) -> &[String] {
        match self {
            WorkerKind::Perspective { questions, .. } => questions,
            WorkerKind::GapFill { gap, .. } => &gap.suggested_queries,
        }
    }

    /// Returns `true` for gap-fill workers.
    pub fn is_gap_fill(&self) -> bool {
        matches!(self, WorkerKind::GapFill { .. })
    }
}

/// One reasoning turn of the ReAct loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactStep {
    /// 1-based iteration.
    pub iteration: u32,
    /// Model output for this turn.
    pub content: String,
    /// Number of tool calls issued in this turn.
    pub tool_calls: usize,
}

/// A tool invocation made by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool name.
    pub tool: String,
    /// Arguments passed.
    pub arguments: serde_json::Value,
    /// Truncated result or error text.
    pub preview: String,
    /// Whether the call failed.
    pub is_error: bool,
    /// When the call returned.
    pub at: DateTime<Utc>,
}

/// A unit of research execution bound to an objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique id.
    pub id: WorkerId,
    /// 1-based sequence number within the session.
    pub sequence: u32,
    /// The objective handed to the agent.
    pub objective: String,
    /// Origin and kind-specific data.
    pub kind: WorkerKind,
    /// Current status.
    pub status: WorkerStatus,
    /// Final answer text.
    #[serde(default)]
    pub output: String,
    /// Sources the agent retrieved.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Tokens and dollars spent by this worker.
    #[serde(default)]
    pub cost: CostBreakdown,
    /// When the node was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure or skip reason.
    pub error: Option<String>,
    /// Workers that must complete first. Empty for root nodes.
    #[serde(default)]
    pub dependencies: Vec<WorkerId>,
    /// ReAct turns.
    #[serde(default)]
    pub steps: Vec<ReactStep>,
    /// Tool invocations.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Worker {
    /// Creates a pending worker.
    pub fn new(sequence: u32, objective: impl Into<String>, kind: WorkerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            objective: objective.into(),
            kind,
            status: WorkerStatus::Pending,
            output: String::new(),
            sources: Vec::new(),
            cost: CostBreakdown::default(),
            started_at: None,
            completed_at: None,
            error: None,
            dependencies: Vec::new(),
            steps: Vec::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Creates a root worker for a perspective.
    pub fn for_perspective(sequence: u32, perspective: &Perspective) -> Self {
        let objective = format!("{}: {}", perspective.name, perspective.focus);
        Self::new(
            sequence,
            objective,
            WorkerKind::Perspective {
                perspective: perspective.name.clone(),
                questions: perspective.questions.clone(),
            },
        )
    }

    /// Creates a gap-fill worker.
    pub fn for_gap(sequence: u32, round: u32, gap: Gap) -> Self {
        Self::new(
            sequence,
            gap.description.clone(),
            WorkerKind::GapFill { round, gap },
        )
    }

    /// Sets the dependency list.
    pub fn with_dependencies(mut self, deps: Vec<WorkerId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Moves to `to`, rejecting transitions that would break monotonicity.
    ///
    /// `started_at` is stamped on Running and `completed_at` on the first
    /// terminal status unless the caller already set them.
    pub fn transition(&mut self, to: WorkerStatus) -> QuarryResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(QuarryError::InvalidTransition(format!(
                "worker {} cannot move from {} to {}",
                self.sequence, self.status, to
            )));
        }
        let now = Utc::now();
        if to == WorkerStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    /// Returns `true` once the worker completed successfully.
    pub fn is_complete(&self) -> bool {
        self.status == WorkerStatus::Complete
    }
}

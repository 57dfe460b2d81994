use crate::cost::{CostBreakdown, Usd};
use crate::error::{QuarryError, QuarryResult};
use crate::evidence::Source;
use crate::report::Report;
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Session identity, formatted `YYYY-MM-DD-<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh id dated today.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", Utc::now().format("%Y-%m-%d"), &suffix[..8]))
    }

    /// Borrows the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl FromStr for SessionId {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.contains(['/', '\\']) || s.starts_with('.') {
            return Err(QuarryError::Config(format!("invalid session id '{s}'")));
        }
        Ok(Self(s.to_string()))
    }
}

/// Research depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One perspective, no gap filling.
    Fast,
    /// Multiple perspectives and gap-filling rounds.
    #[default]
    Deep,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Fast => f.write_str("fast"),
            Mode::Deep => f.write_str("deep"),
        }
    }
}

impl FromStr for Mode {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(Mode::Fast),
            "deep" => Ok(Mode::Deep),
            other => Err(QuarryError::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, planning in progress.
    Pending,
    /// Workers have been dispatched.
    Running,
    /// Report produced.
    Complete,
    /// Planning or synthesis failed.
    Failed,
    /// Cancelled or timed out.
    Cancelled,
}

impl SessionStatus {
    /// Returns `true` for Complete, Failed and Cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Failed | Cancelled) | (Running, Complete | Failed | Cancelled)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Complete => "complete",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "complete" => Ok(SessionStatus::Complete),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(QuarryError::Config(format!("unknown status '{other}'"))),
        }
    }
}

/// One end-to-end research run and its accumulated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Identity.
    pub id: SessionId,
    /// Snapshot format version.
    pub version: u32,
    /// The research query.
    pub query: String,
    /// Fast or deep.
    pub mode: Mode,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Query complexity, 0 to 1.
    #[serde(default)]
    pub complexity_score: f64,
    /// All workers in sequence order.
    #[serde(default)]
    pub workers: Vec<Worker>,
    /// Final report, once complete.
    pub report: Option<Report>,
    /// Deduplicated sources across completed workers.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Sum of worker costs.
    #[serde(default)]
    pub cost: CostBreakdown,
    /// Planner, analysis and synthesis LLM cost.
    #[serde(default)]
    pub overhead_cost: CostBreakdown,
    /// Terminal error text.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When a terminal status was reached.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Current snapshot format version.
    pub const VERSION: u32 = 1;

    /// Creates a pending session.
    pub fn new(query: impl Into<String>, mode: Mode) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            version: Self::VERSION,
            query: query.into(),
            mode,
            status: SessionStatus::Pending,
            complexity_score: 0.0,
            workers: Vec::new(),
            report: None,
            sources: Vec::new(),
            cost: CostBreakdown::default(),
            overhead_cost: CostBreakdown::default(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Moves to `to`. Terminal states are final.
    pub fn transition(&mut self, to: SessionStatus) -> QuarryResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(QuarryError::InvalidTransition(format!(
                "session {} cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Worker cost plus orchestration overhead.
    pub fn total_cost(&self) -> CostBreakdown {
        self.cost.add(self.overhead_cost)
    }

    /// Fraction of workers in a terminal status.
    pub fn progress(&self) -> f64 {
        if self.workers.is_empty() {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        let done = self
            .workers
            .iter()
            .filter(|w| w.status.is_terminal())
            .count();
        done as f64 / self.workers.len() as f64
    }

    /// Lightweight listing view.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            query: self.query.clone(),
            mode: self.mode,
            status: self.status,
            progress: self.progress(),
            total_cost: self.total_cost().total_cost,
            worker_count: self.workers.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing view of a [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Identity.
    pub id: SessionId,
    /// The research query.
    pub query: String,
    /// Fast or deep.
    pub mode: Mode,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Fraction of workers finished.
    pub progress: f64,
    /// Total spend including overhead.
    pub total_cost: Usd,
    /// Number of workers.
    pub worker_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

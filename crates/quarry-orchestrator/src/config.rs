use quarry_core::Mode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Research engine limits. Read from the `[research]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Workers allowed in flight at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Upper bound on planned perspectives in deep mode.
    #[serde(default = "default_max_perspectives")]
    pub max_perspectives: usize,
    /// Upper bound on gap-filling rounds.
    #[serde(default = "default_max_gap_iterations")]
    pub max_gap_iterations: u32,
    #[serde(default = "default_max_gaps_per_round")]
    pub max_gaps_per_round: usize,
    /// Gaps below this importance are ignored.
    #[serde(default = "default_min_gap_importance")]
    pub min_gap_importance: f64,
    /// Jaccard similarity between consecutive rounds' gaps that counts as
    /// no progress.
    #[serde(default = "default_gap_similarity_threshold")]
    pub gap_similarity_threshold: f64,
    /// Per-subscriber event buffer.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_workers() -> usize {
    3
}

fn default_max_perspectives() -> usize {
    5
}

fn default_max_gap_iterations() -> u32 {
    3
}

fn default_max_gaps_per_round() -> usize {
    3
}

fn default_min_gap_importance() -> f64 {
    0.5
}

fn default_gap_similarity_threshold() -> f64 {
    0.8
}

fn default_event_buffer() -> usize {
    quarry_core::events::DEFAULT_BUFFER
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_perspectives: default_max_perspectives(),
            max_gap_iterations: default_max_gap_iterations(),
            max_gaps_per_round: default_max_gaps_per_round(),
            min_gap_importance: default_min_gap_importance(),
            gap_similarity_threshold: default_gap_similarity_threshold(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Per-call options for [`ResearchOrchestrator::research`](crate::ResearchOrchestrator::research).
#[derive(Debug, Clone, Default)]
pub struct ResearchOptions {
    pub mode: Mode,
    /// 0 means the configured default.
    pub max_workers: usize,
    /// Cancels the run with reason "timed out" when exceeded.
    pub timeout: Option<Duration>,
}

impl ResearchOptions {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

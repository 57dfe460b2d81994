//! Research orchestration engine.
//!
//! Plans a query into perspectives, runs one worker agent per perspective as
//! a dependency graph with bounded concurrency, analyzes the evidence for
//! gaps and contradictions, dispatches follow-up workers, and synthesizes a
//! cited report. Infrastructure is reached only through the ports defined in
//! `quarry-agent` and `quarry-session`.
//!
//! # Main types
//!
//! - [`ResearchOrchestrator`] - Runs a session end to end and supports cancellation.
//! - [`Planner`] - Turns a query into a [`Plan`].
//! - [`Scheduler`] - Executes a worker graph round.
//! - [`WorkerGraph`] - Arena-backed dependency graph of workers.
//! - [`Analyzer`] / [`GapFillLoop`] - Fact extraction and gap filling.
//! - [`Synthesizer`] - Builds the cited [`Report`](quarry_core::Report).

/// Fact extraction, gap detection and the gap-filling loop.
pub mod analysis;
/// Engine limits and per-run options.
pub mod config;
/// Shared cost accumulator.
pub mod cost;
/// Worker dependency graph.
pub mod dag;
/// Research orchestration engine.
pub mod engine;
/// Query planning.
pub mod planner;
/// Bounded-concurrency graph execution.
pub mod scheduler;
/// Report synthesis.
pub mod synthesizer;

pub use analysis::{
    gap_similarity, Analyzer, DetectionFailure, FactSet, GapAnalysis, GapDetector, GapFillLoop,
    GapFillOutcome, LlmGapDetector, LoopStop,
};
pub use config::{OrchestratorConfig, ResearchOptions};
pub use cost::CostAccumulator;
pub use dag::WorkerGraph;
pub use engine::{ResearchOrchestrator, ResearchResult};
pub use planner::{
    gap_budget, heuristic_complexity, perspectives_for_complexity, Plan, PlanOutcome, Planner,
    GENERAL_PERSPECTIVE,
};
pub use scheduler::{RoundReport, Scheduler, SchedulerError, WorkerResult};
pub use synthesizer::{SynthesisOutcome, Synthesizer, ADDITIONAL_FINDINGS};

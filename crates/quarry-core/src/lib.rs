//! Core types and error definitions for the Quarry research engine.
//!
//! This crate provides the domain model shared across all Quarry crates:
//! sessions, workers, evidence, reports, cost accounting and the progress
//! event bus. Nothing here performs I/O.
//!
//! # Main types
//!
//! - [`QuarryError`] - Unified error enum for all Quarry subsystems.
//! - [`QuarryResult`] - Convenience alias for `Result<T, QuarryError>`.
//! - [`Session`] - One research run from Pending to a terminal status.
//! - [`Worker`] - A unit of research execution bound to an objective.
//! - [`CostBreakdown`] - Token and USD usage with an order-independent sum.
//! - [`EventBus`] - Bounded, non-blocking publish/subscribe.

/// Token and dollar accounting.
pub mod cost;
/// Error taxonomy.
pub mod error;
/// Progress events and the event bus.
pub mod events;
/// Perspectives, sources, facts and gaps.
pub mod evidence;
/// LLM chat messages.
pub mod message;
/// Report, sections and citations.
pub mod report;
/// Session state machine.
pub mod session;
/// Worker nodes.
pub mod worker;

pub use cost::{pricing_for, CostBreakdown, ModelPricing, Usd};
pub use error::{QuarryError, QuarryResult};
pub use events::{
    CostScope, Event, EventBus, EventPayload, EventPublisher, EventSubscriber, EventType,
    Subscription, SubscriptionId, WorkerUpdate,
};
pub use evidence::{
    merge_sources, Contradiction, ContradictionNature, Fact, Gap, GapKind, Perspective, Source,
};
pub use message::{Message, Role, TokenUsage};
pub use report::{Citation, Report, Section};
pub use session::{Mode, Session, SessionId, SessionStatus, SessionSummary};
pub use worker::{ReactStep, ToolCallRecord, Worker, WorkerId, WorkerKind, WorkerStatus};

//! In-process publish/subscribe for progress observation.
//!
//! Publishing never blocks. Every subscriber owns a bounded buffer; when a
//! subscriber falls behind and its buffer is full, the *newest* event is
//! dropped for that subscriber and counted in [`EventBus::dropped_count`].
//! Nothing in the engine depends on whether anyone is listening.

use crate::cost::CostBreakdown;
use crate::evidence::Perspective;
use crate::session::{Mode, SessionId};
use crate::worker::{WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Default per-subscriber buffer size.
pub const DEFAULT_BUFFER: usize = 256;

/// Maximum length of tool result previews carried in events.
pub const PREVIEW_LEN: usize = 200;

/// Event type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// `research.started`
    #[serde(rename = "research.started")]
    ResearchStarted,
    /// `plan.created`
    #[serde(rename = "plan.created")]
    PlanCreated,
    /// `worker.started`
    #[serde(rename = "worker.started")]
    WorkerStarted,
    /// `worker.progress`
    #[serde(rename = "worker.progress")]
    WorkerProgress,
    /// `worker.complete`
    #[serde(rename = "worker.complete")]
    WorkerComplete,
    /// `worker.failed`
    #[serde(rename = "worker.failed")]
    WorkerFailed,
    /// `worker.skipped`
    #[serde(rename = "worker.skipped")]
    WorkerSkipped,
    /// `agent.tool_call`
    #[serde(rename = "agent.tool_call")]
    AgentToolCall,
    /// `agent.tool_result`
    #[serde(rename = "agent.tool_result")]
    AgentToolResult,
    /// `analysis.complete`
    #[serde(rename = "analysis.complete")]
    AnalysisComplete,
    /// `synthesis.started`
    #[serde(rename = "synthesis.started")]
    SynthesisStarted,
    /// `cost.updated`
    #[serde(rename = "cost.updated")]
    CostUpdated,
    /// `research.complete`
    #[serde(rename = "research.complete")]
    ResearchComplete,
    /// `research.failed`
    #[serde(rename = "research.failed")]
    ResearchFailed,
    /// `research.cancelled`
    #[serde(rename = "research.cancelled")]
    ResearchCancelled,
}

impl EventType {
    /// Dotted wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ResearchStarted => "research.started",
            EventType::PlanCreated => "plan.created",
            EventType::WorkerStarted => "worker.started",
            EventType::WorkerProgress => "worker.progress",
            EventType::WorkerComplete => "worker.complete",
            EventType::WorkerFailed => "worker.failed",
            EventType::WorkerSkipped => "worker.skipped",
            EventType::AgentToolCall => "agent.tool_call",
            EventType::AgentToolResult => "agent.tool_result",
            EventType::AnalysisComplete => "analysis.complete",
            EventType::SynthesisStarted => "synthesis.started",
            EventType::CostUpdated => "cost.updated",
            EventType::ResearchComplete => "research.complete",
            EventType::ResearchFailed => "research.failed",
            EventType::ResearchCancelled => "research.cancelled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a worker carried by `worker.*` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerUpdate {
    /// Worker id.
    pub worker_id: WorkerId,
    /// Sequence number.
    pub sequence: u32,
    /// Objective text.
    pub objective: String,
    /// Status at the time of the event.
    pub status: WorkerStatus,
    /// Free-form detail (error text, streamed chunk).
    #[serde(default)]
    pub message: Option<String>,
}

/// What a `cost.updated` event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostScope {
    /// One worker's cost was merged.
    Worker,
    /// Running total of the session's workers.
    Session,
    /// Workers plus orchestration overhead, at the end of a run.
    Total,
}

/// Event body, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    /// A research run began.
    #[serde(rename = "research.started")]
    ResearchStarted {
        /// Query text.
        query: String,
        /// Mode.
        mode: Mode,
    },
    /// The planner produced a plan.
    #[serde(rename = "plan.created")]
    PlanCreated {
        /// Planned perspectives.
        perspectives: Vec<Perspective>,
        /// Number of root workers.
        worker_count: usize,
        /// Complexity score.
        complexity: f64,
    },
    /// A worker was dispatched.
    #[serde(rename = "worker.started")]
    WorkerStarted(WorkerUpdate),
    /// A worker reported intermediate progress.
    #[serde(rename = "worker.progress")]
    WorkerProgress(WorkerUpdate),
    /// A worker finished successfully.
    #[serde(rename = "worker.complete")]
    WorkerComplete(WorkerUpdate),
    /// A worker failed or was cancelled.
    #[serde(rename = "worker.failed")]
    WorkerFailed(WorkerUpdate),
    /// A worker was skipped because a dependency did not complete.
    #[serde(rename = "worker.skipped")]
    WorkerSkipped(WorkerUpdate),
    /// An agent invoked a tool.
    #[serde(rename = "agent.tool_call")]
    AgentToolCall {
        /// Calling worker.
        worker_id: WorkerId,
        /// Tool name.
        tool: String,
        /// Arguments.
        arguments: serde_json::Value,
    },
    /// A tool returned.
    #[serde(rename = "agent.tool_result")]
    AgentToolResult {
        /// Calling worker.
        worker_id: WorkerId,
        /// Tool name.
        tool: String,
        /// Result text truncated to [`PREVIEW_LEN`] characters.
        preview: String,
        /// Whether the call failed.
        is_error: bool,
    },
    /// A gap analysis round finished.
    #[serde(rename = "analysis.complete")]
    AnalysisComplete {
        /// 1-based gap-filling round.
        round: u32,
        /// Number of facts analyzed.
        facts: usize,
        /// Number of new gaps found.
        gaps: usize,
        /// Number of contradictions found.
        contradictions: usize,
    },
    /// Report synthesis began.
    #[serde(rename = "synthesis.started")]
    SynthesisStarted {
        /// Number of completed workers feeding the report.
        completed_workers: usize,
    },
    /// Cost was merged.
    #[serde(rename = "cost.updated")]
    CostUpdated {
        /// What the amount covers.
        scope: CostScope,
        /// The amount.
        cost: CostBreakdown,
    },
    /// The run completed with a report.
    #[serde(rename = "research.complete")]
    ResearchComplete {
        /// Total cost including overhead.
        cost: CostBreakdown,
        /// Number of citations in the report.
        citations: usize,
    },
    /// The run failed.
    #[serde(rename = "research.failed")]
    ResearchFailed {
        /// Error text.
        error: String,
    },
    /// The run was cancelled.
    #[serde(rename = "research.cancelled")]
    ResearchCancelled {
        /// Why.
        reason: String,
    },
}

impl EventPayload {
    /// Type tag of this payload.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::ResearchStarted { .. } => EventType::ResearchStarted,
            EventPayload::PlanCreated { .. } => EventType::PlanCreated,
            EventPayload::WorkerStarted(_) => EventType::WorkerStarted,
            EventPayload::WorkerProgress(_) => EventType::WorkerProgress,
            EventPayload::WorkerComplete(_) => EventType::WorkerComplete,
            EventPayload::WorkerFailed(_) => EventType::WorkerFailed,
            EventPayload::WorkerSkipped(_) => EventType::WorkerSkipped,
            EventPayload::AgentToolCall { .. } => EventType::AgentToolCall,
            EventPayload::AgentToolResult { .. } => EventType::AgentToolResult,
            EventPayload::AnalysisComplete { .. } => EventType::AnalysisComplete,
            EventPayload::SynthesisStarted { .. } => EventType::SynthesisStarted,
            EventPayload::CostUpdated { .. } => EventType::CostUpdated,
            EventPayload::ResearchComplete { .. } => EventType::ResearchComplete,
            EventPayload::ResearchFailed { .. } => EventType::ResearchFailed,
            EventPayload::ResearchCancelled { .. } => EventType::ResearchCancelled,
        }
    }
}

/// A progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Typed body.
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event stamped now.
    pub fn new(session_id: SessionId, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            payload,
        }
    }

    /// Type tag, derived from the payload.
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// Truncates to at most `max` characters on a char boundary, appending "...".
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Producer side of the bus.
pub trait EventPublisher: Send + Sync {
    /// Publishes without blocking. Never fails from the caller's view.
    fn publish(&self, event: Event);
}

/// Consumer side of the bus.
pub trait EventSubscriber: Send + Sync {
    /// Subscribes to the given types; an empty slice means every type.
    fn subscribe(&self, types: &[EventType]) -> Subscription;
    /// Stops delivery to a subscription. Buffered events remain readable.
    fn unsubscribe(&self, id: SubscriptionId);
    /// Stops all delivery. Later publishes are discarded.
    fn close(&self);
}

/// Handle identifying a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A filtered stream of events.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// The id to pass to [`EventSubscriber::unsubscribe`].
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. `None` once unsubscribed or closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Converts into a `Stream`.
    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}

struct Subscriber {
    types: HashSet<EventType>,
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, event_type: EventType) -> bool {
        self.types.is_empty() || self.types.contains(&event_type)
    }
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<SubscriptionId, Subscriber>,
    next_id: u64,
    closed: bool,
}

/// Bounded, non-blocking, in-process event bus.
pub struct EventBus {
    state: RwLock<BusState>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    /// Creates a bus whose subscribers buffer up to `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(BusState::default()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of deliveries dropped because a subscriber buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    /// Whether [`EventSubscriber::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: Event) {
        let event_type = event.event_type();
        let mut gone = Vec::new();
        {
            let state = self.state.read();
            if state.closed {
                return;
            }
            for (id, sub) in &state.subscribers {
                if !sub.wants(event_type) {
                    continue;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(event = %event_type, "Subscriber buffer full, dropping event");
                    }
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }
        if !gone.is_empty() {
            let mut state = self.state.write();
            for id in gone {
                state.subscribers.remove(&id);
            }
        }
    }
}

impl EventSubscriber for EventBus {
    fn subscribe(&self, types: &[EventType]) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state.write();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        if !state.closed {
            state.subscribers.insert(
                id,
                Subscriber {
                    types: types.iter().copied().collect(),
                    tx,
                },
            );
        }
        Subscription { id, rx }
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.write().subscribers.remove(&id);
    }

    fn close(&self) {
        let mut state = self.state.write();
        state.closed = true;
        state.subscribers.clear();
    }
}

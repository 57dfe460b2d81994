#![allow(clippy::unwrap_used, clippy::expect_used)]

use quarry_core::*;
use tokio_stream::StreamExt;

// ---------------------------------------------------------------------------
// 1. Session snapshot roundtrip keeps workers, kinds and exact costs
// ---------------------------------------------------------------------------

#[test]
fn session_snapshot_roundtrip() {
    let mut session = Session::new("How do solid-state batteries work?", Mode::Deep);
    let perspective = Perspective::new(
        "Technical Expert",
        "chemistry",
        vec!["What electrolytes are used?".into()],
    );
    let mut worker = Worker::for_perspective(1, &perspective);
    worker.cost = CostBreakdown::new("openai/gpt-4o-mini", 1200, 340, 0);
    worker.sources.push(Source::new("https://example.org/ssb", "SSB primer"));
    session.cost = worker.cost;
    session.workers.push(worker);
    session.workers.push(Worker::for_gap(
        2,
        1,
        Gap {
            description: "Cost per kWh is missing".into(),
            kind: GapKind::Coverage,
            importance: 0.8,
            suggested_queries: vec!["solid state battery cost per kWh".into()],
            perspective: Some("Technical Expert".into()),
        },
    ));

    let json = serde_json::to_string_pretty(&session).unwrap();
    let restored: Session = serde_json::from_str(&json).unwrap();

    assert_eq!(restored, session);
    assert!(restored.workers[1].kind.is_gap_fill());
    assert_eq!(restored.workers[1].kind.perspective(), Some("Technical Expert"));
    assert_eq!(restored.cost, restored.workers.iter().map(|w| w.cost).sum());
}

// ---------------------------------------------------------------------------
// 2. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let json_err = serde_json::from_str::<Session>("{").unwrap_err();
    let err: QuarryError = json_err.into();
    assert!(matches!(err, QuarryError::Json(_)));
    assert!(err.to_string().starts_with("JSON error"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: QuarryError = io_err.into();
    assert_eq!(err.to_string(), "IO error: missing");

    assert_eq!(
        QuarryError::Planning("no perspectives".into()).to_string(),
        "Planning error: no perspectives"
    );
}

// ---------------------------------------------------------------------------
// 3. Cost sums are identical for every merge order
// ---------------------------------------------------------------------------

#[test]
fn cost_sum_is_order_independent() {
    let costs: Vec<CostBreakdown> = (1..=25u64)
        .map(|i| CostBreakdown::new("anthropic/claude-3.5-sonnet", i * 37, i * 11, 0))
        .collect();
    let expected: CostBreakdown = costs.iter().sum();

    let mut shuffled = costs.clone();
    shuffled.reverse();
    shuffled.rotate_left(7);
    let total: CostBreakdown = shuffled.iter().sum();

    assert_eq!(total, expected);
    assert_eq!(total.total_tokens, total.input_tokens + total.output_tokens);
}

// ---------------------------------------------------------------------------
// 4. Event bus subscription as a stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_bus_subscription_stream() {
    let bus = EventBus::default();
    let sub = bus.subscribe(&[EventType::ResearchComplete, EventType::ResearchFailed]);
    let session_id = SessionId::generate();

    bus.publish(Event::new(
        session_id.clone(),
        EventPayload::ResearchStarted {
            query: "q".into(),
            mode: Mode::Deep,
        },
    ));
    bus.publish(Event::new(
        session_id.clone(),
        EventPayload::ResearchFailed {
            error: "Synthesis error: nothing".into(),
        },
    ));
    bus.close();

    let events: Vec<Event> = sub.into_stream().collect().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type(), EventType::ResearchFailed);
    assert_eq!(events[0].session_id, session_id);
}

// ---------------------------------------------------------------------------
// 5. Worker status is monotonic
// ---------------------------------------------------------------------------

#[test]
fn worker_status_is_monotonic() {
    let p = Perspective::new("Critic", "weaknesses", vec![]);
    for terminal in [
        WorkerStatus::Complete,
        WorkerStatus::Failed,
        WorkerStatus::Cancelled,
    ] {
        let mut w = Worker::for_perspective(1, &p);
        w.transition(WorkerStatus::Running).unwrap();
        w.transition(terminal).unwrap();
        for next in [
            WorkerStatus::Pending,
            WorkerStatus::Running,
            WorkerStatus::Complete,
            WorkerStatus::Skipped,
        ] {
            assert!(w.transition(next).is_err());
        }
        assert_eq!(w.status, terminal);
    }
}

use quarry_core::{
    Citation, Mode, Perspective, QuarryError, Report, Session, SessionId, SessionStatus, Source,
    Worker, WorkerStatus,
};
use quarry_session::{
    FileSessionStore, MarkdownReportWriter, ReportWriter, SessionFilters, SessionRepository,
};

/// Helper: create a FileSessionStore in a temp directory.
async fn temp_store() -> (FileSessionStore, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileSessionStore::new(tmp.path().join("sessions"))
        .await
        .unwrap();
    (store, tmp)
}

fn finished_session(query: &str) -> Session {
    let mut session = Session::new(query, Mode::Deep);
    let mut worker = Worker::for_perspective(1, &Perspective::new("Technical", "internals", vec![]));
    worker.transition(WorkerStatus::Running).unwrap();
    worker.output = "Rust guarantees memory safety.".into();
    worker.sources = vec![Source::new("https://rust-lang.org", "Rust")];
    worker.transition(WorkerStatus::Complete).unwrap();
    session.workers.push(worker);
    session.transition(SessionStatus::Running).unwrap();
    session.report = Some(Report {
        title: format!("Research: {query}"),
        summary: "Memory safety without GC [1].".into(),
        sections: Vec::new(),
        citations: vec![Citation {
            id: 1,
            url: "https://rust-lang.org".into(),
            title: "Rust".into(),
        }],
        contradictions: Vec::new(),
        full_content: String::new(),
        cost: Default::default(),
    });
    session.transition(SessionStatus::Complete).unwrap();
    session
}

#[tokio::test]
async fn test_save_and_load_roundtrip() {
    let (store, _tmp) = temp_store().await;
    let session = finished_session("rust safety");

    store.save(&session).await.unwrap();
    let loaded = store.load(&session.id).await.unwrap();
    assert_eq!(loaded, session);
    assert!(store
        .dir()
        .join(format!("{}.json", session.id))
        .exists());
}

#[tokio::test]
async fn test_load_nonexistent_is_not_found() {
    let (store, _tmp) = temp_store().await;
    let err = store
        .load(&SessionId::from("2020-01-01-deadbeef"))
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::NotFound(_)));
}

#[tokio::test]
async fn test_load_latest_follows_last_save() {
    let (store, _tmp) = temp_store().await;
    assert!(store.load_latest().await.unwrap().is_none());

    let first = Session::new("first", Mode::Fast);
    let second = Session::new("second", Mode::Fast);
    store.save(&first).await.unwrap();
    store.save(&second).await.unwrap();
    assert_eq!(store.load_latest().await.unwrap().unwrap().id, second.id);

    // Re-saving an older session makes it the latest again
    store.save(&first).await.unwrap();
    assert_eq!(store.load_latest().await.unwrap().unwrap().id, first.id);
}

#[tokio::test]
async fn test_delete_session() {
    let (store, _tmp) = temp_store().await;
    let session = Session::new("to delete", Mode::Fast);
    store.save(&session).await.unwrap();

    store.delete(&session.id).await.unwrap();
    assert!(matches!(
        store.load(&session.id).await,
        Err(QuarryError::NotFound(_))
    ));
    assert!(store.load_latest().await.unwrap().is_none());
    assert!(matches!(
        store.delete(&session.id).await,
        Err(QuarryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_skips_corrupt_files_and_filters() {
    let (store, _tmp) = temp_store().await;
    let done = finished_session("rust ownership");
    let pending = Session::new("go channels", Mode::Fast);
    store.save(&done).await.unwrap();
    store.save(&pending).await.unwrap();
    tokio::fs::write(store.dir().join("garbage.json"), "{not json")
        .await
        .unwrap();

    let all = store.list(&SessionFilters::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let complete = store
        .list(&SessionFilters {
            status: Some(SessionStatus::Complete),
            ..SessionFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].id, done.id);
    assert_eq!(complete[0].worker_count, 1);
    assert_eq!(complete[0].progress, 1.0);
}

#[tokio::test]
async fn test_unsupported_version_is_rejected() {
    let (store, _tmp) = temp_store().await;
    let mut session = Session::new("future", Mode::Fast);
    session.version = Session::VERSION + 1;
    store.save(&session).await.unwrap();

    let err = store.load(&session.id).await.unwrap_err();
    assert!(err.to_string().contains("unsupported version"));
}

#[tokio::test]
async fn test_markdown_report_writer() {
    let tmp = tempfile::tempdir().unwrap();
    let writer = MarkdownReportWriter::new(tmp.path().join("reports"));
    let session = finished_session("rust safety");

    writer.write_session(&session).await.unwrap();
    let doc = tokio::fs::read_to_string(writer.path_for(&session))
        .await
        .unwrap();
    assert!(doc.contains("# Research: rust safety"));
    assert!(doc.contains("[1] Rust - https://rust-lang.org"));
    assert!(doc.contains("1. Technical: internals (complete, 1 sources"));
}

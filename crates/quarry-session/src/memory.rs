use crate::report::ReportWriter;
use crate::store::{SessionFilters, SessionRepository};
use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_core::{QuarryError, QuarryResult, Session, SessionId, SessionSummary};
use std::collections::HashMap;

/// In-memory [`SessionRepository`]. Can be told to fail every save, which is
/// how persistence-failure handling is exercised.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    latest: Mutex<Option<SessionId>>,
    saves: Mutex<usize>,
    fail_saves: bool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `save` always returns a persistence error.
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Number of `save` calls, failed ones included.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionStore {
    async fn save(&self, session: &Session) -> QuarryResult<()> {
        *self.saves.lock() += 1;
        if self.fail_saves {
            return Err(QuarryError::Persistence("store unavailable".into()));
        }
        self.sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        *self.latest.lock() = Some(session.id.clone());
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> QuarryResult<Session> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| QuarryError::NotFound(format!("session {id}")))
    }

    async fn load_latest(&self) -> QuarryResult<Option<Session>> {
        let latest = self.latest.lock().clone();
        Ok(latest.and_then(|id| self.sessions.lock().get(&id).cloned()))
    }

    async fn list(&self, filters: &SessionFilters) -> QuarryResult<Vec<SessionSummary>> {
        let summaries = self.sessions.lock().values().map(Session::summary).collect();
        Ok(filters.apply(summaries))
    }

    async fn delete(&self, id: &SessionId) -> QuarryResult<()> {
        self.sessions
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| QuarryError::NotFound(format!("session {id}")))?;
        let mut latest = self.latest.lock();
        if latest.as_ref() == Some(id) {
            *latest = None;
        }
        Ok(())
    }
}

/// In-memory [`ReportWriter`] that keeps the rendered documents.
#[derive(Default)]
pub struct MemoryReportWriter {
    written: Mutex<Vec<(SessionId, String)>>,
}

impl MemoryReportWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<(SessionId, String)> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl ReportWriter for MemoryReportWriter {
    async fn write_session(&self, session: &Session) -> QuarryResult<()> {
        let document = crate::report::render_document(session)?;
        self.written.lock().push((session.id.clone(), document));
        Ok(())
    }
}

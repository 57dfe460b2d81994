use async_trait::async_trait;
use quarry_core::{
    Mode, QuarryError, QuarryResult, Session, SessionId, SessionStatus, SessionSummary,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LAST_POINTER: &str = ".last";

/// Durable storage for session snapshots.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Writes the snapshot, replacing any previous one with the same id, and
    /// marks it as the latest session.
    async fn save(&self, session: &Session) -> QuarryResult<()>;
    /// `QuarryError::NotFound` when no snapshot exists.
    async fn load(&self, id: &SessionId) -> QuarryResult<Session>;
    /// The most recently saved session, if any.
    async fn load_latest(&self) -> QuarryResult<Option<Session>>;
    async fn list(&self, filters: &SessionFilters) -> QuarryResult<Vec<SessionSummary>>;
    /// `QuarryError::NotFound` when no snapshot exists.
    async fn delete(&self, id: &SessionId) -> QuarryResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Created,
    Updated,
    Cost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Listing criteria. The default lists everything, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilters {
    pub status: Option<SessionStatus>,
    pub mode: Option<Mode>,
    /// Case-insensitive substring of the query.
    pub query: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub order: SortOrder,
}

impl SessionFilters {
    fn matches(&self, summary: &SessionSummary) -> bool {
        if self.status.is_some_and(|s| s != summary.status) {
            return false;
        }
        if self.mode.is_some_and(|m| m != summary.mode) {
            return false;
        }
        match &self.query {
            Some(q) if !q.is_empty() => summary.query.to_lowercase().contains(&q.to_lowercase()),
            _ => true,
        }
    }

    fn compare(&self, a: &SessionSummary, b: &SessionSummary) -> Ordering {
        let ord = match self.sort_by {
            SortField::Created => a.created_at.cmp(&b.created_at),
            SortField::Updated => a.updated_at.cmp(&b.updated_at),
            SortField::Cost => a.total_cost.cmp(&b.total_cost),
        }
        .then_with(|| a.id.cmp(&b.id));
        match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }

    /// Filters, sorts and pages `summaries`.
    pub fn apply(&self, summaries: Vec<SessionSummary>) -> Vec<SessionSummary> {
        let mut selected: Vec<SessionSummary> =
            summaries.into_iter().filter(|s| self.matches(s)).collect();
        selected.sort_by(|a, b| self.compare(a, b));
        selected
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// File-based session store: one pretty-printed `<id>.json` per session plus
/// a `.last` file holding the id of the most recent save.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn new(dir: impl Into<PathBuf>) -> QuarryResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence("create session dir", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read(&self, path: &Path) -> QuarryResult<Session> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| persistence("read session", path, e))?;
        let session: Session = serde_json::from_str(&data).map_err(|e| {
            QuarryError::Persistence(format!("Failed to parse session {}: {e}", path.display()))
        })?;
        if session.version > Session::VERSION {
            return Err(QuarryError::Persistence(format!(
                "session {} has unsupported version {}",
                session.id, session.version
            )));
        }
        Ok(session)
    }
}

fn persistence(action: &str, path: &Path, err: std::io::Error) -> QuarryError {
    QuarryError::Persistence(format!("{action} {}: {err}", path.display()))
}

#[async_trait]
impl SessionRepository for FileSessionStore {
    async fn save(&self, session: &Session) -> QuarryResult<()> {
        let path = self.session_path(&session.id);
        let json = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| persistence("write session", &path, e))?;

        let pointer = self.dir.join(LAST_POINTER);
        if let Err(e) = tokio::fs::write(&pointer, session.id.as_str()).await {
            warn!(session_id = %session.id, error = %e, "Failed to update last-session pointer");
        }
        debug!(session_id = %session.id, path = %path.display(), "Session saved");
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> QuarryResult<Session> {
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(QuarryError::NotFound(format!("session {id}")));
        }
        self.read(&path).await
    }

    async fn load_latest(&self) -> QuarryResult<Option<Session>> {
        let pointer = self.dir.join(LAST_POINTER);
        let Ok(raw) = tokio::fs::read_to_string(&pointer).await else {
            return Ok(None);
        };
        let Ok(id) = raw.trim().parse::<SessionId>() else {
            warn!(pointer = %pointer.display(), "Ignoring malformed last-session pointer");
            return Ok(None);
        };
        match self.load(&id).await {
            Ok(session) => Ok(Some(session)),
            Err(QuarryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, filters: &SessionFilters) -> QuarryResult<Vec<SessionSummary>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| persistence("read session dir", &self.dir, e))?;
        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| persistence("read session dir", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(session) => summaries.push(session.summary()),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session"),
            }
        }
        Ok(filters.apply(summaries))
    }

    async fn delete(&self, id: &SessionId) -> QuarryResult<()> {
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(QuarryError::NotFound(format!("session {id}")));
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| persistence("delete session", &path, e))?;

        let pointer = self.dir.join(LAST_POINTER);
        if let Ok(raw) = tokio::fs::read_to_string(&pointer).await {
            if raw.trim() == id.as_str() {
                let _ = tokio::fs::remove_file(&pointer).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use quarry_core::Usd;

    fn summary(query: &str, mode: Mode, status: SessionStatus, age_min: i64, cost: u64) -> SessionSummary {
        let mut session = Session::new(query, mode);
        session.status = status;
        session.created_at = Utc::now() - Duration::minutes(age_min);
        session.updated_at = session.created_at;
        let mut s = session.summary();
        s.total_cost = Usd::from_nanos(cost);
        s
    }

    fn sample() -> Vec<SessionSummary> {
        vec![
            summary("rust async runtimes", Mode::Deep, SessionStatus::Complete, 30, 500),
            summary("Rust ownership", Mode::Fast, SessionStatus::Failed, 20, 100),
            summary("go channels", Mode::Deep, SessionStatus::Complete, 10, 900),
        ]
    }

    #[test]
    fn test_default_is_newest_first() {
        let out = SessionFilters::default().apply(sample());
        let queries: Vec<&str> = out.iter().map(|s| s.query.as_str()).collect();
        assert_eq!(queries, ["go channels", "Rust ownership", "rust async runtimes"]);
    }

    #[test]
    fn test_filters_combine() {
        let filters = SessionFilters {
            query: Some("RUST".into()),
            status: Some(SessionStatus::Complete),
            ..SessionFilters::default()
        };
        let out = filters.apply(sample());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].query, "rust async runtimes");

        let fast = SessionFilters {
            mode: Some(Mode::Fast),
            ..SessionFilters::default()
        };
        assert_eq!(fast.apply(sample()).len(), 1);
    }

    #[test]
    fn test_sort_by_cost_and_paging() {
        let filters = SessionFilters {
            sort_by: SortField::Cost,
            order: SortOrder::Asc,
            offset: 1,
            limit: Some(1),
            ..SessionFilters::default()
        };
        let out = filters.apply(sample());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].total_cost, Usd::from_nanos(500));
    }
}

use async_trait::async_trait;
use quarry_core::{QuarryError, QuarryResult, Session};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;

/// Publishes a finished session as a human-readable document.
#[async_trait]
pub trait ReportWriter: Send + Sync {
    async fn write_session(&self, session: &Session) -> QuarryResult<()>;
}

/// Renders the report document for a session that has a report: a metadata
/// header, the report body and a worker appendix.
pub fn render_document(session: &Session) -> QuarryResult<String> {
    let report = session.report.as_ref().ok_or_else(|| {
        QuarryError::Persistence(format!("session {} has no report", session.id))
    })?;

    let body = if report.full_content.is_empty() {
        report.render_markdown()
    } else {
        report.full_content.clone()
    };

    let total = session.total_cost();
    let mut out = String::new();
    let _ = writeln!(out, "---");
    let _ = writeln!(out, "session_id: {}", session.id);
    let _ = writeln!(out, "query: {:?}", session.query);
    let _ = writeln!(out, "mode: {}", session.mode);
    let _ = writeln!(out, "status: {}", session.status);
    let _ = writeln!(out, "complexity: {:.2}", session.complexity_score);
    let _ = writeln!(out, "total_tokens: {}", total.total_tokens);
    let _ = writeln!(out, "total_cost: {}", total.total_cost);
    let _ = writeln!(out, "created_at: {}", session.created_at.to_rfc3339());
    let _ = writeln!(out, "---\n");
    out.push_str(body.trim_end());
    out.push_str("\n\n## Workers\n\n");
    for w in &session.workers {
        let _ = writeln!(
            out,
            "{}. {} ({}, {} sources, {})",
            w.sequence,
            w.objective,
            w.status,
            w.sources.len(),
            w.cost.total_cost
        );
    }
    Ok(out)
}

/// Writes `<dir>/<session id>.md`.
pub struct MarkdownReportWriter {
    dir: PathBuf,
}

impl MarkdownReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session: &Session) -> PathBuf {
        self.dir.join(format!("{}.md", session.id))
    }
}

#[async_trait]
impl ReportWriter for MarkdownReportWriter {
    async fn write_session(&self, session: &Session) -> QuarryResult<()> {
        let document = render_document(session)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            QuarryError::Persistence(format!("create report dir {}: {e}", self.dir.display()))
        })?;
        let path = self.path_for(session);
        tokio::fs::write(&path, document).await.map_err(|e| {
            QuarryError::Persistence(format!("write report {}: {e}", path.display()))
        })?;
        info!(session_id = %session.id, path = %path.display(), "Report written");
        Ok(())
    }
}

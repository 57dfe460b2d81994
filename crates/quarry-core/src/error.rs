use thiserror::Error;

/// A convenience `Result` alias using [`QuarryError`].
pub type QuarryResult<T> = Result<T, QuarryError>;

/// Top-level error type for the Quarry research engine.
///
/// The first group of variants is the research taxonomy the orchestrator
/// reasons about. The second group is produced by ports and adapters and is
/// wrapped into `Worker` or `Analysis` at the component boundary that calls
/// the port.
#[derive(Error, Debug)]
pub enum QuarryError {
    /// The query could not be turned into a plan. Fatal: no workers run.
    #[error("Planning error: {0}")]
    Planning(String),

    /// A single worker failed. Confined to its DAG branch.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Evidence analysis failed. The gap loop proceeds with partial facts.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// No report could be produced. Fatal.
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Saving a session or report failed. Surfaced as a warning only.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The governing cancellation signal fired (explicit cancel or timeout).
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Why the run was cancelled.
        reason: String,
    },

    /// The LLM provider returned an error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// A tool invocation failed.
    #[error("Tool error: {0}")]
    Tool(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A worker dependency graph was rejected (unknown id, duplicate, cycle).
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A state machine refused a transition.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A session or resource could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    /// Creates a cancellation error with the given reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` for errors that abort a whole research run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Planning(_) | Self::Synthesis(_) | Self::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(QuarryError::Planning("empty".into()).is_fatal());
        assert!(QuarryError::Synthesis("nothing".into()).is_fatal());
        assert!(QuarryError::cancelled("user").is_fatal());
        assert!(!QuarryError::Worker("boom".into()).is_fatal());
        assert!(!QuarryError::Analysis("bad json".into()).is_fatal());
        assert!(!QuarryError::Persistence("disk full".into()).is_fatal());
    }

    #[test]
    fn test_cancelled_display() {
        let err = QuarryError::cancelled("timed out");
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Cancelled: timed out");
    }
}

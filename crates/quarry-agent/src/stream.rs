use serde::{Deserialize, Serialize};

/// Events emitted during a streaming LLM response.
///
/// The ReAct worker forwards text deltas as `worker.progress` events so
/// observers can follow generation in real time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of text content from the assistant.
    TextDelta {
        text: String,
    },

    /// The stream has finished successfully.
    Done,

    /// An error occurred during streaming.
    Error {
        message: String,
    },
}

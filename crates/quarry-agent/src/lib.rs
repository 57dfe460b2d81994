//! Worker-side ports and adapters for the Quarry research engine.
//!
//! - [`LlmBackend`]: chat completions, with an OpenAI-compatible adapter and
//!   a [`FailoverBackend`] that retries across models.
//! - [`ToolExecutor`]: the `search` and `fetch` research tools.
//! - [`WorkerAgent`]: one research worker run, implemented by the ReAct loop
//!   in [`ReactAgent`].
//! - [`mock`]: scripted doubles for all three ports.

pub mod agent;
pub mod backends;
pub mod config;
pub mod context;
pub mod failover;
pub mod mock;
pub mod react;
pub mod stream;
pub mod tools;

pub use agent::{AgentFailure, AgentOutput, AgentResult, WorkerAgent, WorkerAssignment};
pub use backends::{build_backend, LlmBackend, LlmCompletion};
pub use config::{AgentConfig, LlmProvider, ModelConfig, ToolsConfig, DEFAULT_MODEL};
pub use context::ContextWindow;
pub use failover::{FailoverBackend, RetryPolicy};
pub use react::{ParsedToolCall, ReactAgent};
pub use stream::StreamEvent;
pub use tools::{Tool, ToolDescriptor, ToolExecutor, ToolRegistry};

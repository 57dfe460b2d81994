pub mod openai;

use crate::config::ModelConfig;
use crate::failover::{FailoverBackend, RetryPolicy};
use crate::stream::StreamEvent;
use openai::OpenAiBackend;
use quarry_core::{CostBreakdown, Message, QuarryResult, TokenUsage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A finished completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmCompletion {
    /// Assistant text.
    pub content: String,
    /// Provider-reported usage; empty when the provider omitted it.
    pub usage: TokenUsage,
}

impl LlmCompletion {
    /// Creates a completion.
    pub fn new(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            usage,
        }
    }

    /// Prices this completion, estimating usage from text length when the
    /// provider reported none.
    pub fn cost(&self, model_id: &str, prompt: &[Message]) -> CostBreakdown {
        let usage = if self.usage.is_empty() {
            TokenUsage::estimate(prompt, &self.content)
        } else {
            self.usage
        };
        CostBreakdown::for_usage(model_id, usage)
    }
}

/// Trait for LLM provider backends.
///
/// Cancellation is expressed by dropping the returned future; callers wrap
/// calls in `tokio::select!` against their cancellation token.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Model id used for pricing.
    fn model_id(&self) -> &str;

    /// Non-streaming chat completion.
    async fn chat(&self, messages: &[Message]) -> QuarryResult<LlmCompletion>;

    /// Streaming chat completion.
    ///
    /// Returns a receiver for stream events and a join handle that resolves
    /// to the final aggregated completion.
    async fn chat_stream(
        &self,
        messages: &[Message],
    ) -> QuarryResult<(
        mpsc::Receiver<StreamEvent>,
        JoinHandle<QuarryResult<LlmCompletion>>,
    )>;
}

/// Builds the configured backend, wrapping it in a [`FailoverBackend`] when
/// fallback models or a retry policy are configured.
pub fn build_backend(config: &ModelConfig) -> QuarryResult<Arc<dyn LlmBackend>> {
    let primary: Arc<dyn LlmBackend> = Arc::new(OpenAiBackend::new(config.clone())?);
    if config.fallback_models.is_empty() && config.retry_policy.is_none() {
        return Ok(primary);
    }

    let mut backends = vec![primary];
    for fallback in &config.fallback_models {
        backends.push(Arc::new(OpenAiBackend::new(fallback.clone())?));
    }
    let policy = config.retry_policy.clone().unwrap_or_else(RetryPolicy::default);
    Ok(Arc::new(FailoverBackend::new(backends, policy)?))
}

use crate::backends::{LlmBackend, LlmCompletion};
use crate::stream::StreamEvent;
use async_trait::async_trait;
use quarry_core::{Message, QuarryError, QuarryResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configures retry behaviour for failover across LLM backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Determines whether an error is transient and worth retrying.
///
/// Rate limits (429), timeouts and 5xx responses are retried. Transport
/// failures are retried as well. Anything else (400, 401, bad JSON) moves on
/// to the next backend immediately.
pub fn is_retryable(err: &QuarryError) -> bool {
    match err {
        QuarryError::Http(_) => true,
        QuarryError::Llm(msg) => {
            let lower = msg.to_lowercase();
            ["429", "timeout", "500", "502", "503", "504"]
                .iter()
                .any(|p| lower.contains(p))
        }
        _ => false,
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// An `LlmBackend` implementation that wraps multiple backends and performs
/// automatic failover with exponential-backoff retries.
///
/// For each request it tries backends in order. Within each backend it retries
/// up to `max_retries` times for transient (retryable) errors. If all retries
/// on a backend are exhausted, or a non-retryable error is encountered, it
/// moves to the next backend. If every backend fails, the last error is
/// returned.
pub struct FailoverBackend {
    backends: Vec<Arc<dyn LlmBackend>>,
    policy: RetryPolicy,
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl FailoverBackend {
    /// Create a new failover backend with the given backends and retry policy.
    pub fn new(backends: Vec<Arc<dyn LlmBackend>>, policy: RetryPolicy) -> QuarryResult<Self> {
        if backends.is_empty() {
            return Err(QuarryError::Config(
                "failover requires at least one backend".into(),
            ));
        }
        Ok(Self {
            backends,
            policy,
            #[cfg(test)]
            sleep_fn: None,
        })
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    /// Runs `call` against each backend with retries.
    async fn with_failover<'a, T, F, Fut>(&'a self, op: &str, call: F) -> QuarryResult<T>
    where
        F: Fn(&'a Arc<dyn LlmBackend>) -> Fut,
        Fut: std::future::Future<Output = QuarryResult<T>>,
    {
        let mut last_err: Option<QuarryError> = None;

        for (backend_idx, backend) in self.backends.iter().enumerate() {
            for attempt in 0..=self.policy.max_retries {
                match call(backend).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if !is_retryable(&e) {
                            warn!(
                                backend = backend_idx,
                                model = backend.model_id(),
                                attempt,
                                op,
                                error = %e,
                                "Non-retryable error, moving to next backend"
                            );
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = compute_backoff(&self.policy, attempt);
                            info!(
                                backend = backend_idx,
                                attempt,
                                op,
                                delay_ms = delay,
                                error = %e,
                                "Retryable error, backing off"
                            );
                            self.do_sleep(delay).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| QuarryError::Llm("All failover backends exhausted".into())))
    }
}

#[async_trait]
impl LlmBackend for FailoverBackend {
    fn model_id(&self) -> &str {
        self.backends
            .first()
            .map(|b| b.model_id())
            .unwrap_or_default()
    }

    async fn chat(&self, messages: &[Message]) -> QuarryResult<LlmCompletion> {
        self.with_failover("chat", |b| b.chat(messages)).await
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
    ) -> QuarryResult<(
        mpsc::Receiver<StreamEvent>,
        JoinHandle<QuarryResult<LlmCompletion>>,
    )> {
        self.with_failover("chat_stream", |b| b.chat_stream(messages))
            .await
    }
}

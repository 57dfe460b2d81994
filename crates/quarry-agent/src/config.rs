use crate::failover::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Default research model on OpenRouter.
pub const DEFAULT_MODEL: &str = "alibaba/tongyi-deepresearch-30b-a3b";

/// OpenAI-compatible providers the HTTP backend can talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// api.openai.com
    OpenAi,
    /// openrouter.ai, the default.
    #[default]
    OpenRouter,
    /// Groq cloud inference, OpenAI-compatible.
    Groq,
}

/// Connection and sampling settings for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

fn default_model_id() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model_id: default_model_id(),
            api_key: String::new(),
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            fallback_models: Vec::new(),
            retry_policy: None,
        }
    }
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::OpenAi => "https://api.openai.com",
                LlmProvider::OpenRouter => "https://openrouter.ai/api",
                LlmProvider::Groq => "https://api.groq.com/openai",
            }
        }
    }
}

/// Limits for one ReAct worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum reasoning turns before the worker concludes.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Token budget per worker; a wrap-up nudge is sent at 90%.
    #[serde(default = "default_token_budget")]
    pub max_tokens: u64,
    /// Use streaming completions and forward chunks as progress events.
    #[serde(default)]
    pub stream: bool,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_token_budget() -> u64 {
    50_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tokens: default_token_budget(),
            stream: false,
        }
    }
}

/// Settings for the built-in search and fetch tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Brave Search API key. Searches report a tool error when unset.
    #[serde(default)]
    pub brave_api_key: Option<String>,
    /// Override for the Brave endpoint.
    #[serde(default)]
    pub search_url: Option<String>,
    /// Results per search.
    #[serde(default = "default_search_count")]
    pub search_count: u32,
    /// Per-request timeout for both tools.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum characters of page text returned by `fetch`.
    #[serde(default = "default_max_fetch_chars")]
    pub max_fetch_chars: usize,
    /// Lets `fetch` reach loopback and private-network hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

fn default_search_count() -> u32 {
    10
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_fetch_chars() -> usize {
    10_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            brave_api_key: None,
            search_url: None,
            search_count: default_search_count(),
            timeout_secs: default_tool_timeout_secs(),
            max_fetch_chars: default_max_fetch_chars(),
            allow_private_hosts: false,
        }
    }
}

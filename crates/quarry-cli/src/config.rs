//! `quarry.toml` loading with environment overrides.

use quarry_agent::{AgentConfig, ModelConfig, ToolsConfig};
use quarry_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Full binary configuration. Every table is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct QuarryConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub research: OrchestratorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for QuarryConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            research: OrchestratorConfig::default(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl QuarryConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read config file '{}': {e}",
                    path.display()
                ))
            }
        };
        Self::parse(&raw)
    }

    /// Parses TOML text.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies `OPENROUTER_API_KEY`, `BRAVE_API_KEY` and `QUARRY_DATA_DIR`.
    /// Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = get("OPENROUTER_API_KEY") {
            self.model.api_key = key;
        }
        if let Some(key) = get("BRAVE_API_KEY") {
            self.tools.brave_api_key = Some(key);
        }
        if let Some(dir) = get("QUARRY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }
}

use super::{Tool, ToolDescriptor};
use crate::config::ToolsConfig;
use async_trait::async_trait;
use quarry_core::{QuarryError, QuarryResult, Source};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";

/// Web search over the Brave Search API.
///
/// Results are rendered as numbered blocks so the model can read them and
/// [`extract_sources`] can recover the URLs afterwards:
///
/// ```text
/// 1. Title
///    URL: https://example.com
///    Description
/// ```
pub struct SearchTool {
    descriptor: ToolDescriptor,
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
    count: u32,
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: BraveWeb,
}

#[derive(Debug, Default, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

impl SearchTool {
    pub fn new(config: &ToolsConfig) -> QuarryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QuarryError::Http(e.to_string()))?;

        Ok(Self {
            descriptor: ToolDescriptor {
                name: "search".to_string(),
                description: "Search the web for information.".to_string(),
                usage: r#"<tool name="search">{"query": "your search query"}</tool>"#.to_string(),
            },
            client,
            api_key: config.brave_api_key.clone().filter(|k| !k.is_empty()),
            endpoint: config
                .search_url
                .clone()
                .unwrap_or_else(|| BRAVE_SEARCH_URL.to_string()),
            count: config.search_count,
        })
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &serde_json::Value) -> QuarryResult<String> {
        let query = args["query"].as_str().unwrap_or_default().trim();
        if query.is_empty() {
            return Err(QuarryError::Tool(
                "search requires a 'query' argument".into(),
            ));
        }
        let Some(api_key) = &self.api_key else {
            return Err(QuarryError::Tool("search API key not configured".into()));
        };
        let count = args["count"]
            .as_u64()
            .map(|c| c.clamp(1, 20) as u32)
            .unwrap_or(self.count);

        info!(query = %query, count, "Web search");

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query.to_string()), ("count", count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key)
            .send()
            .await
            .map_err(|e| QuarryError::Tool(format!("search request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(QuarryError::Tool(format!(
                "search API error {status}: {body}"
            )));
        }

        let parsed: BraveResponse = resp
            .json()
            .await
            .map_err(|e| QuarryError::Tool(format!("decode search response: {e}")))?;

        if parsed.web.results.is_empty() {
            return Ok("No results found.".to_string());
        }

        let blocks: Vec<String> = parsed
            .web
            .results
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{}. {}\n   URL: {}\n   {}\n",
                    i + 1,
                    r.title,
                    r.url,
                    r.description
                )
            })
            .collect();
        Ok(blocks.join("\n"))
    }
}

/// Recovers sources from rendered search output.
///
/// The line before each `URL:` line carries the numbered title, the line after
/// it the snippet.
pub fn extract_sources(output: &str) -> Vec<Source> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    let mut sources = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(url) = line.strip_prefix("URL:").map(str::trim) else {
            continue;
        };
        if url.is_empty() {
            continue;
        }
        let title = i
            .checked_sub(1)
            .and_then(|j| lines.get(j))
            .map(|t| strip_numbering(t))
            .unwrap_or_default();
        let mut source = Source::new(url, title);
        if let Some(snippet) = lines.get(i + 1).filter(|s| !s.is_empty()) {
            source = source.with_snippet(*snippet);
        }
        sources.push(source);
    }
    sources
}

fn strip_numbering(line: &str) -> &str {
    match line.split_once(". ") {
        Some((n, rest)) if n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty() => rest,
        _ => line,
    }
}

use super::{Tool, ToolDescriptor};
use crate::config::ToolsConfig;
use async_trait::async_trait;
use quarry_core::{QuarryError, QuarryResult};
use regex::Regex;
use std::time::Duration;
use tracing::info;

const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// Fetches a web page and returns its readable text.
pub struct FetchTool {
    descriptor: ToolDescriptor,
    client: reqwest::Client,
    max_chars: usize,
    allow_private_hosts: bool,
    strip: HtmlStripper,
}

impl FetchTool {
    pub fn new(config: &ToolsConfig) -> QuarryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent("Mozilla/5.0 (compatible; QuarryResearchBot/1.0)")
            .build()
            .map_err(|e| QuarryError::Http(e.to_string()))?;

        Ok(Self {
            descriptor: ToolDescriptor {
                name: "fetch".to_string(),
                description: "Fetch content from a URL.".to_string(),
                usage: r#"<tool name="fetch">{"url": "https://..."}</tool>"#.to_string(),
            },
            client,
            max_chars: config.max_fetch_chars,
            allow_private_hosts: config.allow_private_hosts,
            strip: HtmlStripper::new()?,
        })
    }

    fn validate(&self, url: &str) -> QuarryResult<reqwest::Url> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| QuarryError::Tool(format!("Invalid URL '{url}': {e}")))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(QuarryError::Tool(format!(
                    "Unsupported scheme '{scheme}'. Only http/https allowed."
                )))
            }
        }

        if !self.allow_private_hosts {
            if let Some(host) = parsed.host_str() {
                if is_private_host(host) {
                    return Err(QuarryError::Tool(format!(
                        "Access denied: '{host}' resolves to a private/internal address"
                    )));
                }
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &serde_json::Value) -> QuarryResult<String> {
        let url = args["url"].as_str().unwrap_or_default().trim();
        if url.is_empty() {
            return Err(QuarryError::Tool("fetch requires a 'url' argument".into()));
        }
        let parsed = self.validate(url)?;

        info!(url = %url, "HTTP fetch");

        let response = self
            .client
            .get(parsed)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await
            .map_err(|e| QuarryError::Tool(format!("fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QuarryError::Tool(format!(
                "fetch error {} for {url}",
                status.as_u16()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QuarryError::Tool(format!("Failed to read response body: {e}")))?;
        if body.len() > MAX_RESPONSE_SIZE {
            return Err(QuarryError::Tool(format!(
                "Response too large: {} bytes (max: {MAX_RESPONSE_SIZE} bytes)",
                body.len()
            )));
        }

        let text = self.strip.text(&String::from_utf8_lossy(&body));
        Ok(truncate_chars(text, self.max_chars))
    }
}

/// Regex-based HTML to text conversion. Drops script/style/noscript bodies,
/// then tags, then collapses whitespace.
struct HtmlStripper {
    blocks: Regex,
    tags: Regex,
    whitespace: Regex,
}

impl HtmlStripper {
    fn new() -> QuarryResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| QuarryError::Config(format!("regex: {e}")))
        };
        Ok(Self {
            blocks: compile(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)\s*>")?,
            tags: compile(r"(?s)<[^>]*>")?,
            whitespace: compile(r"\s+")?,
        })
    }

    fn text(&self, html: &str) -> String {
        let without_blocks = self.blocks.replace_all(html, " ");
        let without_tags = self.tags.replace_all(&without_blocks, " ");
        let decoded = decode_entities(&without_tags);
        self.whitespace.replace_all(&decoded, " ").trim().to_string()
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn truncate_chars(text: String, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n...[truncated]", &text[..idx]),
        None => text,
    }
}

/// Check if a host resolves to a private/internal network address (SSRF prevention).
fn is_private_host(host: &str) -> bool {
    const PRIVATE_PREFIXES: &[&str] = &[
        "localhost",
        "127.",
        "10.",
        "192.168.",
        "169.254.",
        "0.0.0.0",
        "[::1]",
        "::1",
        "metadata.google",
        "metadata.aws",
    ];

    let host = host.to_lowercase();
    if PRIVATE_PREFIXES.iter().any(|p| host.starts_with(p)) {
        return true;
    }
    // 172.16.0.0/12
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(Ok(octet)) = rest.split('.').next().map(str::parse::<u8>) {
            return (16..=31).contains(&octet);
        }
    }
    false
}

use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::Tool;

/// Fetches a URL and returns its text content.
pub struct WebFetchTool;

#[derive(Deserialize)]
struct WebFetchInput {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

fn invocation_error(message: String) -> StepGraphError {
    StepGraphError::ToolInvocation {
        tool: "web_fetch".to_string(),
        message,
    }
}

impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL. Strips HTML tags and returns plain text, truncated to max_length."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch content from"
                },
                "max_length": {
                    "type": "integer",
                    "description": "Maximum characters to return (default: 30000)"
                }
            },
            "required": ["url"]
        })
    }

    fn is_async(&self) -> bool {
        true
    }

    fn timeout_secs(&self) -> u64 {
        60
    }

    fn invoke_async(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: WebFetchInput = serde_json::from_value(args)
                .map_err(|e| StepGraphError::ToolValidation(e.to_string()))?;

            let max_length = params.max_length.unwrap_or(30_000);

            debug!(url = %params.url, "Fetching URL");

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .user_agent("StepGraph/0.3")
                .build()
                .map_err(|e| invocation_error(format!("Failed to create HTTP client: {}", e)))?;

            let resp = client
                .get(&params.url)
                .send()
                .await
                .map_err(|e| invocation_error(format!("Request failed: {}", e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(invocation_error(format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let body = resp
                .text()
                .await
                .map_err(|e| invocation_error(format!("Failed to read response body: {}", e)))?;

            let text = if content_type.contains("html") {
                strip_html_tags(&body)
            } else {
                body
            };

            Ok(serde_json::Value::String(truncate_chars(text, max_length)))
        })
    }
}

fn truncate_chars(text: String, max_length: usize) -> String {
    match text.char_indices().nth(max_length) {
        Some((cut, _)) => format!("{}\n\n[truncated at {} chars]", &text[..cut], max_length),
        None => text,
    }
}

struct HtmlPatterns {
    script: Regex,
    style: Regex,
    tags: Regex,
    blank_lines: Regex,
}

fn patterns() -> &'static HtmlPatterns {
    static PATTERNS: OnceLock<HtmlPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| HtmlPatterns {
        script: Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid script pattern"),
        style: Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("valid style pattern"),
        tags: Regex::new(r"<[^>]+>").expect("valid tag pattern"),
        blank_lines: Regex::new(r"\n{3,}").expect("valid whitespace pattern"),
    })
}

/// Basic HTML tag stripping using regex.
fn strip_html_tags(html: &str) -> String {
    let p = patterns();
    let cleaned = p.script.replace_all(html, "");
    let cleaned = p.style.replace_all(&cleaned, "");
    let text = p.tags.replace_all(&cleaned, "");

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    let text = p.blank_lines.replace_all(&text, "\n\n");
    text.trim().to_string()
}

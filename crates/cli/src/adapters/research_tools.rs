//! HTTP-backed implementations of the research tools.
//!
//! Search queries a JSON endpoint (SearXNG `results` or the DuckDuckGo
//! Instant Answer shape), fetch is a plain GET, and PDF text comes from the
//! external `pdftotext` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use researchkit_agent::tools::{ResearchTool, SourceEntry, SourceLog, ToolFailure, ToolKind};
use researchkit_core::config::ToolsConfig;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::{debug, warn};

pub fn build_http_client(config: &ToolsConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
    sources: Arc<dyn SourceLog>,
}

impl WebSearchTool {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, sources: Arc<dyn SourceLog>) -> Self {
        Self { client, endpoint: endpoint.into(), sources }
    }
}

#[async_trait]
impl ResearchTool for WebSearchTool {
    fn kind(&self) -> ToolKind {
        ToolKind::WebSearch
    }

    async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolFailure> {
        let query = string_argument(arguments, "query")?;
        let max_results = arguments.get("max_results").and_then(Value::as_u64).unwrap_or(10) as usize;

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(request_failure)?;
        let response = ensure_success(response)?;
        let body: Value = response
            .json()
            .await
            .map_err(|error| ToolFailure::Execution(format!("search response was not JSON: {error}")))?;

        let hits = parse_search_results(&body, max_results);
        debug!(event_name = "tool.web_search", query, hits = hits.len(), "search completed");
        for hit in &hits {
            record(self.sources.as_ref(), &hit.url, Some(hit.title.clone()), ToolKind::WebSearch).await;
        }
        Ok(json!({ "query": query, "results": hits }))
    }
}

pub fn parse_search_results(body: &Value, max_results: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();

    if let Some(results) = body.get("results").and_then(Value::as_array) {
        hits.extend(results.iter().filter_map(|item| {
            let url = item.get("url").and_then(Value::as_str)?;
            Some(SearchHit {
                title: text_field(item, "title"),
                url: url.to_string(),
                snippet: text_field(item, "content"),
            })
        }));
    }

    let abstract_url = body.get("AbstractURL").and_then(Value::as_str).unwrap_or_default();
    if !abstract_url.is_empty() {
        hits.push(SearchHit {
            title: text_field(body, "Heading"),
            url: abstract_url.to_string(),
            snippet: text_field(body, "AbstractText"),
        });
    }
    if let Some(topics) = body.get("RelatedTopics").and_then(Value::as_array) {
        collect_topics(topics, &mut hits);
    }

    hits.retain(|hit| !hit.url.is_empty());
    hits.truncate(max_results);
    hits
}

/// DuckDuckGo nests grouped topics one level down under `Topics`.
fn collect_topics(topics: &[Value], hits: &mut Vec<SearchHit>) {
    for topic in topics {
        if let Some(nested) = topic.get("Topics").and_then(Value::as_array) {
            collect_topics(nested, hits);
            continue;
        }
        let Some(url) = topic.get("FirstURL").and_then(Value::as_str) else {
            continue;
        };
        let text = text_field(topic, "Text");
        hits.push(SearchHit {
            title: text.chars().take(80).collect(),
            url: url.to_string(),
            snippet: text,
        });
    }
}

fn text_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

pub struct FetchUrlTool {
    client: reqwest::Client,
    max_chars: usize,
    sources: Arc<dyn SourceLog>,
}

impl FetchUrlTool {
    pub fn new(client: reqwest::Client, max_chars: usize, sources: Arc<dyn SourceLog>) -> Self {
        Self { client, max_chars, sources }
    }
}

#[async_trait]
impl ResearchTool for FetchUrlTool {
    fn kind(&self) -> ToolKind {
        ToolKind::FetchUrl
    }

    async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolFailure> {
        let url = string_argument(arguments, "url")?;
        let extract_text = arguments.get("extract_text").and_then(Value::as_bool).unwrap_or(true);

        let response = self.client.get(url).send().await.map_err(request_failure)?;
        let response = ensure_success(response)?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response
            .text()
            .await
            .map_err(|error| ToolFailure::Execution(format!("could not read response body: {error}")))?;

        let is_html = content_type.contains("text/html") || content_type.contains("application/xhtml");
        let content = if extract_text && is_html { html2md::parse_html(&body) } else { body };
        let (content, truncated) = truncate_chars(&content, self.max_chars);

        record(self.sources.as_ref(), url, None, ToolKind::FetchUrl).await;
        Ok(json!({
            "url": url,
            "content_type": content_type,
            "content": content,
            "truncated": truncated,
        }))
    }
}

pub struct ParsePdfTool {
    client: reqwest::Client,
    pdftotext: String,
    max_chars: usize,
    save_dir: PathBuf,
    sources: Arc<dyn SourceLog>,
}

impl ParsePdfTool {
    /// `save_path` arguments are resolved under `save_dir`.
    pub fn new(
        client: reqwest::Client,
        pdftotext: impl Into<String>,
        max_chars: usize,
        save_dir: PathBuf,
        sources: Arc<dyn SourceLog>,
    ) -> Self {
        Self { client, pdftotext: pdftotext.into(), max_chars, save_dir, sources }
    }

    async fn extract(&self, pdf: &std::path::Path) -> Result<String, ToolFailure> {
        let output = Command::new(&self.pdftotext)
            .arg("-layout")
            .arg(pdf)
            .arg("-")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => {
                    ToolFailure::Unavailable(format!("`{}` is not installed", self.pdftotext))
                }
                _ => ToolFailure::Execution(format!("could not run `{}`: {error}", self.pdftotext)),
            })?;
        if !output.status.success() {
            return Err(ToolFailure::Execution(format!(
                "`{}` failed: {}",
                self.pdftotext,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ResearchTool for ParsePdfTool {
    fn kind(&self) -> ToolKind {
        ToolKind::ParsePdf
    }

    async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolFailure> {
        let url = string_argument(arguments, "url")?;
        let response = self.client.get(url).send().await.map_err(request_failure)?;
        let response = ensure_success(response)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ToolFailure::Execution(format!("could not download PDF: {error}")))?;

        let scratch = tempfile::Builder::new()
            .prefix("researchkit-")
            .suffix(".pdf")
            .tempfile()
            .map_err(|error| ToolFailure::Execution(format!("could not create temp file: {error}")))?;
        tokio::fs::write(scratch.path(), &bytes)
            .await
            .map_err(|error| ToolFailure::Execution(format!("could not stage PDF: {error}")))?;

        let text = self.extract(scratch.path()).await?;
        let (text, truncated) = truncate_chars(&text, self.max_chars);

        let saved_to = match arguments.get("save_path").and_then(Value::as_str) {
            Some(relative) => {
                let target = self.save_dir.join(relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|error| ToolFailure::Execution(format!("could not save PDF: {error}")))?;
                }
                tokio::fs::write(&target, &bytes)
                    .await
                    .map_err(|error| ToolFailure::Execution(format!("could not save PDF: {error}")))?;
                Some(target.display().to_string())
            }
            None => None,
        };

        record(self.sources.as_ref(), url, None, ToolKind::ParsePdf).await;
        Ok(json!({
            "url": url,
            "text": text,
            "truncated": truncated,
            "saved_to": saved_to,
        }))
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (format!("{}\n\n... (content truncated)", &text[..cut]), true),
        None => (text.to_string(), false),
    }
}

fn string_argument<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolFailure> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ToolFailure::InvalidArguments(format!("`{key}` is required")))
}

fn request_failure(error: reqwest::Error) -> ToolFailure {
    if error.is_timeout() || error.is_connect() {
        ToolFailure::Unavailable(format!("request failed: {error}"))
    } else {
        ToolFailure::Execution(format!("request failed: {error}"))
    }
}

fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ToolFailure> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ToolFailure::Execution(format!(
            "HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("error")
        )))
    }
}

async fn record(sources: &dyn SourceLog, url: &str, title: Option<String>, via: ToolKind) {
    if let Err(error) = sources.record(SourceEntry::new(url, title, via)).await {
        warn!(event_name = "sources.write_failed", url, error = %error, "could not record source");
    }
}

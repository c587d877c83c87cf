use crate::error::{Result, ToolError};
use crate::traits::{RiskLevel, Tool, ToolSpec, require_string};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const DUCKDUCKGO_ENDPOINT: &str = "https://api.duckduckgo.com/";
const MAX_RESULTS: usize = 3;

static HTML_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]+>").ok());

/// Web lookup used when the model proposes a `search <query>` step.
///
/// Never fails: transport problems come back as `Search failed: ...` text.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

/// DuckDuckGo Instant Answer API.
pub struct DuckDuckGoSearch {
    http: reqwest::Client,
    endpoint: String,
}

impl DuckDuckGoSearch {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(DUCKDUCKGO_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("guardian/0.1")
            .build()
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    async fn fetch(&self, query: &str) -> std::result::Result<Vec<SearchEntry>, reqwest::Error> {
        let resp: InstantAnswer = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.entries())
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    #[tracing::instrument(level = "info", skip(self))]
    async fn search(&self, query: &str) -> String {
        match self.fetch(query).await {
            Ok(entries) => format_results(&entries),
            Err(e) => {
                tracing::warn!(error = %e, "web search failed");
                format!("Search failed: {e}")
            }
        }
    }
}

/// Numbered markdown list of at most three entries.
pub fn format_results(entries: &[SearchEntry]) -> String {
    if entries.is_empty() {
        return "No results found.".to_string();
    }
    entries
        .iter()
        .take(MAX_RESULTS)
        .enumerate()
        .map(|(i, e)| format!("{}. [{}]({}): {}", i + 1, e.title, e.link, e.snippet))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelatedTopic {
    Entry {
        #[serde(rename = "Text")]
        text: String,
        #[serde(rename = "FirstURL")]
        first_url: String,
    },
    Group {
        #[serde(rename = "Topics")]
        topics: Vec<RelatedTopic>,
    },
}

impl InstantAnswer {
    fn entries(self) -> Vec<SearchEntry> {
        let mut out = Vec::new();
        if !self.abstract_text.trim().is_empty() {
            out.push(SearchEntry {
                title: self.heading.trim().to_string(),
                snippet: strip_tags(&self.abstract_text),
                link: self.abstract_url,
            });
        }
        collect_topics(self.related_topics, &mut out);
        out.truncate(MAX_RESULTS);
        out
    }
}

fn collect_topics(topics: Vec<RelatedTopic>, out: &mut Vec<SearchEntry>) {
    for topic in topics {
        if out.len() >= MAX_RESULTS {
            return;
        }
        match topic {
            RelatedTopic::Entry { text, first_url } => {
                let text = strip_tags(&text);
                let (title, snippet) = match text.split_once(" - ") {
                    Some((t, s)) => (t.trim().to_string(), s.trim().to_string()),
                    None => (text.chars().take(60).collect(), text.clone()),
                };
                out.push(SearchEntry {
                    title,
                    snippet,
                    link: first_url,
                });
            }
            RelatedTopic::Group { topics } => collect_topics(topics, out),
        }
    }
}

fn strip_tags(s: &str) -> String {
    match HTML_TAG.as_ref() {
        Some(re) => re.replace_all(s, "").trim().to_string(),
        None => s.trim().to_string(),
    }
}

/// Chat-facing wrapper around a [`WebSearch`] backend.
pub struct WebSearchTool {
    backend: Arc<dyn WebSearch>,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn WebSearch>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_search".to_string(),
            description: "Search the internet for error messages, documentation or fixes."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to search for"}
                },
                "required": ["query"]
            }),
            risk_level: RiskLevel::Low,
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let query = require_string(&arguments, "query")?;
        if query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".to_string()));
        }
        let results = self.backend.search(query.trim()).await;
        Ok(serde_json::json!({ "query": query.trim(), "results": results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_results_render_placeholder() {
        assert_eq!(format_results(&[]), "No results found.");
    }

    #[test]
    fn instant_answer_is_flattened_to_three_entries() {
        let raw = r#"{
            "Heading": "Nginx",
            "AbstractText": "Nginx is a <b>web server</b>.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Nginx",
            "RelatedTopics": [
                {"Text": "Nginx Unit - An application server", "FirstURL": "https://duckduckgo.com/Nginx_Unit"},
                {"Name": "See also", "Topics": [
                    {"Text": "OpenResty - A web platform", "FirstURL": "https://duckduckgo.com/OpenResty"},
                    {"Text": "Apache - Another server", "FirstURL": "https://duckduckgo.com/Apache"}
                ]}
            ]
        }"#;
        let answer: InstantAnswer = serde_json::from_str(raw).expect("parse answer");
        let entries = answer.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].snippet, "Nginx is a web server.");
        assert_eq!(entries[2].title, "OpenResty");

        let text = format_results(&entries);
        assert!(text.starts_with("1. [Nginx](https://en.wikipedia.org/wiki/Nginx): Nginx is a web server."));
        assert_eq!(text.lines().count(), 3);
    }

    struct Canned;

    #[async_trait]
    impl WebSearch for Canned {
        async fn search(&self, query: &str) -> String {
            format!("results for {query}")
        }
    }

    #[tokio::test]
    async fn tool_trims_query_and_rejects_blank() {
        let tool = WebSearchTool::new(Arc::new(Canned));
        let out = tool
            .execute(serde_json::json!({"query": "  oom killer "}))
            .await
            .expect("search runs");
        assert_eq!(out["results"], "results for oom killer");
        assert!(tool.execute(serde_json::json!({"query": " "})).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_search_failed() {
        let s = DuckDuckGoSearch::with_endpoint("http://127.0.0.1:1/").expect("client");
        assert!(s.search("anything").await.starts_with("Search failed:"));
    }
}

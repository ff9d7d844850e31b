// `search` — stateless, `config_key = "websearch"`.
//
// Demonstrates the stateless harness's business-error path: an empty query
// raises `no-results-found` rather than succeeding with an empty list.

use std::sync::RwLock;

use serde_json::{json, Value};

use crate::backend::stateless::StatelessTool;
use crate::error::{ErrorKind, ToolError};

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct WebSearchConfig {
    api_key: Option<String>,
}

#[derive(Default)]
pub struct WebSearchTool {
    config: RwLock<WebSearchConfig>,
}

#[async_trait::async_trait]
impl StatelessTool for WebSearchTool {
    fn config_key(&self) -> Option<&str> {
        Some("websearch")
    }

    fn set_config(&self, config: Value) {
        let parsed: WebSearchConfig = serde_json::from_value(config).unwrap_or_default();
        *self.config.write().expect("websearch config lock poisoned") = parsed;
    }

    async fn call(&self, params: Value) -> Result<Value, ToolError> {
        let query = params.get("query").and_then(Value::as_str).unwrap_or("").trim().to_string();
        if query.is_empty() {
            return Err(ToolError::new(ErrorKind::NoResultsFound, "no results found for empty query"));
        }
        if self.config.read().expect("websearch config lock poisoned").api_key.is_none() {
            tracing::debug!("websearch: no api_key configured, serving canned results");
        }

        let results: Vec<Value> = (1..=3)
            .map(|i| {
                json!({
                    "title": format!("{query} — result {i}"),
                    "url": format!("https://example.invalid/{}/{}", urlencode(&query), i),
                    "snippet": format!("A canned snippet about {query}."),
                })
            })
            .collect();

        Ok(json!({ "query": query, "results": results }))
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_string() } else { "-".to_string() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_query_is_no_results_found() {
        let tool = WebSearchTool::default();
        let err = tool.call(json!({"query": "  "})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoResultsFound);
    }

    #[tokio::test]
    async fn nonempty_query_returns_canned_results() {
        let tool = WebSearchTool::default();
        let data = tool.call(json!({"query": "hello"})).await.unwrap();
        assert_eq!(data["results"].as_array().unwrap().len(), 3);
    }
}

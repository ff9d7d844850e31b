// `fetch` — stateless, `config_key = "fetch"`.
//
// Validates an http(s) URL shape and returns a stub document. Demonstrates
// `invalid-url-format` rather than attempting a real network fetch — the
// concrete fetch mechanism is out of scope here.

use serde_json::{json, Value};

use crate::backend::stateless::StatelessTool;
use crate::error::{ErrorKind, ToolError};

#[derive(Default)]
pub struct FetchTool;

fn looks_like_http_url(url: &str) -> bool {
    (url.starts_with("http://") || url.starts_with("https://")) && url.len() > "https://".len()
}

#[async_trait::async_trait]
impl StatelessTool for FetchTool {
    fn config_key(&self) -> Option<&str> {
        Some("fetch")
    }

    async fn call(&self, params: Value) -> Result<Value, ToolError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new(ErrorKind::MissingRequiredField, "missing required field: url"))?;

        if !looks_like_http_url(url) {
            return Err(ToolError::new(ErrorKind::InvalidUrlFormat, format!("invalid URL format: {url}"))
                .with_data(json!({ "url": url })));
        }

        Ok(json!({
            "url": url,
            "title": "Stub document",
            "content": format!("Stub content fetched from {url}."),
            "status": 200,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_url() {
        let tool = FetchTool;
        let err = tool.call(json!({"url": "ftp://example.invalid"})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidUrlFormat);
    }

    #[tokio::test]
    async fn missing_url_is_missing_required_field() {
        let tool = FetchTool;
        let err = tool.call(json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingRequiredField);
    }

    #[tokio::test]
    async fn accepts_well_formed_url() {
        let tool = FetchTool;
        let data = tool.call(json!({"url": "https://example.invalid/a"})).await.unwrap();
        assert_eq!(data["status"], 200);
    }
}

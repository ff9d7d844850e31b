// `doc_search` — stateless, `config_key = "docsearch"`.
//
// Demonstrates the stateless harness's generic-exception-to-`execution-error`
// path: `chunk_size` is used unchecked to stripe a canned corpus, so a
// caller-supplied `0` divides by zero inside `call` and the harness's
// `catch_unwind` converts the resulting panic into a generic `execution-error`
// rather than letting it escape.

use serde_json::{json, Value};

use crate::backend::stateless::StatelessTool;
use crate::error::{ErrorKind, ToolError};

const CANNED_CORPUS: &[&str] = &[
    "quarterly-report.pdf: revenue grew 12% year over year",
    "onboarding-guide.pdf: set up your workstation in five steps",
    "incident-2024-03.pdf: root cause was a misconfigured retry policy",
];

#[derive(Default)]
pub struct DocSearchTool;

#[async_trait::async_trait]
impl StatelessTool for DocSearchTool {
    fn config_key(&self) -> Option<&str> {
        Some("docsearch")
    }

    async fn call(&self, params: Value) -> Result<Value, ToolError> {
        let query = params.get("query").and_then(Value::as_str).unwrap_or("").to_lowercase();
        let chunk_size = params.get("chunk_size").and_then(Value::as_u64).unwrap_or(1) as usize;

        let matches: Vec<&str> = CANNED_CORPUS
            .iter()
            .enumerate()
            // Unchecked by design: `chunk_size == 0` panics here and the
            // stateless harness converts it to `execution-error`.
            .filter(|(i, _)| i % chunk_size == 0)
            .filter(|(_, doc)| query.is_empty() || doc.to_lowercase().contains(&query))
            .map(|(_, doc)| *doc)
            .collect();

        if matches.is_empty() {
            return Err(ToolError::new(ErrorKind::NoResultsFound, "no documents matched"));
        }
        Ok(json!({ "query": query, "matches": matches }))
    }
}

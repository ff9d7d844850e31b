// `rag:search`, `rag:index` — session-backed, resource type `rag`.
//
// A small in-memory inverted index guarded by the session's `data`.
// `initialize` is cheap and synchronous-feeling (no external dependency to
// warm), but still goes through the full lifecycle contract so sessions of
// this resource type are typically long-lived rather than ephemeral —
// unlike `vm`, nothing forces callers to destroy the session after one
// call.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::backend::Backend;
use crate::error::{ErrorKind, ServiceError, ToolError};
use crate::registry::{fn_tool, ContextNeeds, RegistrationError, ToolRegistry};

pub struct RagBackend;

impl RagBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RagBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for RagBackend {
    fn name(&self) -> &str {
        "rag"
    }

    fn description(&self) -> &str {
        "In-memory document index (toy retrieval backend)"
    }

    async fn initialize(&self, _worker_id: &str, _config: &Value) -> Result<Value, ServiceError> {
        Ok(json!({ "docs": {} }))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn score(query_tokens: &[String], doc: &str) -> u32 {
    let doc_tokens = tokenize(doc);
    query_tokens.iter().filter(|q| doc_tokens.contains(q)).count() as u32
}

impl RagBackend {
    pub fn register_tools(self: &std::sync::Arc<Self>, reg: &mut ToolRegistry) -> Result<(), RegistrationError> {
        reg.register(
            "rag:index",
            None,
            "Add a document to the session's in-memory index",
            ContextNeeds::SESSION_TOOL,
            fn_tool(|params, ctx| async move {
                let session = ctx
                    .session_info
                    .ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::new(ErrorKind::MissingRequiredField, "missing required field: id"))?
                    .to_string();
                let text = params
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::new(ErrorKind::MissingRequiredField, "missing required field: text"))?
                    .to_string();

                let mut state = session.state.write().await;
                let docs = state
                    .data
                    .get_mut("docs")
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                docs.insert(id.clone(), Value::String(text));
                Ok(json!({ "indexed": true, "id": id, "count": docs.len() }))
            }),
        )?;

        reg.register(
            "rag:search",
            None,
            "Search the session's in-memory index",
            ContextNeeds::SESSION_TOOL,
            fn_tool(|params, ctx| async move {
                let session = ctx
                    .session_info
                    .ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                let query = params.get("query").and_then(Value::as_str).unwrap_or("").to_string();
                if query.trim().is_empty() {
                    return Err(ToolError::new(ErrorKind::InvalidInput, "query must not be empty"));
                }
                let query_tokens = tokenize(&query);

                let state = session.state.read().await;
                let docs = state
                    .data
                    .get("docs")
                    .and_then(Value::as_object)
                    .ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;

                let mut scored: Vec<(String, u32)> = docs
                    .iter()
                    .map(|(id, text)| (id.clone(), score(&query_tokens, text.as_str().unwrap_or(""))))
                    .filter(|(_, s)| *s > 0)
                    .collect();
                scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

                if scored.is_empty() {
                    return Err(ToolError::from_kind(ErrorKind::NoResultsFound));
                }

                let matches: Vec<Value> = scored
                    .into_iter()
                    .map(|(id, s)| json!({ "id": id, "score": s }))
                    .collect();
                Ok(json!({ "query": query, "matches": matches }))
            }),
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::dispatch::{DispatchRequest, Dispatcher};
    use crate::session::SessionRouter;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        let backend = Arc::new(RagBackend::new());
        backend.register_tools(&mut registry).unwrap();
        let mut backends = BackendRegistry::new();
        backends.register(backend);
        Dispatcher::new(Arc::new(registry), Arc::new(backends), Arc::new(SessionRouter::new(Duration::from_secs(60))))
    }

    fn request(action: &str, params: Value) -> DispatchRequest {
        DispatchRequest {
            worker_id: "w1".to_string(),
            action: action.to_string(),
            params,
            timeout: None,
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn index_then_search_finds_the_document() {
        let dispatcher = make_dispatcher();
        dispatcher
            .sessions()
            .get_or_create("w1", "rag", dispatcher.backends(), None, None, false)
            .await;

        let envelope = dispatcher
            .dispatch(request("rag:index", json!({"id": "doc1", "text": "rust is a systems language"})))
            .await;
        assert!(envelope.is_success());

        let envelope = dispatcher.dispatch(request("rag:search", json!({"query": "rust systems"}))).await;
        assert!(envelope.is_success());
        assert_eq!(envelope.data["matches"][0]["id"], "doc1");
    }

    #[tokio::test]
    async fn search_with_no_matches_is_no_results_found() {
        let dispatcher = make_dispatcher();
        dispatcher
            .sessions()
            .get_or_create("w1", "rag", dispatcher.backends(), None, None, false)
            .await;
        let envelope = dispatcher.dispatch(request("rag:search", json!({"query": "nonexistent"}))).await;
        assert_eq!(envelope.code, ErrorKind::NoResultsFound.code());
    }
}

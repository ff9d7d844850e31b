// Reference tool bodies.
//
// Thin implementations that give the dispatcher/registry/session harness
// something real to invoke. A tool's content never matters here — only the
// shape of its inputs, outputs, and failure modes — so these are
// intentionally small: canned search results, a stub fetch, a tiny
// in-memory inverted index, an in-memory key-table "SQL" reader.

pub mod docsearch;
pub mod fetch;
pub mod rag;
pub mod sql;
pub mod websearch;

use std::sync::Arc;

use crate::backend::stateless::StatelessTool;
use crate::backend::BackendRegistry;
use crate::config::ServerConfig;
use crate::registry::{fn_tool, ContextNeeds, ToolRegistry};

/// Wraps a `StatelessTool` into a registry entry. The `config_key` section
/// of `[apis]` is injected once, before registration.
fn register_stateless(
    reg: &mut ToolRegistry,
    name: &str,
    description: &str,
    tool: Arc<dyn StatelessTool>,
    config: &ServerConfig,
) -> Result<(), crate::registry::RegistrationError> {
    if let Some(key) = tool.config_key() {
        tool.set_config(config.api_config(key));
    }
    reg.register(
        name,
        None,
        description,
        ContextNeeds::NONE,
        fn_tool(move |params, _ctx| {
            let tool = Arc::clone(&tool);
            async move { crate::backend::stateless::run_stateless(tool.as_ref(), params).await }
        }),
    )
}

/// Registers every reference tool and backend this service ships with.
/// Resource-typed backends are registered into `backends` as well as
/// `registry` so the dispatcher's warmup/session machinery applies to them
/// exactly like it would to any operator-supplied backend.
pub fn register_reference_tools(
    registry: &mut ToolRegistry,
    backends: &mut BackendRegistry,
    config: &ServerConfig,
) -> Result<(), crate::registry::RegistrationError> {
    register_stateless(
        registry,
        "search",
        "Web search over a canned result set",
        Arc::new(websearch::WebSearchTool::default()),
        config,
    )?;
    register_stateless(
        registry,
        "fetch",
        "Fetch a page by URL",
        Arc::new(fetch::FetchTool::default()),
        config,
    )?;
    // Bare name, not `doc:search` — a genuinely stateless tool never gets a
    // resource-type prefix, which is exactly what keeps it out of the
    // session router entirely.
    register_stateless(
        registry,
        "doc_search",
        "Search OCR'd documents",
        Arc::new(docsearch::DocSearchTool::default()),
        config,
    )?;

    if config.resource_enabled("rag") {
        let rag = Arc::new(rag::RagBackend::new());
        rag.register_tools(registry)?;
        backends.register(rag);
    }

    // `sql` deliberately has no registered `Backend` — see sql.rs's module
    // doc for why that's the point, not an oversight.
    if config.resource_enabled("sql") {
        let sql = Arc::new(sql::SqlBackend::new());
        sql.register_tools(registry)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_resource_is_not_registered() {
        let doc = r#"
            [resources.rag]
            enabled = false
        "#;
        let config = ServerConfig::parse(doc).unwrap();
        let mut registry = ToolRegistry::new();
        let mut backends = BackendRegistry::new();
        register_reference_tools(&mut registry, &mut backends, &config).unwrap();

        assert!(registry.resolve("rag:search").is_err());
        assert!(backends.get("rag").is_none());
        // An unrelated resource stays enabled by default.
        assert!(registry.resolve("sql:query").is_ok());
    }

    #[test]
    fn unconfigured_resources_default_to_enabled() {
        let config = ServerConfig::default();
        let mut registry = ToolRegistry::new();
        let mut backends = BackendRegistry::new();
        register_reference_tools(&mut registry, &mut backends, &config).unwrap();

        assert!(registry.resolve("rag:search").is_ok());
        assert!(registry.resolve("sql:query").is_ok());
    }
}

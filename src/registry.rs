// Tool registry and name resolution.
//
// Three maps: canonical name -> invocable, simple name -> candidate
// canonical names, and canonical name -> resource type. Each tool declares
// an explicit capability set (`ContextNeeds`) at registration time instead
// of the dispatcher inspecting a call signature, and tool bodies are plain
// two-armed `Result` functions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ErrorKind, ToolError};
use crate::session::Session;

/// Bitmask of which injected-context slots a tool's signature actually
/// uses. The dispatcher fills only the declared slots, in place of
/// inspecting the callable's signature at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextNeeds(u8);

impl ContextNeeds {
    pub const NONE: Self = Self(0);
    pub const WORKER_ID: Self = Self(1 << 0);
    pub const TRACE_ID: Self = Self(1 << 1);
    pub const SESSION_ID: Self = Self(1 << 2);
    pub const SESSION_INFO: Self = Self(1 << 3);
    /// Convenience bundle for the common session-backed-tool case.
    pub const SESSION_TOOL: Self = Self(Self::SESSION_ID.0 | Self::SESSION_INFO.0 | Self::WORKER_ID.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ContextNeeds {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ContextNeeds {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Runtime context the dispatcher injects into a tool call. Fields the
/// tool's declared `ContextNeeds` doesn't request are left `None` even if
/// the dispatcher had a value available, mirroring "inject only if the
/// signature names it" from the source.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub worker_id: Option<String>,
    pub trace_id: Option<String>,
    pub session_id: Option<String>,
    pub session_info: Option<Arc<Session>>,
}

/// A tool invocable: `(params, injected-context) -> Result<data, ToolError>`.
#[async_trait]
pub trait ToolFn: Send + Sync {
    async fn call(&self, params: Value, ctx: ToolContext) -> Result<Value, ToolError>;
}

/// Adapts a plain async closure into a `ToolFn` trait object.
pub struct FnTool<F> {
    f: F,
}

impl<F> FnTool<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ToolFn for FnTool<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, params: Value, ctx: ToolContext) -> Result<Value, ToolError> {
        (self.f)(params, ctx).await
    }
}

pub fn fn_tool<F, Fut>(f: F) -> Arc<dyn ToolFn>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnTool::new(f))
}

#[derive(Clone)]
pub struct ToolEntry {
    pub canonical_name: String,
    pub resource_type: Option<String>,
    pub description: String,
    pub needs: ContextNeeds,
    pub func: Arc<dyn ToolFn>,
}

pub struct ResolvedTool {
    pub canonical_name: String,
    pub simple_name: String,
    pub resource_type: Option<String>,
}

/// Error used only at registration time — distinct from the tool-facing
/// `ToolError` taxonomy because it is a startup-time programming mistake,
/// never a runtime envelope.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("resource type mismatch for '{name}': name implies '{from_name}', caller passed '{from_arg}'")]
    ResourceTypeMismatch {
        name: String,
        from_name: String,
        from_arg: String,
    },
    #[error("tool '{0}' already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
    simple_index: HashMap<String, Vec<String>>,
    resource_types: HashMap<String, Option<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `(name, func, resource_type?)`.
    ///
    /// If `name` contains `:`, it's split into `resource_type/simple_name`;
    /// an explicitly passed `resource_type` must agree or be absent. If
    /// `name` has no `:`, the canonical name is `name` itself and
    /// `resource_type` (if any) comes from the argument.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        resource_type: Option<&str>,
        description: impl Into<String>,
        needs: ContextNeeds,
        func: Arc<dyn ToolFn>,
    ) -> Result<(), RegistrationError> {
        let name = name.into();
        let (canonical_name, resolved_resource_type) = if let Some((prefix, _rest)) = name.split_once(':') {
            if let Some(arg_type) = resource_type {
                if arg_type != prefix {
                    return Err(RegistrationError::ResourceTypeMismatch {
                        name,
                        from_name: prefix.to_string(),
                        from_arg: arg_type.to_string(),
                    });
                }
            }
            (name.clone(), Some(prefix.to_string()))
        } else {
            (name.clone(), resource_type.map(|s| s.to_string()))
        };

        if self.tools.contains_key(&canonical_name) {
            return Err(RegistrationError::AlreadyRegistered(canonical_name));
        }

        let simple_name = canonical_name
            .rsplit_once(':')
            .map(|(_, suffix)| suffix.to_string())
            .unwrap_or_else(|| canonical_name.clone());

        self.simple_index
            .entry(simple_name)
            .or_default()
            .push(canonical_name.clone());
        self.resource_types
            .insert(canonical_name.clone(), resolved_resource_type.clone());
        self.tools.insert(
            canonical_name.clone(),
            ToolEntry {
                canonical_name,
                resource_type: resolved_resource_type,
                description: description.into(),
                needs,
                func,
            },
        );
        Ok(())
    }

    pub fn get(&self, canonical_name: &str) -> Option<&ToolEntry> {
        self.tools.get(canonical_name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn list(&self, include_hidden: bool) -> Vec<&ToolEntry> {
        self.tools
            .values()
            .filter(|t| include_hidden || !t.description.is_empty())
            .collect()
    }

    fn known_resource_prefixes(&self) -> HashSet<&str> {
        self.resource_types
            .values()
            .filter_map(|rt| rt.as_deref())
            .collect()
    }

    /// Normalize `.`/`_` separated variants to `resource:action`, but only
    /// when the prefix names a *known* resource type. The `_` separator is
    /// deliberately asymmetric so a stateless tool literally named
    /// `foo_bar` is never accidentally aliased to a nonexistent `foo:bar`.
    fn normalize_action<'a>(&self, action: &'a str) -> std::borrow::Cow<'a, str> {
        if action.contains(':') {
            return std::borrow::Cow::Borrowed(action);
        }
        let prefixes = self.known_resource_prefixes();
        for sep in ['.', '_'] {
            if let Some((prefix, suffix)) = action.split_once(sep) {
                if prefixes.contains(prefix) {
                    let candidate = format!("{prefix}:{suffix}");
                    if self.tools.contains_key(&candidate) {
                        return std::borrow::Cow::Owned(candidate);
                    }
                }
            }
        }
        std::borrow::Cow::Borrowed(action)
    }

    /// Resolve an incoming action name to a tool entry.
    pub fn resolve(&self, action: &str) -> Result<ResolvedTool, ToolError> {
        let normalized = self.normalize_action(action);

        if let Some(entry) = self.tools.get(normalized.as_ref()) {
            return Ok(ResolvedTool {
                canonical_name: entry.canonical_name.clone(),
                simple_name: entry
                    .canonical_name
                    .rsplit_once(':')
                    .map(|(_, s)| s.to_string())
                    .unwrap_or_else(|| entry.canonical_name.clone()),
                resource_type: entry.resource_type.clone(),
            });
        }

        if normalized.contains(':') {
            return Err(ToolError::new(
                ErrorKind::InvalidRequestFormat,
                format!("tool not found: {normalized}"),
            )
            .with_data(serde_json::json!({ "action": normalized.as_ref() })));
        }

        match self.simple_index.get(normalized.as_ref()) {
            Some(candidates) if candidates.len() == 1 => {
                let canonical_name = candidates[0].clone();
                let resource_type = self.resource_types.get(&canonical_name).cloned().flatten();
                Ok(ResolvedTool {
                    canonical_name,
                    simple_name: normalized.to_string(),
                    resource_type,
                })
            }
            Some(candidates) if candidates.len() > 1 => Err(ToolError::new(
                ErrorKind::InvalidRequestFormat,
                format!(
                    "ambiguous tool name '{normalized}'. Multiple matches: {candidates:?}. Use the full name with a resource prefix."
                ),
            )
            .with_data(serde_json::json!({ "candidates": candidates }))),
            _ => Err(ToolError::new(
                ErrorKind::InvalidRequestFormat,
                format!("tool not found: {normalized}"),
            )
            .with_data(serde_json::json!({ "action": normalized.as_ref() }))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_tool() -> Arc<dyn ToolFn> {
        fn_tool(|_params, _ctx| async { Ok(serde_json::json!({})) })
    }

    #[test]
    fn register_splits_canonical_name() {
        let mut reg = ToolRegistry::new();
        reg.register("vm:click", None, "click", ContextNeeds::SESSION_TOOL, noop_tool())
            .unwrap();
        let entry = reg.get("vm:click").unwrap();
        assert_eq!(entry.resource_type.as_deref(), Some("vm"));
    }

    #[test]
    fn register_rejects_mismatched_resource_type() {
        let mut reg = ToolRegistry::new();
        let err = reg
            .register("vm:click", Some("rag"), "click", ContextNeeds::NONE, noop_tool())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::ResourceTypeMismatch { .. }));
    }

    #[test]
    fn resolve_exact_canonical_name() {
        let mut reg = ToolRegistry::new();
        reg.register("vm:click", None, "click", ContextNeeds::NONE, noop_tool())
            .unwrap();
        let resolved = reg.resolve("vm:click").unwrap();
        assert_eq!(resolved.canonical_name, "vm:click");
        assert_eq!(resolved.resource_type.as_deref(), Some("vm"));
    }

    #[test]
    fn resolve_is_idempotent_on_canonical_names() {
        let mut reg = ToolRegistry::new();
        reg.register("search", None, "search", ContextNeeds::NONE, noop_tool())
            .unwrap();
        let a = reg.resolve("search").unwrap();
        let b = reg.resolve(&a.canonical_name).unwrap();
        assert_eq!(a.canonical_name, b.canonical_name);
    }

    #[test]
    fn resolve_ambiguous_simple_name_lists_candidates() {
        let mut reg = ToolRegistry::new();
        reg.register("alpha:do", None, "", ContextNeeds::NONE, noop_tool())
            .unwrap();
        reg.register("beta:do", None, "", ContextNeeds::NONE, noop_tool())
            .unwrap();
        let err = reg.resolve("do").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequestFormat);
        let candidates = err.data.unwrap()["candidates"].clone();
        let mut candidates: Vec<String> =
            serde_json::from_value(candidates).unwrap();
        candidates.sort();
        assert_eq!(candidates, vec!["alpha:do".to_string(), "beta:do".to_string()]);
    }

    #[test]
    fn resolve_unique_simple_name_matches() {
        let mut reg = ToolRegistry::new();
        reg.register("vm:click", None, "", ContextNeeds::NONE, noop_tool())
            .unwrap();
        let resolved = reg.resolve("click").unwrap();
        assert_eq!(resolved.canonical_name, "vm:click");
    }

    #[test]
    fn resolve_unknown_tool_is_invalid_request() {
        let reg = ToolRegistry::new();
        let err = reg.resolve("nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequestFormat);
    }

    #[test]
    fn normalize_requires_known_resource_prefix() {
        let mut reg = ToolRegistry::new();
        reg.register("vm:click", None, "", ContextNeeds::NONE, noop_tool())
            .unwrap();
        reg.register("foo_bar", None, "", ContextNeeds::NONE, noop_tool())
            .unwrap();
        // "foo" isn't a known resource type, so "foo_bar" resolves to the
        // literal stateless tool rather than being split.
        let resolved = reg.resolve("foo_bar").unwrap();
        assert_eq!(resolved.canonical_name, "foo_bar");

        // "vm" is known, so "vm_click" normalizes to "vm:click".
        let resolved = reg.resolve("vm_click").unwrap();
        assert_eq!(resolved.canonical_name, "vm:click");
    }
}

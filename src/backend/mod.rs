// Backend lifecycle model and the registry of backends
// keyed by resource type.
//
// Every backend promises four entry points, any of which may be a no-op:
// `warmup`, `initialize`, `cleanup`, `shutdown`. Backends are structs
// implementing a small lifecycle trait, not a class hierarchy — no
// base-class state to smuggle things through.

pub mod stateless;
pub mod vmpool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ServiceError;

/// A backend's default configuration, merged with caller overrides at
/// session-creation time, never at load time.
pub type BackendConfig = Value;

/// Lifecycle contract shared by every heavy backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The resource type this backend owns; must equal the prefix of every
    /// tool it registers.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn default_config(&self) -> BackendConfig {
        Value::Object(Default::default())
    }

    /// Runs once, lazily on first dispatch or eagerly at startup for
    /// configured warmup targets. Must be idempotent; the caller
    /// serializes concurrent invocations via `warmup_once`.
    async fn warmup(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Produces the opaque `data` stored in `session_info.data` for a new
    /// session. The default (no-op) implementation is what makes a
    /// resource type "compatibility mode only" when no backend registers
    /// one — backends that need real per-session state override this.
    async fn initialize(&self, _worker_id: &str, _config: &Value) -> Result<Value, ServiceError> {
        Ok(Value::Object(Default::default()))
    }

    /// Releases the per-session handle. Called when a session is
    /// destroyed — explicitly, by TTL expiry, or as an ephemeral
    /// dispatcher-created session at the end of one call.
    async fn cleanup(&self, _worker_id: &str, _data: &Value) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Runs once, on server stop.
    async fn shutdown(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Serializes a backend's `warmup()` and tracks whether it already ran,
/// guarded by its own mutex plus a `warmed_up` boolean.
pub struct WarmupGate {
    warmed_up: AtomicBool,
    lock: Mutex<()>,
}

impl Default for WarmupGate {
    fn default() -> Self {
        Self {
            warmed_up: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }
}

impl WarmupGate {
    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up.load(Ordering::Acquire)
    }

    /// Runs `backend.warmup()` if it hasn't already, serialized against
    /// concurrent callers. Returns whether this call actually ran it.
    pub async fn warmup_once(&self, backend: &dyn Backend) -> Result<bool, ServiceError> {
        if self.is_warmed_up() {
            return Ok(false);
        }
        let _guard = self.lock.lock().await;
        if self.is_warmed_up() {
            return Ok(false);
        }
        backend.warmup().await?;
        self.warmed_up.store(true, Ordering::Release);
        Ok(true)
    }
}

struct RegisteredBackend {
    backend: Arc<dyn Backend>,
    warmup: WarmupGate,
}

/// Name -> backend map plus per-backend warmup bookkeeping. Append-mostly:
/// backends register at startup and the map is read-heavy thereafter.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, RegisteredBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        let name = backend.name().to_string();
        self.backends.insert(
            name,
            RegisteredBackend {
                backend,
                warmup: WarmupGate::default(),
            },
        );
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(resource_type).map(|r| r.backend.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Idempotent warmup for one backend, used by the dispatcher before
    /// every call that resolves to a resource-typed tool.
    pub async fn warmup(&self, resource_type: &str) -> Result<bool, ServiceError> {
        match self.backends.get(resource_type) {
            Some(registered) => registered.warmup.warmup_once(registered.backend.as_ref()).await,
            None => Ok(false),
        }
    }

    pub fn is_warmed_up(&self, resource_type: &str) -> bool {
        self.backends
            .get(resource_type)
            .map(|r| r.warmup.is_warmed_up())
            .unwrap_or(false)
    }

    /// Eagerly and fatally warm every backend named in `targets` — strict
    /// because they were explicitly listed as startup warmup targets.
    pub async fn warmup_strict(&self, targets: &[String]) -> Result<(), ServiceError> {
        for target in targets {
            self.warmup(target).await.map_err(|e| {
                ServiceError::Other(format!("strict warmup failed for backend '{target}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Warm every registered backend best-effort (used by "warmup all"
    /// API call); failures are collected, not propagated.
    pub async fn warmup_all(&self) -> HashMap<String, Result<bool, String>> {
        let mut results = HashMap::new();
        for name in self.names() {
            let outcome = self.warmup(&name).await.map_err(|e| e.to_string());
            results.insert(name, outcome);
        }
        results
    }

    pub async fn shutdown_all(&self) {
        for registered in self.backends.values() {
            if let Err(e) = registered.backend.shutdown().await {
                tracing::warn!(backend = registered.backend.name(), error = %e, "backend shutdown failed");
            }
        }
    }
}

// Session router.
//
// Owns `worker_id -> resource_type -> session` under a single mutex for
// structural changes (insert/remove of entries). Backend initialize/cleanup
// callbacks run with that mutex released — a slow VM start must never block
// unrelated worker/session traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::backend::BackendRegistry;
use crate::config::ServerConfig;
use crate::session::model::{new_session_id, sanitize_identifier, Session, SessionState, SessionStatus};

type Routes = HashMap<String, HashMap<String, Arc<Session>>>;

pub struct SessionRouter {
    routes: Mutex<Routes>,
    counters: Mutex<HashMap<(String, String), u32>>,
    ttl: Duration,
    config: Arc<ServerConfig>,
}

impl SessionRouter {
    pub fn new(ttl: Duration) -> Self {
        Self::with_config(ttl, Arc::new(ServerConfig::default()))
    }

    /// Same as `new`, but also consulted for each resource type's
    /// `[resources.<type>].config` section, which is merged into every
    /// session's config as the layer between the backend's own
    /// `default_config()` and the caller's per-call override — mirroring
    /// the original's `_merge_resource_config`.
    pub fn with_config(ttl: Duration, config: Arc<ServerConfig>) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            ttl,
            config,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn next_counter(&self, worker_id: &str, resource_type: &str) -> u32 {
        let mut counters = self.counters.lock().await;
        let counter = counters
            .entry((worker_id.to_string(), resource_type.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    fn session_name(worker_short: &str, resource_type: &str, counter: u32, custom: Option<&str>) -> String {
        let base = format!("{resource_type}_{worker_short}_{counter:03}");
        match custom {
            Some(c) => format!("{base}_{c}"),
            None => base,
        }
    }

    /// Return the session for `(worker_id, resource_type)` without
    /// creating one.
    pub async fn get(&self, worker_id: &str, resource_type: &str) -> Option<Arc<Session>> {
        let routes = self.routes.lock().await;
        routes.get(worker_id)?.get(resource_type).cloned()
    }

    /// Get the session for `(worker_id, resource_type)`, refreshing its TTL,
    /// or create (and, if the backend registers an initializer, initialize)
    /// a new one. Concurrent callers racing on the same key are resolved by
    /// performing the "exists?" check and the placeholder-reservation under
    /// the same lock acquisition, then releasing the lock around the
    /// (potentially slow) initializer.
    pub async fn get_or_create(
        &self,
        worker_id: &str,
        resource_type: &str,
        backends: &BackendRegistry,
        config: Option<Value>,
        custom_name: Option<&str>,
        auto_created: bool,
    ) -> Arc<Session> {
        // Fast path: session already exists.
        {
            let routes = self.routes.lock().await;
            if let Some(session) = routes.get(worker_id).and_then(|m| m.get(resource_type)) {
                let session = session.clone();
                drop(routes);
                session.refresh(self.ttl).await;
                return session;
            }
        }

        let backend = backends.get(resource_type);
        let default_config = backend
            .as_ref()
            .map(|b| b.default_config())
            .unwrap_or(Value::Object(Default::default()));
        // Layer order: backend hard defaults < server-document resource
        // config < caller's per-call override.
        let resource_config = self.config.resource_config(resource_type);
        let merged_config = merge_config(merge_config(default_config, Some(resource_config)), config);

        let worker_short = sanitize_identifier(worker_id, 32).unwrap_or_else(|| "worker".to_string());
        let counter = self.next_counter(worker_id, resource_type).await;
        let safe_custom = custom_name.and_then(|c| sanitize_identifier(c, 32));
        let session_name = Self::session_name(&worker_short, resource_type, counter, safe_custom.as_deref());
        let session_id = new_session_id(&session_name);

        let now = Utc::now();
        let session = Arc::new(Session {
            session_id,
            session_name,
            worker_id: worker_id.to_string(),
            resource_type: resource_type.to_string(),
            config: merged_config.clone(),
            created_at: now,
            auto_created,
            compatibility_mode: backend.is_none(),
            custom_name: safe_custom,
            state: tokio::sync::RwLock::new(SessionState {
                status: SessionStatus::Initializing,
                last_activity: now,
                expires_at: now + self.ttl,
                data: Value::Object(Default::default()),
                error: None,
            }),
        });

        // Reserve the placeholder under the structural lock so a racing
        // caller sees "exists" rather than double-initializing, then
        // release the lock for the (possibly slow) backend call.
        {
            let mut routes = self.routes.lock().await;
            let worker_routes = routes.entry(worker_id.to_string()).or_default();
            if let Some(existing) = worker_routes.get(resource_type) {
                // Lost the race: another caller beat us to it.
                let existing = existing.clone();
                drop(routes);
                existing.refresh(self.ttl).await;
                return existing;
            }
            worker_routes.insert(resource_type.to_string(), session.clone());
        }

        match &backend {
            Some(backend) => match backend.initialize(worker_id, &merged_config).await {
                Ok(data) => session.mark_active(data).await,
                Err(e) => session.mark_error(e.to_string()).await,
            },
            None => session.mark_active(Value::Object(Default::default())).await,
        }

        session
    }

    /// Destroy a session: run the backend's cleanup (if any) with the
    /// structural lock released, then remove the entry.
    pub async fn destroy(
        &self,
        worker_id: &str,
        resource_type: &str,
        backends: &BackendRegistry,
    ) -> Option<Arc<Session>> {
        let session = {
            let mut routes = self.routes.lock().await;
            routes.get_mut(worker_id)?.remove(resource_type)
        };
        let session = session?;

        if let Some(backend) = backends.get(resource_type) {
            let data = session.state.read().await.data.clone();
            if let Err(e) = backend.cleanup(worker_id, &data).await {
                tracing::warn!(worker_id, resource_type, error = %e, "backend cleanup failed");
            }
        }
        Some(session)
    }

    /// Destroy every session belonging to a worker, in a deterministic
    /// (sorted by resource type) order.
    pub async fn destroy_worker(&self, worker_id: &str, backends: &BackendRegistry) -> usize {
        let resource_types: Vec<String> = {
            let routes = self.routes.lock().await;
            let mut types: Vec<String> = routes
                .get(worker_id)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            types.sort();
            types
        };
        let mut count = 0;
        for resource_type in &resource_types {
            if self.destroy(worker_id, resource_type, backends).await.is_some() {
                count += 1;
            }
        }
        let mut routes = self.routes.lock().await;
        routes.remove(worker_id);
        count
    }

    /// Reset `expires_at`. If `resource_type` is omitted, refresh every
    /// session the worker owns.
    pub async fn refresh(&self, worker_id: &str, resource_type: Option<&str>) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let routes = self.routes.lock().await;
            match routes.get(worker_id) {
                None => return 0,
                Some(map) => match resource_type {
                    Some(rt) => map.get(rt).cloned().into_iter().collect(),
                    None => map.values().cloned().collect(),
                },
            }
        };
        for session in &sessions {
            session.refresh(self.ttl).await;
        }
        sessions.len()
    }

    /// Every worker id with at least one live session, sorted for
    /// deterministic shutdown ordering — graceful shutdown cleans up all
    /// sessions for all workers.
    pub async fn worker_ids(&self) -> Vec<String> {
        let routes = self.routes.lock().await;
        let mut ids: Vec<String> = routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Destroy every session for every worker, in deterministic order.
    /// Returns the total number of sessions destroyed.
    pub async fn shutdown_all(&self, backends: &BackendRegistry) -> usize {
        let mut total = 0;
        for worker_id in self.worker_ids().await {
            total += self.destroy_worker(&worker_id, backends).await;
        }
        total
    }

    pub async fn list_worker(&self, worker_id: &str) -> Vec<Arc<Session>> {
        let routes = self.routes.lock().await;
        routes
            .get(worker_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn total_sessions(&self) -> usize {
        let routes = self.routes.lock().await;
        routes.values().map(|m| m.len()).sum()
    }

    pub async fn active_workers(&self) -> usize {
        let routes = self.routes.lock().await;
        routes.len()
    }

    /// Scan for sessions whose `expires_at` is in the past and destroy
    /// them. Intended to run periodically from a background task.
    pub async fn cleanup_expired(&self, backends: &BackendRegistry) -> usize {
        let candidates: Vec<(String, String)> = {
            let routes = self.routes.lock().await;
            let mut out = Vec::new();
            for (worker_id, sessions) in routes.iter() {
                for (resource_type, _session) in sessions.iter() {
                    out.push((worker_id.clone(), resource_type.clone()));
                }
            }
            out
        };

        let mut expired = 0;
        for (worker_id, resource_type) in candidates {
            let is_expired = match self.get(&worker_id, &resource_type).await {
                Some(session) => session.is_expired().await,
                None => false,
            };
            if is_expired && self.destroy(&worker_id, &resource_type, backends).await.is_some() {
                expired += 1;
            }
        }
        expired
    }
}

fn merge_config(default_config: Value, override_config: Option<Value>) -> Value {
    let mut merged = match default_config {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    if let Some(Value::Object(overrides)) = override_config {
        for (k, v) in overrides {
            merged.insert(k, v);
        }
    }
    Value::Object(merged)
}

pub async fn run_expiry_sweeper(
    router: Arc<SessionRouter>,
    backends: Arc<BackendRegistry>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let expired = router.cleanup_expired(&backends).await;
        if expired > 0 {
            tracing::info!(expired, "session expiry sweep destroyed sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::error::ServiceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoBackend {
        name: String,
        fail: bool,
        init_calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for EchoBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initialize(&self, _worker_id: &str, _config: &Value) -> Result<Value, ServiceError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ServiceError::Other("init failed".into()))
            } else {
                Ok(serde_json::json!({ "loaded": true }))
            }
        }
    }

    #[tokio::test]
    async fn get_or_create_then_get_roundtrips() {
        let router = SessionRouter::new(Duration::from_secs(60));
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(EchoBackend {
            name: "rag".into(),
            fail: false,
            init_calls: AtomicUsize::new(0),
        }));

        let session = router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        assert_eq!(session.status().await, SessionStatus::Active);

        let again = router.get("w1", "rag").await.unwrap();
        assert_eq!(again.session_id, session.session_id);
    }

    #[tokio::test]
    async fn destroy_then_create_round_trip_has_no_stale_entry() {
        let router = SessionRouter::new(Duration::from_secs(60));
        let backends = BackendRegistry::new();
        router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        router.destroy("w1", "rag", &backends).await;
        assert!(router.get("w1", "rag").await.is_none());
    }

    #[tokio::test]
    async fn failed_initializer_marks_session_error() {
        let router = SessionRouter::new(Duration::from_secs(60));
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(EchoBackend {
            name: "vm".into(),
            fail: true,
            init_calls: AtomicUsize::new(0),
        }));
        let session = router
            .get_or_create("w1", "vm", &backends, None, None, true)
            .await;
        assert_eq!(session.status().await, SessionStatus::Error);
    }

    #[tokio::test]
    async fn no_initializer_is_compatibility_mode() {
        let router = SessionRouter::new(Duration::from_secs(60));
        let backends = BackendRegistry::new();
        let session = router
            .get_or_create("w1", "sql", &backends, None, None, false)
            .await;
        assert!(session.compatibility_mode);
        assert_eq!(session.status().await, SessionStatus::Active);
    }

    #[tokio::test]
    async fn server_document_resource_config_is_merged_beneath_caller_override() {
        let doc = r#"
            [resources.rag]
            config = { pool_size = 3, mode = "slow" }
        "#;
        let server_config = Arc::new(ServerConfig::parse(doc).unwrap());
        let router = SessionRouter::with_config(Duration::from_secs(60), server_config);
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(EchoBackend {
            name: "rag".into(),
            fail: false,
            init_calls: AtomicUsize::new(0),
        }));

        // No caller override: the server document's config reaches the
        // session untouched.
        let session = router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        assert_eq!(session.config["pool_size"], 3);
        assert_eq!(session.config["mode"], "slow");

        // Caller override wins over the server document.
        let session = router
            .get_or_create(
                "w2",
                "rag",
                &backends,
                Some(serde_json::json!({ "mode": "fast" })),
                None,
                false,
            )
            .await;
        assert_eq!(session.config["pool_size"], 3);
        assert_eq!(session.config["mode"], "fast");
    }

    #[tokio::test]
    async fn refresh_extends_expiry_by_ttl() {
        let router = SessionRouter::new(Duration::from_secs(60));
        let backends = BackendRegistry::new();
        let session = router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        let before = session.state.read().await.expires_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        router.refresh("w1", Some("rag")).await;
        let after = session.state.read().await.expires_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn refresh_with_no_sessions_reports_zero() {
        let router = SessionRouter::new(Duration::from_secs(60));
        assert_eq!(router.refresh("ghost", None).await, 0);
    }

    #[tokio::test]
    async fn at_most_one_session_per_worker_resource_pair() {
        let router = SessionRouter::new(Duration::from_secs(60));
        let backends = BackendRegistry::new();
        let a = router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        let b = router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(router.total_sessions().await, 1);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_past_sessions() {
        let router = SessionRouter::new(Duration::from_millis(1));
        let backends = BackendRegistry::new();
        router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = router.cleanup_expired(&backends).await;
        assert_eq!(removed, 1);
        assert!(router.get("w1", "rag").await.is_none());
    }

    #[tokio::test]
    async fn destroy_worker_clears_all_sessions() {
        let router = SessionRouter::new(Duration::from_secs(60));
        let backends = BackendRegistry::new();
        router
            .get_or_create("w1", "rag", &backends, None, None, false)
            .await;
        router
            .get_or_create("w1", "vm", &backends, None, None, false)
            .await;
        let count = router.destroy_worker("w1", &backends).await;
        assert_eq!(count, 2);
        assert_eq!(router.total_sessions().await, 0);
    }
}

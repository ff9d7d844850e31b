// VM pool backend — the canonical hard-resource backend.
//
// The VM "provider" itself (an emulator/cloud VM process) is an external
// collaborator; `VmProvider` is the trait that stands in for it, with
// `LocalVmProvider` simulating one in-process so the pool/session
// lifecycle can be exercised without a real desktop environment.
//
// The heterogeneous per-session state a loosely-typed map would hold here
// instead lives in a typed `VmSessionHandle` owned by
// the backend itself, keyed by `pool_id`; the JSON `data` a session carries
// is only the subset of that state the API needs to show callers (ip,
// ports, pool_id, pooled flag). Tool closures capture `Arc<VmBackend>` and
// look the handle up by `pool_id` — they never reach into the session
// router directly, only through the injected `session_info`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{Backend, BackendConfig};
use crate::error::{ErrorKind, ServiceError, ToolError};
use crate::registry::{fn_tool, ContextNeeds, ToolRegistry};
use crate::session::Session;

const MAX_ACTION_HISTORY: usize = 50;

// ---------------------------------------------------------------------
// Provider trait (external collaborator stand-in)
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VmEndpoint {
    pub ip: String,
    pub server_port: u16,
    pub chromium_port: u16,
    pub vnc_port: u16,
    pub vlc_port: u16,
}

/// Stands in for a real VM/container orchestration layer. Real
/// implementations would spawn/attach to a docker container, a cloud
/// VM, or a local emulator; none of that is this crate's concern.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Resolve the path/handle a later `start`/`stop` will operate on.
    fn vm_path(&self, os_type: &str, vm_path_override: Option<&str>) -> String;

    async fn start(&self, vm_path: &str, headless: bool, os_type: &str) -> Result<VmEndpoint, ServiceError>;

    async fn stop(&self, vm_path: &str);

    /// Revert to a named snapshot, returning a (possibly new) vm path.
    /// `None` means "snapshot reset not configured; caller should
    /// stop+restart instead".
    async fn revert_to_snapshot(&self, vm_path: &str, snapshot_name: &str) -> Result<String, ServiceError>;
}

/// In-process stand-in: no real emulator, just deterministic fake
/// endpoints so the pool lifecycle is fully exercisable in tests.
#[derive(Default)]
pub struct LocalVmProvider {
    counter: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl VmProvider for LocalVmProvider {
    fn vm_path(&self, os_type: &str, vm_path_override: Option<&str>) -> String {
        if let Some(p) = vm_path_override {
            return p.to_string();
        }
        format!("local-vm://{os_type}")
    }

    async fn start(&self, _vm_path: &str, _headless: bool, _os_type: &str) -> Result<VmEndpoint, ServiceError> {
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        Ok(VmEndpoint {
            ip: format!("127.0.{}.{}", (n >> 8) & 0xff, n & 0xff),
            server_port: 5000,
            chromium_port: 9222,
            vnc_port: 8006,
            vlc_port: 8080,
        })
    }

    async fn stop(&self, _vm_path: &str) {}

    async fn revert_to_snapshot(&self, vm_path: &str, _snapshot_name: &str) -> Result<String, ServiceError> {
        Ok(vm_path.to_string())
    }
}

// ---------------------------------------------------------------------
// Pool item + fingerprint
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VmPoolItem {
    pub pool_id: String,
    pub vm_path: String,
    pub endpoint: VmEndpoint,
    pub os_type: String,
    pub screen_size: (u32, u32),
    pub headless: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// The subset of a session's merged config that determines whether a pool
/// item acquired under one config can be reused for another.
#[derive(Debug, Clone, PartialEq)]
struct PoolFingerprint {
    provider: String,
    os_type: String,
    headless: bool,
    screen_size: (u32, u32),
    server_port: u16,
    chromium_port: u16,
    vnc_port: u16,
    vlc_port: u16,
    use_proxy: bool,
    vm_path: Option<String>,
}

fn normalize_screen_size(v: &Value) -> (u32, u32) {
    if let Some(arr) = v.as_array() {
        if arr.len() == 2 {
            let w = arr[0].as_u64().unwrap_or(1920) as u32;
            let h = arr[1].as_u64().unwrap_or(1080) as u32;
            return (w, h);
        }
    }
    (1920, 1080)
}

fn build_fingerprint(config: &Value) -> PoolFingerprint {
    PoolFingerprint {
        provider: config.get("provider").and_then(Value::as_str).unwrap_or("local").to_string(),
        os_type: config.get("os_type").and_then(Value::as_str).unwrap_or("Ubuntu").to_string(),
        headless: config.get("headless").and_then(Value::as_bool).unwrap_or(true),
        screen_size: normalize_screen_size(config.get("screen_size").unwrap_or(&Value::Null)),
        server_port: config.get("server_port").and_then(Value::as_u64).unwrap_or(5000) as u16,
        chromium_port: config.get("chromium_port").and_then(Value::as_u64).unwrap_or(9222) as u16,
        vnc_port: config.get("vnc_port").and_then(Value::as_u64).unwrap_or(8006) as u16,
        vlc_port: config.get("vlc_port").and_then(Value::as_u64).unwrap_or(8080) as u16,
        use_proxy: config.get("use_proxy").and_then(Value::as_bool).unwrap_or(false),
        vm_path: config.get("vm_path").and_then(Value::as_str).map(str::to_string),
    }
}

// ---------------------------------------------------------------------
// Action history + controller
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
struct ActionHistoryState {
    entries: VecDeque<Value>,
    last_action: Option<String>,
    last_action_failed: bool,
}

impl ActionHistoryState {
    fn record(&mut self, tool: &str, ok: bool) {
        self.entries.push_back(json!({ "tool": tool, "ok": ok, "ts": Utc::now().to_rfc3339() }));
        while self.entries.len() > MAX_ACTION_HISTORY {
            self.entries.pop_front();
        }
        self.last_action = Some(tool.to_string());
        self.last_action_failed = !ok;
    }
}

/// The VM-session's remote endpoint is inherently serial — one physical VM
/// can only execute one input event at a time, and a backend that needs
/// serialization has to provide it itself. `action_lock` is that
/// serialization point; every tool call holds it for the duration of the
/// (simulated) remote call.
pub struct VmController {
    action_lock: Mutex<()>,
    history: Mutex<ActionHistoryState>,
    recording: Mutex<bool>,
}

impl VmController {
    fn new() -> Self {
        Self {
            action_lock: Mutex::new(()),
            history: Mutex::new(ActionHistoryState::default()),
            recording: Mutex::new(false),
        }
    }

    /// Runs one simulated remote action under the serialization lock and
    /// records its outcome into the capped action history.
    async fn run_action<F>(&self, tool: &str, f: F) -> Result<Value, ToolError>
    where
        F: FnOnce() -> Result<Value, ToolError>,
    {
        let _guard = self.action_lock.lock().await;
        let result = f();
        let mut history = self.history.lock().await;
        history.record(tool, result.is_ok());
        result
    }

    async fn last_action_failed(&self) -> bool {
        self.history.lock().await.last_action_failed
    }

    async fn history_snapshot(&self) -> Vec<Value> {
        self.history.lock().await.entries.iter().cloned().collect()
    }
}

/// Per-session live state the backend owns, keyed by `pool_id` rather than
/// session id (the backend's `initialize`/`cleanup` signatures only carry
/// worker id and the opaque `data` value, not the session id itself).
pub struct VmSessionHandle {
    pool_item: Mutex<Option<VmPoolItem>>,
    pooled: bool,
    controller: VmController,
    recording_enabled: bool,
    recording_path: Option<String>,
}

// ---------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------

pub struct VmBackend {
    provider: Arc<dyn VmProvider>,
    pool: Mutex<VecDeque<VmPoolItem>>,
    fingerprint: Mutex<Option<PoolFingerprint>>,
    pool_size: Mutex<usize>,
    sessions: Mutex<HashMap<String, Arc<VmSessionHandle>>>,
    recordings_dir: PathBuf,
    /// `[resources.vm].config` from the server document — the layer
    /// between this backend's hardcoded `default_config()` and a caller's
    /// per-session override. Read by `warmup()`/`cleanup()`, which run
    /// outside the session router and would otherwise never see it.
    resource_config: Value,
}

impl VmBackend {
    pub fn new(provider: Arc<dyn VmProvider>, recordings_dir: PathBuf, resource_config: Value) -> Self {
        Self {
            provider,
            pool: Mutex::new(VecDeque::new()),
            fingerprint: Mutex::new(None),
            pool_size: Mutex::new(0),
            sessions: Mutex::new(HashMap::new()),
            recordings_dir,
            resource_config,
        }
    }

    /// `default_config()` merged with the operator's `[resources.vm].config`
    /// section. This is the base every pool-level operation (warmup, reset)
    /// should use instead of the bare hardcoded defaults.
    fn effective_config(&self) -> Value {
        let mut merged = match self.default_config() {
            Value::Object(m) => m,
            _ => Default::default(),
        };
        if let Value::Object(overrides) = &self.resource_config {
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
        }
        Value::Object(merged)
    }

    fn merge_config(&self, config: &Value) -> Value {
        let mut merged = match self.effective_config() {
            Value::Object(m) => m,
            _ => Default::default(),
        };
        if let Value::Object(overrides) = config {
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
        }
        Value::Object(merged)
    }

    async fn create_pool_item(&self, config: &Value) -> Result<VmPoolItem, ServiceError> {
        let os_type = config.get("os_type").and_then(Value::as_str).unwrap_or("Ubuntu").to_string();
        let headless = config.get("headless").and_then(Value::as_bool).unwrap_or(true);
        let vm_path_override = config.get("vm_path").and_then(Value::as_str);
        let vm_path = self.provider.vm_path(&os_type, vm_path_override);
        let endpoint = self.provider.start(&vm_path, headless, &os_type).await?;
        let now = Utc::now();
        Ok(VmPoolItem {
            pool_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            vm_path,
            endpoint,
            os_type,
            screen_size: normalize_screen_size(config.get("screen_size").unwrap_or(&Value::Null)),
            headless,
            created_at: now,
            last_used_at: now,
        })
    }

    /// Pop a matching-fingerprint idle item, or create a fresh one bypassing
    /// the pool. Returns `(item, pooled)`.
    async fn acquire_pool_item(&self, config: &Value) -> Result<(VmPoolItem, bool), ServiceError> {
        let candidate = build_fingerprint(config);
        let matches = self.fingerprint.lock().await.as_ref() == Some(&candidate);
        if matches {
            let mut pool = self.pool.lock().await;
            if let Some(mut item) = pool.pop_front() {
                item.last_used_at = Utc::now();
                return Ok((item, true));
            }
        }
        let item = self.create_pool_item(config).await?;
        Ok((item, false))
    }

    async fn stop_pool_item(&self, item: &VmPoolItem) {
        self.provider.stop(&item.vm_path).await;
    }

    /// Revert to snapshot (if configured) or stop+restart, then re-query
    /// the endpoint. Returns `false` (discard, never reinsert) on any
    /// failure.
    async fn reset_pool_item(&self, item: &mut VmPoolItem, config: &Value) -> bool {
        let pool_reset = config.get("pool_reset").and_then(Value::as_bool).unwrap_or(true);
        if !pool_reset {
            return true;
        }
        let snapshot_name = config.get("snapshot_name").and_then(Value::as_str);
        let reset_path = match snapshot_name {
            Some(name) => match self.provider.revert_to_snapshot(&item.vm_path, name).await {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(pool_id = %item.pool_id, error = %e, "vm pool snapshot revert failed");
                    return false;
                }
            },
            None => {
                self.provider.stop(&item.vm_path).await;
                item.vm_path.clone()
            }
        };
        item.vm_path = reset_path;
        match self.provider.start(&item.vm_path, item.headless, &item.os_type).await {
            Ok(endpoint) => {
                item.endpoint = endpoint;
                true
            }
            Err(e) => {
                tracing::warn!(pool_id = %item.pool_id, error = %e, "vm pool restart after reset failed");
                false
            }
        }
    }

    /// Return a leased item to the pool, discarding it instead of
    /// reinserting if non-pooled, the pool is full, or reset fails.
    async fn release_pool_item(&self, mut item: VmPoolItem, pooled: bool, config: &Value) {
        item.last_used_at = Utc::now();
        let target_size = *self.pool_size.lock().await;
        if !pooled || target_size == 0 {
            self.stop_pool_item(&item).await;
            return;
        }
        {
            let pool = self.pool.lock().await;
            if pool.len() >= target_size {
                drop(pool);
                self.stop_pool_item(&item).await;
                return;
            }
        }
        if !self.reset_pool_item(&mut item, config).await {
            self.stop_pool_item(&item).await;
            return;
        }
        let mut pool = self.pool.lock().await;
        if pool.len() < target_size {
            pool.push_back(item);
        } else {
            drop(pool);
            self.stop_pool_item(&item).await;
        }
    }

    fn recording_file(&self, pool_id: &str, configured: Option<&str>) -> PathBuf {
        match configured {
            Some(p) if !p.trim().is_empty() => {
                let path = PathBuf::from(p.trim());
                if path.extension().is_some() {
                    path
                } else {
                    path.join(format!("{pool_id}.mp4"))
                }
            }
            _ => self.recordings_dir.join(format!("{pool_id}.mp4")),
        }
    }

    async fn handle_for(&self, pool_id: &str) -> Option<Arc<VmSessionHandle>> {
        self.sessions.lock().await.get(pool_id).cloned()
    }

    fn controller_or_error(handle: Option<Arc<VmSessionHandle>>) -> Result<Arc<VmSessionHandle>, ToolError> {
        handle.ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized).with_data(json!({"detail": "VM session not initialized"})))
    }

    fn pool_id_from_session(session: &Session, data: &Value) -> Option<String> {
        data.get("pool_id").and_then(Value::as_str).map(str::to_string).or_else(|| {
            tracing::warn!(session_id = %session.session_id, "vm session data missing pool_id");
            None
        })
    }
}

#[async_trait]
impl Backend for VmBackend {
    fn name(&self) -> &str {
        "vm"
    }

    fn description(&self) -> &str {
        "Virtual machine / desktop-automation backend (pooled, snapshot-resettable)"
    }

    fn default_config(&self) -> BackendConfig {
        json!({
            "screen_size": [1920, 1080],
            "provider": "local",
            "os_type": "Ubuntu",
            "headless": true,
            "pool_size": 0,
            "pool_reset": true,
            "snapshot_name": Value::Null,
            "setup": [],
            "use_proxy": false,
            "client_password": "password",
            "server_port": 5000,
            "chromium_port": 9222,
            "vnc_port": 8006,
            "vlc_port": 8080,
            "recording": false,
            "recording_path": Value::Null,
            "vm_path": Value::Null,
        })
    }

    async fn warmup(&self) -> Result<(), ServiceError> {
        let config = self.effective_config();
        let pool_size = config.get("pool_size").and_then(Value::as_u64).unwrap_or(0) as usize;
        if pool_size == 0 {
            return Ok(());
        }
        *self.pool_size.lock().await = pool_size;
        *self.fingerprint.lock().await = Some(build_fingerprint(&config));

        for idx in 0..pool_size {
            match self.create_pool_item(&config).await {
                Ok(item) => {
                    self.pool.lock().await.push_back(item);
                }
                Err(e) => {
                    tracing::error!(idx, error = %e, "vm pool warmup failed to create pool item");
                }
            }
        }
        Ok(())
    }

    async fn initialize(&self, worker_id: &str, config: &Value) -> Result<Value, ServiceError> {
        let merged = self.merge_config(config);
        let (item, pooled) = self.acquire_pool_item(&merged).await?;

        let recording_enabled = merged.get("recording").and_then(Value::as_bool).unwrap_or(false);
        let recording_path = merged.get("recording_path").and_then(Value::as_str).map(str::to_string);

        let handle = Arc::new(VmSessionHandle {
            pool_item: Mutex::new(Some(item.clone())),
            pooled,
            controller: VmController::new(),
            recording_enabled,
            recording_path,
        });

        self.sessions.lock().await.insert(item.pool_id.clone(), handle);

        tracing::info!(worker_id, pool_id = %item.pool_id, pooled, "vm session initialized");

        Ok(json!({
            "pool_id": item.pool_id,
            "pooled": pooled,
            "vm_ip": item.endpoint.ip,
            "server_port": item.endpoint.server_port,
            "chromium_port": item.endpoint.chromium_port,
            "vnc_port": item.endpoint.vnc_port,
            "vlc_port": item.endpoint.vlc_port,
            "os_type": item.os_type,
            "screen_size": [item.screen_size.0, item.screen_size.1],
            "recording_enabled": recording_enabled,
        }))
    }

    async fn cleanup(&self, _worker_id: &str, data: &Value) -> Result<(), ServiceError> {
        let Some(pool_id) = data.get("pool_id").and_then(Value::as_str).map(str::to_string) else {
            return Ok(());
        };
        let handle = self.sessions.lock().await.remove(&pool_id);
        let Some(handle) = handle else { return Ok(()) };

        if handle.recording_enabled {
            let path = self.recording_file(&pool_id, handle.recording_path.as_deref());
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            tracing::info!(pool_id, path = %path.display(), "vm recording stopped");
        }

        let item = handle.pool_item.lock().await.take();
        if let Some(item) = item {
            let config = self.effective_config();
            self.release_pool_item(item, handle.pooled, &config).await;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ServiceError> {
        let items: Vec<VmPoolItem> = self.pool.lock().await.drain(..).collect();
        for item in &items {
            self.stop_pool_item(item).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Tool methods
// ---------------------------------------------------------------------

fn param_i64(params: &Value, key: &str) -> i64 {
    params.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn param_str<'a>(params: &'a Value, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Every successful VM action reports this synthetic accessibility tree
/// alongside the operation's own fields, so callers can read the new UI
/// state without a separate screenshot call.
fn stub_accessibility_tree() -> Value {
    Value::String("<tree/>".to_string())
}

/// Fixes the known PyAutoGUI `'<'` keystroke bug by rewriting
/// `pyautogui.press('<')` into `pyautogui.hotkey("shift", ",")`.
fn fix_pyautogui_less_than_bug(command: &str) -> String {
    let press_pattern = Regex::new(r#"pyautogui\.press\(["'](?:<|\\u003c)["']\)"#).expect("static regex");
    press_pattern.replace_all(command, "pyautogui.hotkey(\"shift\", \",\")").into_owned()
}

fn is_allowed_pyautogui_command(command: &str) -> bool {
    command.trim_start().starts_with("pyautogui.")
}

impl VmBackend {
    /// Register every `vm:*` tool. Each closure captures `Arc<Self>` and
    /// looks up the live `VmSessionHandle` by `pool_id` from the injected
    /// `session_info.data` — tools never reach into the session router
    /// directly.
    pub fn register_tools(self: &Arc<Self>, reg: &mut ToolRegistry) -> Result<(), crate::registry::RegistrationError> {
        macro_rules! register_action {
            ($name:literal, $desc:literal, $body:expr) => {{
                let backend = Arc::clone(self);
                reg.register(
                    concat!("vm:", $name),
                    None,
                    $desc,
                    ContextNeeds::SESSION_TOOL,
                    fn_tool(move |params: Value, ctx: crate::registry::ToolContext| {
                        let backend = Arc::clone(&backend);
                        async move {
                            let session = ctx.session_info.ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                            let data = session.state.read().await.data.clone();
                            let pool_id = VmBackend::pool_id_from_session(&session, &data)
                                .ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                            let handle = VmBackend::controller_or_error(backend.handle_for(&pool_id).await)?;
                            let op: fn(Value) -> Result<Value, ToolError> = $body;
                            handle.controller.run_action($name, move || op(params)).await
                        }
                    }),
                )?;
            }};
        }

        register_action!("screenshot", "Capture the VM screen", |_p| Ok(json!({
            "screenshot": "<base64-stub>",
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("click", "Click at (x, y)", |p| Ok(json!({
            "x": param_i64(&p, "x"), "y": param_i64(&p, "y"),
            "button": if param_str(&p, "button").is_empty() { "left" } else { param_str(&p, "button") },
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("double_click", "Double-click at (x, y)", |p| Ok(json!({
            "x": param_i64(&p, "x"), "y": param_i64(&p, "y"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("right_click", "Right-click at (x, y)", |p| Ok(json!({
            "x": param_i64(&p, "x"), "y": param_i64(&p, "y"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("type", "Type literal text", |p| Ok(json!({
            "text": param_str(&p, "text"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("key", "Press and release a single key", |p| Ok(json!({
            "key": param_str(&p, "key"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("key_down", "Hold a key down", |p| Ok(json!({
            "key": param_str(&p, "key"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("key_up", "Release a held key", |p| Ok(json!({
            "key": param_str(&p, "key"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("hotkey", "Press a key combination", |p| {
            let keys: Vec<String> = p
                .get("keys")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            Ok(json!({ "keys": keys, "accessibility_tree": stub_accessibility_tree() }))
        });
        register_action!("scroll", "Scroll at (x, y)", |p| Ok(json!({
            "x": param_i64(&p, "x"), "y": param_i64(&p, "y"), "clicks": param_i64(&p, "clicks"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("drag", "Drag from start to end", |p| Ok(json!({
            "start_x": param_i64(&p, "start_x"), "start_y": param_i64(&p, "start_y"),
            "end_x": param_i64(&p, "end_x"), "end_y": param_i64(&p, "end_y"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("move", "Move the pointer to (x, y)", |p| Ok(json!({
            "x": param_i64(&p, "x"), "y": param_i64(&p, "y"),
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("mouse_down", "Press a mouse button", |p| Ok(json!({
            "button": if param_str(&p, "button").is_empty() { "left" } else { param_str(&p, "button") },
            "accessibility_tree": stub_accessibility_tree(),
        })));
        register_action!("mouse_up", "Release a mouse button", |p| Ok(json!({
            "button": if param_str(&p, "button").is_empty() { "left" } else { param_str(&p, "button") },
            "accessibility_tree": stub_accessibility_tree(),
        })));

        // `pyautogui` has its own validation (allowlist + `<` bug fix), so
        // it isn't expressed through the `register_action!` macro above.
        {
            let backend = Arc::clone(self);
            reg.register(
                "vm:pyautogui",
                None,
                "Execute a single pyautogui.* command",
                ContextNeeds::SESSION_TOOL,
                fn_tool(move |params: Value, ctx: crate::registry::ToolContext| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let session = ctx.session_info.ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                        let data = session.state.read().await.data.clone();
                        let pool_id = VmBackend::pool_id_from_session(&session, &data)
                            .ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                        let handle = VmBackend::controller_or_error(backend.handle_for(&pool_id).await)?;
                        let command = param_str(&params, "command").to_string();
                        handle
                            .controller
                            .run_action("pyautogui", move || {
                                if !is_allowed_pyautogui_command(&command) {
                                    return Err(ToolError::new(
                                        ErrorKind::InvalidInput,
                                        "only pyautogui.* commands are allowed",
                                    ));
                                }
                                let fixed = fix_pyautogui_less_than_bug(&command);
                                Ok(json!({ "executed_command": fixed, "accessibility_tree": stub_accessibility_tree() }))
                            })
                            .await
                    }
                }),
            )?;
        }

        {
            let backend = Arc::clone(self);
            reg.register(
                "vm:evaluate",
                None,
                "Score the current VM/task state against an evaluator spec",
                ContextNeeds::SESSION_TOOL,
                fn_tool(move |params: Value, ctx: crate::registry::ToolContext| {
                    let backend = Arc::clone(&backend);
                    async move {
                        let session = ctx.session_info.ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                        let data = session.state.read().await.data.clone();
                        let pool_id = VmBackend::pool_id_from_session(&session, &data)
                            .ok_or_else(|| ToolError::from_kind(ErrorKind::ResourceNotInitialized))?;
                        let handle = VmBackend::controller_or_error(backend.handle_for(&pool_id).await)?;
                        evaluate(&handle, &params).await
                    }
                }),
            )?;
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------
// Evaluator (`vm:evaluate`)
// ---------------------------------------------------------------------

fn normalize_eval_list(value: Option<&Value>, expected_len: usize) -> Result<Vec<Value>, ToolError> {
    match value {
        None => Ok(vec![Value::Null; expected_len]),
        Some(Value::Array(items)) => {
            if items.len() != expected_len {
                return Err(ToolError::new(ErrorKind::InvalidInput, "evaluator list lengths do not match"));
            }
            Ok(items.clone())
        }
        Some(other) => Ok(vec![other.clone(); expected_len]),
    }
}

async fn run_getter(handle: &VmSessionHandle, getter_cfg: &Value) -> Result<Value, ToolError> {
    let kind = getter_cfg.get("type").and_then(Value::as_str).unwrap_or("literal");
    match kind {
        "literal" => Ok(getter_cfg.get("value").cloned().unwrap_or(Value::Null)),
        "last_action" => Ok(handle
            .controller
            .history_snapshot()
            .await
            .last()
            .cloned()
            .unwrap_or(Value::Null)),
        "history" => Ok(Value::Array(handle.controller.history_snapshot().await)),
        other => Err(ToolError::new(ErrorKind::InvalidInput, format!("unknown getter type: {other}"))),
    }
}

fn run_metric(func_name: &str, result: &Value, expected: Option<&Value>, options: &Value) -> Result<f64, ToolError> {
    match func_name {
        "exact_match" => Ok(if Some(result) == expected { 1.0 } else { 0.0 }),
        "contains" => {
            let needle = expected.and_then(Value::as_str).unwrap_or("");
            let haystack = result.as_str().unwrap_or("");
            Ok(if haystack.contains(needle) { 1.0 } else { 0.0 })
        }
        "truthy" => Ok(if is_truthy(result) { 1.0 } else { 0.0 }),
        "threshold" => {
            let value = result.as_f64().unwrap_or(0.0);
            let min = options.get("min").and_then(Value::as_f64).unwrap_or(0.0);
            Ok(if value >= min { 1.0 } else { 0.0 })
        }
        other => Err(ToolError::new(ErrorKind::InvalidInput, format!("unknown metric function: {other}"))),
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

async fn evaluate(handle: &VmSessionHandle, evaluator: &Value) -> Result<Value, ToolError> {
    let last_action_failed = handle.controller.last_action_failed().await;

    let funcs_raw = evaluator.get("func").cloned().unwrap_or(Value::Null);
    if funcs_raw == Value::String("infeasible".to_string()) {
        let score = if last_action_failed { 1.0 } else { 0.0 };
        return Ok(json!({ "score": score, "results": [], "details": [], "last_action_failed": last_action_failed }));
    }
    if last_action_failed {
        return Ok(json!({ "score": 0.0, "results": [], "details": [], "last_action_failed": last_action_failed }));
    }

    let func_list: Vec<String> = match &funcs_raw {
        Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        Value::String(s) => vec![s.clone()],
        _ => return Err(ToolError::new(ErrorKind::InvalidInput, "evaluator.func is required")),
    };
    if func_list.is_empty() {
        return Err(ToolError::new(ErrorKind::InvalidInput, "evaluator.func is required"));
    }

    let n = func_list.len();
    let results_cfg = normalize_eval_list(evaluator.get("result"), n)?;
    let expected_cfg = normalize_eval_list(evaluator.get("expected"), n)?;
    let options_cfg = normalize_eval_list(evaluator.get("options"), n)?;
    let conj = evaluator.get("conj").and_then(Value::as_str).unwrap_or("and");

    let mut scores = Vec::with_capacity(n);
    let mut details = Vec::with_capacity(n);
    let mut final_score: Option<f64> = None;

    for i in 0..n {
        let result_state = run_getter(handle, &results_cfg[i]).await?;
        let expected_state = if expected_cfg[i].is_null() {
            None
        } else {
            Some(run_getter(handle, &expected_cfg[i]).await?)
        };
        let score = run_metric(&func_list[i], &result_state, expected_state.as_ref(), &options_cfg[i])?;
        scores.push(score);
        details.push(json!({
            "func": func_list[i],
            "score": score,
            "result": result_state,
            "expected": expected_state,
        }));

        if conj == "and" && score == 0.0 {
            final_score = Some(0.0);
            break;
        }
        if conj == "or" && score == 1.0 {
            final_score = Some(1.0);
            break;
        }
    }

    let final_score = final_score.unwrap_or_else(|| {
        if conj == "and" {
            scores.iter().sum::<f64>() / scores.len() as f64
        } else {
            scores.iter().cloned().fold(0.0, f64::max)
        }
    });

    Ok(json!({ "score": final_score, "results": scores, "details": details }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> Arc<VmBackend> {
        Arc::new(VmBackend::new(
            Arc::new(LocalVmProvider::default()),
            PathBuf::from("/tmp/vm_test_recordings"),
            Value::Object(Default::default()),
        ))
    }

    fn test_backend_with_resource_config(resource_config: Value) -> Arc<VmBackend> {
        Arc::new(VmBackend::new(
            Arc::new(LocalVmProvider::default()),
            PathBuf::from("/tmp/vm_test_recordings"),
            resource_config,
        ))
    }

    #[tokio::test]
    async fn warmup_prefills_pool_to_target_size() {
        let backend = test_backend();
        *backend.pool_size.lock().await = 2;
        *backend.fingerprint.lock().await = Some(build_fingerprint(&backend.default_config()));
        for _ in 0..2 {
            let item = backend.create_pool_item(&backend.default_config()).await.unwrap();
            backend.pool.lock().await.push_back(item);
        }
        assert_eq!(backend.pool.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn warmup_reads_pool_size_from_server_resource_config() {
        // `default_config()`'s hardcoded `pool_size` is 0 — only the
        // server document's `[resources.vm].config` should be able to turn
        // pooling on.
        let backend = test_backend_with_resource_config(json!({ "pool_size": 2 }));
        backend.warmup().await.unwrap();
        assert_eq!(backend.pool.lock().await.len(), 2);
        assert_eq!(*backend.pool_size.lock().await, 2);
    }

    #[tokio::test]
    async fn pool_reuse_round_trips_through_full_lifecycle_when_configured() {
        // Spec §8 scenario 5: pool_size=1, warm up, create(w1) -> P,
        // destroy, create(w2) -> same P.
        let backend = test_backend_with_resource_config(json!({ "pool_size": 1 }));
        backend.warmup().await.unwrap();
        assert_eq!(backend.pool.lock().await.len(), 1);

        let data1 = backend.initialize("w1", &Value::Object(Default::default())).await.unwrap();
        let pool_id_1 = data1["pool_id"].as_str().unwrap().to_string();
        assert!(backend.pool.lock().await.is_empty());

        backend.cleanup("w1", &data1).await.unwrap();
        assert_eq!(backend.pool.lock().await.len(), 1);

        let data2 = backend.initialize("w2", &Value::Object(Default::default())).await.unwrap();
        let pool_id_2 = data2["pool_id"].as_str().unwrap().to_string();
        assert_eq!(pool_id_1, pool_id_2);
    }

    #[tokio::test]
    async fn acquire_reuses_pool_item_when_fingerprint_matches() {
        let backend = test_backend();
        let config = backend.default_config();
        *backend.pool_size.lock().await = 1;
        *backend.fingerprint.lock().await = Some(build_fingerprint(&config));
        let seeded = backend.create_pool_item(&config).await.unwrap();
        let seeded_id = seeded.pool_id.clone();
        backend.pool.lock().await.push_back(seeded);

        let (item, pooled) = backend.acquire_pool_item(&config).await.unwrap();
        assert!(pooled);
        assert_eq!(item.pool_id, seeded_id);
        assert!(backend.pool.lock().await.is_empty());
    }

    #[tokio::test]
    async fn acquire_bypasses_pool_on_fingerprint_mismatch() {
        let backend = test_backend();
        let config = backend.default_config();
        *backend.pool_size.lock().await = 1;
        // Seed with a different fingerprint than what we'll request.
        *backend.fingerprint.lock().await = Some(PoolFingerprint {
            provider: "other".into(),
            os_type: "Ubuntu".into(),
            headless: true,
            screen_size: (1920, 1080),
            server_port: 5000,
            chromium_port: 9222,
            vnc_port: 8006,
            vlc_port: 8080,
            use_proxy: false,
            vm_path: None,
        });
        let (_, pooled) = backend.acquire_pool_item(&config).await.unwrap();
        assert!(!pooled);
    }

    #[tokio::test]
    async fn release_reinserts_pooled_item_after_reset() {
        let backend = test_backend();
        let config = backend.default_config();
        *backend.pool_size.lock().await = 1;
        let item = backend.create_pool_item(&config).await.unwrap();
        backend.release_pool_item(item, true, &config).await;
        assert_eq!(backend.pool.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn release_discards_non_pooled_item() {
        let backend = test_backend();
        let config = backend.default_config();
        *backend.pool_size.lock().await = 1;
        let item = backend.create_pool_item(&config).await.unwrap();
        backend.release_pool_item(item, false, &config).await;
        assert!(backend.pool.lock().await.is_empty());
    }

    #[tokio::test]
    async fn release_discards_when_pool_already_full() {
        let backend = test_backend();
        let config = backend.default_config();
        *backend.pool_size.lock().await = 1;
        let filler = backend.create_pool_item(&config).await.unwrap();
        backend.pool.lock().await.push_back(filler);
        let extra = backend.create_pool_item(&config).await.unwrap();
        backend.release_pool_item(extra, true, &config).await;
        assert_eq!(backend.pool.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn initialize_then_cleanup_round_trips_session_registry() {
        let backend = test_backend();
        let data = backend.initialize("w1", &Value::Object(Default::default())).await.unwrap();
        let pool_id = data["pool_id"].as_str().unwrap().to_string();
        assert!(backend.handle_for(&pool_id).await.is_some());
        backend.cleanup("w1", &data).await.unwrap();
        assert!(backend.handle_for(&pool_id).await.is_none());
    }

    #[tokio::test]
    async fn pyautogui_fix_rewrites_less_than_press() {
        let fixed = fix_pyautogui_less_than_bug("pyautogui.press('<')");
        assert_eq!(fixed, "pyautogui.hotkey(\"shift\", \",\")");
    }

    #[tokio::test]
    async fn pyautogui_rejects_non_pyautogui_commands() {
        assert!(!is_allowed_pyautogui_command("os.system('rm -rf /')"));
        assert!(is_allowed_pyautogui_command("pyautogui.click(1, 2)"));
    }

    #[tokio::test]
    async fn evaluate_infeasible_scores_one_when_last_action_failed() {
        let backend = test_backend();
        let data = backend.initialize("w1", &Value::Object(Default::default())).await.unwrap();
        let pool_id = data["pool_id"].as_str().unwrap().to_string();
        let handle = backend.handle_for(&pool_id).await.unwrap();
        handle
            .controller
            .run_action("click", || Err(ToolError::from_kind(ErrorKind::ExecutionError)))
            .await
            .unwrap_err();

        let result = evaluate(&handle, &json!({"func": "infeasible"})).await.unwrap();
        assert_eq!(result["score"], 1.0);
    }

    #[tokio::test]
    async fn evaluate_short_circuits_to_zero_after_failed_action() {
        let backend = test_backend();
        let data = backend.initialize("w1", &Value::Object(Default::default())).await.unwrap();
        let pool_id = data["pool_id"].as_str().unwrap().to_string();
        let handle = backend.handle_for(&pool_id).await.unwrap();
        handle
            .controller
            .run_action("click", || Err(ToolError::from_kind(ErrorKind::ExecutionError)))
            .await
            .unwrap_err();

        let result = evaluate(
            &handle,
            &json!({"func": "exact_match", "result": {"type": "literal", "value": 1}, "expected": {"type": "literal", "value": 1}}),
        )
        .await
        .unwrap();
        assert_eq!(result["score"], 0.0);
    }

    #[tokio::test]
    async fn evaluate_and_conjunction_means_over_passing_metrics() {
        let backend = test_backend();
        let data = backend.initialize("w1", &Value::Object(Default::default())).await.unwrap();
        let pool_id = data["pool_id"].as_str().unwrap().to_string();
        let handle = backend.handle_for(&pool_id).await.unwrap();

        let result = evaluate(
            &handle,
            &json!({
                "func": ["exact_match", "exact_match"],
                "result": [{"type": "literal", "value": 1}, {"type": "literal", "value": 2}],
                "expected": [{"type": "literal", "value": 1}, {"type": "literal", "value": 2}],
                "conj": "and",
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["score"], 1.0);
    }

    #[tokio::test]
    async fn evaluate_or_conjunction_short_circuits_on_first_success() {
        let backend = test_backend();
        let data = backend.initialize("w1", &Value::Object(Default::default())).await.unwrap();
        let pool_id = data["pool_id"].as_str().unwrap().to_string();
        let handle = backend.handle_for(&pool_id).await.unwrap();

        let result = evaluate(
            &handle,
            &json!({
                "func": ["exact_match", "exact_match"],
                "result": [{"type": "literal", "value": 1}, {"type": "literal", "value": 99}],
                "expected": [{"type": "literal", "value": 1}, {"type": "literal", "value": 2}],
                "conj": "or",
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["score"], 1.0);
        assert_eq!(result["results"].as_array().unwrap().len(), 1);
    }
}

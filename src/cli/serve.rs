// `serve` / `warmup-status` / `check-config` subcommands.
//
// One setup function (`build_dispatcher`) shared by every subcommand that
// needs a live dispatcher; `serve` binds a `TcpListener` and hands it to
// `axum::serve`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use toolhost::backend::vmpool::{LocalVmProvider, VmBackend};
use toolhost::backend::BackendRegistry;
use toolhost::config::ServerConfig;
use toolhost::dispatch::Dispatcher;
use toolhost::http::{create_router, AppState};
use toolhost::registry::ToolRegistry;
use toolhost::session::{run_expiry_sweeper, SessionRouter};
use toolhost::tools::register_reference_tools;

const DEFAULT_CONFIG_PATH: &str = "toolhost.toml";

fn resolve_config_path(config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn load_config(path: &Path) -> Result<ServerConfig> {
    ServerConfig::load_from_path(path).with_context(|| format!("loading config from {}", path.display()))
}

/// Build the registry, backend registry, and session router shared by every
/// subcommand that needs a live dispatcher. Each resource type is only
/// registered (and therefore only dispatchable) when `[resources.<type>]`
/// is absent or `enabled = true` in the server document; the VM backend's
/// own pool-sizing config is threaded in from the same document so
/// `pool_size`/`snapshot_name`/`recording`/etc. are actually configurable
/// from the outside, not just the backend's hardcoded defaults.
fn build_dispatcher(config: &Arc<ServerConfig>) -> Result<(Dispatcher, Arc<BackendRegistry>, Arc<SessionRouter>)> {
    let mut registry = ToolRegistry::new();
    let mut backends = BackendRegistry::new();

    register_reference_tools(&mut registry, &mut backends, config)
        .context("registering reference tools")?;

    if config.resource_enabled("vm") {
        let recordings_dir = std::env::temp_dir().join("toolhost-vm-recordings");
        let vm_backend = Arc::new(VmBackend::new(
            Arc::new(LocalVmProvider::default()),
            recordings_dir,
            config.resource_config("vm"),
        ));
        vm_backend.register_tools(&mut registry).context("registering vm tools")?;
        backends.register(vm_backend);
    } else {
        tracing::info!("vm resource disabled via config, skipping registration");
    }

    let backends = Arc::new(backends);
    let sessions = Arc::new(SessionRouter::with_config(
        Duration::from_secs(config.server.session_ttl_secs),
        config.clone(),
    ));

    let dispatcher = Dispatcher::new(Arc::new(registry), backends.clone(), sessions.clone());
    Ok((dispatcher, backends, sessions))
}

pub async fn run_serve(config: Option<PathBuf>, bind_addr: Option<String>) -> Result<()> {
    let config_path = resolve_config_path(config);
    let mut config = load_config(&config_path)?;
    if let Some(addr) = bind_addr {
        config.server.bind_addr = addr;
    }
    let config = Arc::new(config);

    let (dispatcher, backends, sessions) = build_dispatcher(&config)?;
    let dispatcher = Arc::new(dispatcher);

    if !config.server.warmup_targets.is_empty() {
        tracing::info!(targets = ?config.server.warmup_targets, "running strict startup warmup");
        backends
            .warmup_strict(&config.server.warmup_targets)
            .await
            .context("strict startup warmup failed")?;
    }

    let sweeper = tokio::spawn(run_expiry_sweeper(sessions, backends, Duration::from_secs(30)));

    let state = AppState::new(dispatcher.clone(), config.clone());
    let shutdown = state.shutdown.clone();

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding to {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, title = %config.server.title, "toolhost listening");

    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("shutdown requested via /shutdown");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested via ctrl-c");
                }
            }
        })
        .await
        .context("http server error")?;

    sweeper.abort();
    dispatcher.sessions().shutdown_all(dispatcher.backends()).await;
    dispatcher.backends().shutdown_all().await;

    Ok(())
}

pub async fn warmup_status(config: Option<PathBuf>) -> Result<()> {
    let config_path = resolve_config_path(config);
    let config = Arc::new(load_config(&config_path)?);
    let (dispatcher, ..) = build_dispatcher(&config)?;

    let results = dispatcher.backends().warmup_all().await;
    for name in dispatcher.backends().names() {
        match results.get(&name) {
            Some(Ok(_)) => println!("{name}: warmed_up"),
            Some(Err(e)) => println!("{name}: failed ({e})"),
            None => println!("{name}: unknown"),
        }
    }
    Ok(())
}

pub async fn check_config(config: Option<PathBuf>) -> Result<()> {
    let config_path = resolve_config_path(config);
    let config = load_config(&config_path)?;
    let pretty = serde_json::to_string_pretty(&serde_json::json!({
        "title": config.server.title,
        "session_ttl_secs": config.server.session_ttl_secs,
        "warmup_targets": config.server.warmup_targets,
        "bind_addr": config.server.bind_addr,
        "resources": config.resources.keys().collect::<Vec<_>>(),
        "apis": config.apis.keys().collect::<Vec<_>>(),
    }))
    .context("serializing resolved config")?;
    println!("{pretty}");
    Ok(())
}

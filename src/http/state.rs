// Shared axum handler state.
//
// `AppState` wraps the pieces every handler needs behind cheap `Arc`
// clones, rather than threading individual fields through every handler
// signature.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
    /// Notified once by the `/shutdown` handler; `main` awaits it to drive
    /// axum's graceful-shutdown future, which tears down every session and
    /// then calls every backend's `shutdown`.
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, config: Arc<ServerConfig>) -> Self {
        Self {
            dispatcher,
            config,
            started_at: Instant::now(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

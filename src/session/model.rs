// Session data model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Error,
}

/// The mutable part of a session: everything that can change after
/// creation without touching the session router's structural map.
#[derive(Debug)]
pub struct SessionState {
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub data: Value,
    pub error: Option<String>,
}

/// Per-worker, per-resource-type handle onto a backend's mutable state.
/// The identity fields are immutable after creation; `state`
/// holds everything that mutates on refresh/initialize/error.
pub struct Session {
    pub session_id: String,
    pub session_name: String,
    pub worker_id: String,
    pub resource_type: String,
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub auto_created: bool,
    pub compatibility_mode: bool,
    pub custom_name: Option<String>,
    pub state: RwLock<SessionState>,
}

impl Session {
    pub async fn is_expired(&self) -> bool {
        self.state.read().await.expires_at < Utc::now()
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.status
    }

    pub async fn refresh(&self, ttl: Duration) {
        let mut state = self.state.write().await;
        let now = Utc::now();
        state.last_activity = now;
        state.expires_at = now + ttl;
    }

    pub async fn mark_active(&self, data: Value) {
        let mut state = self.state.write().await;
        state.status = SessionStatus::Active;
        state.data = data;
        state.error = None;
    }

    pub async fn mark_error(&self, message: impl Into<String>) {
        let mut state = self.state.write().await;
        state.status = SessionStatus::Error;
        state.error = Some(message.into());
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        SessionSnapshot {
            session_id: self.session_id.clone(),
            session_name: self.session_name.clone(),
            worker_id: self.worker_id.clone(),
            resource_type: self.resource_type.clone(),
            status: state.status,
            auto_created: self.auto_created,
            compatibility_mode: self.compatibility_mode,
            created_at: self.created_at,
            last_activity: state.last_activity,
            expires_at: state.expires_at,
        }
    }
}

/// A cheap, clonable read-only view of a session for API responses,
/// used by the list-sessions endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub session_name: String,
    pub worker_id: String,
    pub resource_type: String,
    pub status: SessionStatus,
    pub auto_created: bool,
    pub compatibility_mode: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// `[A-Za-z0-9_-]` only, capped in length — keeps worker ids and custom
/// names safe to embed in logs, file paths, and pool item naming.
pub fn sanitize_identifier(raw: &str, max_len: usize) -> Option<String> {
    let unsafe_chars = Regex::new(r"[^A-Za-z0-9_-]").expect("static regex");
    let cleaned = unsafe_chars.replace_all(raw, "-");
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_len).collect())
}

pub fn new_session_id(session_name: &str) -> String {
    format!("{session_name}_{}", &Uuid::new_v4().simple().to_string()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(
            sanitize_identifier("worker/one two!", 32).as_deref(),
            Some("worker-one-two")
        );
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_identifier(&long, 10).unwrap().len(), 10);
    }

    #[test]
    fn sanitize_empty_input_is_none() {
        assert!(sanitize_identifier("///", 32).is_none());
    }
}

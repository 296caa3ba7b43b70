//! Per-session conversation state.
//!
//! Each session sits behind its own async mutex; holding that mutex is what
//! makes a processing pass exclusive for the session key.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use clawgate_types::{Turn, now_millis};

/// Conversation state for one session key.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub history: Vec<Turn>,
    pub created_at: i64,
    pub last_active_at: i64,
}

impl Session {
    fn new(key: &str) -> Self {
        let now = now_millis();
        Self {
            key: key.to_string(),
            history: Vec::new(),
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = now_millis();
    }
}

/// Information about a managed session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_key: String,
    pub message_count: usize,
    pub created_at: i64,
    pub last_active_at: i64,
    /// A processing pass currently holds the session.
    pub busy: bool,
}

/// Lazily created sessions keyed by session key.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for `key`, creating it on first use.
    pub async fn get_or_create(&self, key: &str) -> Arc<Mutex<Session>> {
        if let Some(session) = self.sessions.read().await.get(key) {
            return session.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(session = %key, "Creating session");
                Arc::new(Mutex::new(Session::new(key)))
            })
            .clone()
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Snapshot of a session's history. Waits for an in-flight pass to finish,
    /// so the result is never half-mutated.
    pub async fn history(&self, key: &str) -> Option<Vec<Turn>> {
        let session = self.get(key).await?;
        let guard = session.lock().await;
        Some(guard.history.clone())
    }

    /// Drop a session (for external eviction policies).
    pub async fn remove(&self, key: &str) -> bool {
        self.sessions.write().await.remove(key).is_some()
    }

    /// List sessions, sorted by key. Busy sessions are reported without counts.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(key, session)| match session.try_lock() {
                Ok(s) => SessionInfo {
                    session_key: key.clone(),
                    message_count: s.history.len(),
                    created_at: s.created_at,
                    last_active_at: s.last_active_at,
                    busy: false,
                },
                Err(_) => SessionInfo {
                    session_key: key.clone(),
                    message_count: 0,
                    created_at: 0,
                    last_active_at: 0,
                    busy: true,
                },
            })
            .collect();
        infos.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

//! Registry of live remote sessions.
//!
//! Each gateway socket owns exactly one session. The registry only tracks
//! them so the server can enforce a session cap and close everything on
//! shutdown; all use of a session goes through the hub that created it.

use super::remote::RemoteHost;
use sshgate_core::{GateError, GateResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Opaque session identifier (32 hex chars).
pub type SessionId = String;

/// All active sessions, keyed by id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<dyn RemoteHost>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Whether another session may be opened right now.
    pub async fn has_capacity(&self) -> bool {
        self.sessions.read().await.len() < self.max_sessions
    }

    /// Register an opened session and return its id.
    pub async fn insert(&self, host: Arc<dyn RemoteHost>) -> GateResult<SessionId> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(GateError::Other(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }

        let mut session_id = generate_session_id();
        while sessions.contains_key(&session_id) {
            session_id = generate_session_id();
        }
        sessions.insert(session_id.clone(), host);
        info!(session_id = %session_id, active = sessions.len(), "session registered");
        Ok(session_id)
    }

    /// Forget a session. The caller is responsible for closing it.
    pub async fn remove(&self, session_id: &str) -> GateResult<Arc<dyn RemoteHost>> {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(session_id) {
            Some(host) => {
                info!(session_id, active = sessions.len(), "session removed");
                Ok(host)
            }
            None => Err(GateError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Close and drop every session (server shutdown).
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        let count = drained.len();
        for (session_id, host) in drained {
            debug!(session_id = %session_id, "closing session on shutdown");
            host.close().await;
        }
        count
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> SessionId {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

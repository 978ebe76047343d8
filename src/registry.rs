//! Live sessions and function ownership.
//!
//! Two maps, each behind its own lock: login → session handle, and
//! function name → owning login. Every operation holds the relevant lock
//! for its full duration and never across I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::broker::Dispatch;
use crate::protocol::FrameSink;

/// Identifies one accepted connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What other connections need to reach a signed-in session.
pub struct SessionHandle {
    pub id: SessionId,
    pub login: String,
    pub peer: SocketAddr,
    /// Write side of the session's connection.
    pub outbound: FrameSink,
    /// Request slot, drained by the session's own loop once it is a worker.
    pub requests: mpsc::Sender<Dispatch>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<SessionHandle>>>>,
    functions: Arc<Mutex<HashMap<String, String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the session for `handle.login`, returning the
    /// superseded one.
    pub async fn register(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(handle.login.clone(), handle)
    }

    pub async fn lookup(&self, login: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.lock().await;
        sessions.get(login).cloned()
    }

    /// Remove `login` if it still belongs to session `id`.
    ///
    /// A session superseded by a re-login must not evict its replacement.
    pub async fn remove(&self, login: &str, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(login) {
            Some(current) if current.id == id => {
                sessions.remove(login);
                true
            }
            _ => false,
        }
    }

    /// Remove session `id` and release every function its login owns, as one
    /// step. Returns `None` when `login` no longer belongs to `id`.
    ///
    /// The sessions lock is held across the release, so a replacement
    /// signing in meanwhile cannot post a function that then gets dropped.
    pub async fn remove_and_release(&self, login: &str, id: SessionId) -> Option<Vec<String>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(login) {
            Some(current) if current.id == id => {
                sessions.remove(login);
            }
            _ => return None,
        }
        Some(self.release_functions_of(login).await)
    }

    /// Every live session except `login`'s.
    pub async fn others(&self, login: &str) -> Vec<Arc<SessionHandle>> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|(key, _)| key.as_str() != login)
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Bind `name` to `login` unless some login already owns it.
    pub async fn bind_function(&self, name: &str, login: &str) -> bool {
        let mut functions = self.functions.lock().await;
        if functions.contains_key(name) {
            return false;
        }
        functions.insert(name.to_string(), login.to_string());
        true
    }

    pub async fn resolve_function(&self, name: &str) -> Option<String> {
        let functions = self.functions.lock().await;
        functions.get(name).cloned()
    }

    /// Drop every function owned by `login`, returning their names.
    pub async fn release_functions_of(&self, login: &str) -> Vec<String> {
        let mut functions = self.functions.lock().await;
        let owned: Vec<String> = functions
            .iter()
            .filter(|(_, owner)| owner.as_str() == login)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            functions.remove(name);
        }
        owned
    }
}

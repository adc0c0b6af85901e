//! Process-wide record of live sessions and the usernames they hold.

use std::{
    collections::{BTreeMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::ChatError,
    session::{SessionHandle, SessionId},
};

/// Shared membership table.
///
/// The lock only ever guards map updates and copies; callers deliver to the
/// sessions they get from [`Registry::snapshot`] after it has been released.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct RegistryInner {
    // Keyed by id so snapshots come out in join order.
    sessions: BTreeMap<SessionId, SessionHandle>,
    usernames: HashSet<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Inserts `name` if nobody holds it. Exactly one of several concurrent
    /// claims for the same name returns `true`.
    pub async fn try_claim(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.usernames.insert(name.to_string())
    }

    pub async fn release(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.usernames.remove(name);
    }

    pub async fn add_session(&self, handle: SessionHandle) {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(handle.id(), handle);
    }

    pub async fn remove_session(&self, id: SessionId) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(&id)
    }

    /// Claims the handle's username and adds the handle in one critical
    /// section, so no observer sees a claimed name without its session.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        if !inner.usernames.insert(handle.username().to_string()) {
            return Err(ChatError::NameCollision(handle.username().to_string()));
        }

        debug!(id = %handle.id(), username = handle.username(), "session registered");
        inner.sessions.insert(handle.id(), handle);
        Ok(())
    }

    /// Removes the session and frees its username. Returns `None` if the
    /// session was never registered or has already been removed.
    pub async fn unregister(&self, id: SessionId) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().await;
        let handle = inner.sessions.remove(&id)?;
        inner.usernames.remove(handle.username());
        debug!(%id, username = handle.username(), "session unregistered");
        Some(handle)
    }

    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        let inner = self.inner.lock().await;
        inner.sessions.values().cloned().collect()
    }

    pub async fn usernames_snapshot(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .values()
            .map(|handle| handle.username().to_string())
            .collect()
    }

    pub async fn contains_username(&self, name: &str) -> bool {
        self.inner.lock().await.usernames.contains(name)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.sessions.is_empty()
    }
}

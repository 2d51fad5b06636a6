//! Session registry for tracking live connections

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::SessionState;

/// Registry row for one live session
#[derive(Debug)]
struct SessionEntry {
    device_id: String,
    subject: String,
    connected_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
}

/// Read-only view of a registered session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub connection_id: Uuid,
    pub device_id: String,
    pub subject: String,
    pub connected_at: DateTime<Utc>,
    pub state: SessionState,
}

/// Process-wide table of live sessions
///
/// Lookups take a shared lock; registration and removal are serialized.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    changed: Notify,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return the token that cancels it
    ///
    /// Sessions registered after [`drain`](Self::drain) has started are
    /// cancelled immediately.
    pub async fn register(
        &self,
        connection_id: Uuid,
        device_id: &str,
        subject: &str,
        state: watch::Receiver<SessionState>,
    ) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        let entry = SessionEntry {
            device_id: device_id.to_string(),
            subject: subject.to_string(),
            connected_at: Utc::now(),
            cancel: cancel.clone(),
            state,
        };
        self.sessions.write().await.insert(connection_id, entry);
        self.changed.notify_waiters();

        tracing::debug!(%connection_id, device_id, "session registered");
        cancel
    }

    /// Remove a session, returning whether it was present
    pub async fn unregister(&self, connection_id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&connection_id).is_some();
        self.changed.notify_waiters();
        if removed {
            tracing::debug!(%connection_id, "session unregistered");
        }
        removed
    }

    /// Ask one session to close
    pub async fn evict(&self, connection_id: Uuid) -> bool {
        let sessions = self.sessions.read().await;
        let Some(entry) = sessions.get(&connection_id) else {
            return false;
        };
        entry.cancel.cancel();
        true
    }

    /// Visit every registered session
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SessionSummary),
    {
        let sessions = self.sessions.read().await;
        for (id, entry) in sessions.iter() {
            f(&summarize(*id, entry));
        }
    }

    /// Snapshot of every registered session
    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let mut out = Vec::new();
        self.for_each(|s| out.push(s.clone())).await;
        out
    }

    /// Look up one session
    pub async fn get(&self, connection_id: Uuid) -> Option<SessionSummary> {
        self.sessions
            .read()
            .await
            .get(&connection_id)
            .map(|entry| summarize(connection_id, entry))
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check if no sessions are registered
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every session and wait for all of them to unregister
    ///
    /// Returns `false` if sessions remain when `timeout` elapses.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.len().await;
            if remaining == 0 {
                tracing::info!("all sessions drained");
                return true;
            }
            tracing::debug!(remaining, "waiting for sessions to close");

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let remaining = self.len().await;
                tracing::warn!(remaining, "session drain timed out");
                return false;
            }
        }
    }
}

fn summarize(connection_id: Uuid, entry: &SessionEntry) -> SessionSummary {
    SessionSummary {
        connection_id,
        device_id: entry.device_id.clone(),
        subject: entry.subject.clone(),
        connected_at: entry.connected_at,
        state: *entry.state.borrow(),
    }
}

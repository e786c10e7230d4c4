//! Concurrent map of live sessions.
//!
//! Backed by a sharded `DashMap`, so registering or removing one session only
//! locks the shard its id hashes to; unrelated sessions never contend on a
//! single global lock.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::session::SessionEvent;
use crate::wsproto::Frame;

/// Opaque, immutable session identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().as_simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Cheap, cloneable address of a running session's event loop.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    peer: Option<SocketAddr>,
    opened_at: DateTime<Utc>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Hand a client frame to the session. Returns false once the session ended.
    pub fn client_message(&self, frame: Frame) -> bool {
        self.send(SessionEvent::Client(frame))
    }

    pub fn client_closed(&self) -> bool {
        self.send(SessionEvent::ClientClosed)
    }

    pub fn shutdown(&self) -> bool {
        self.send(SessionEvent::Shutdown)
    }

    pub fn send(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves once the session's event loop has dropped its receiver.
    pub async fn closed(&self) {
        self.events.closed().await
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session under `id`.
    ///
    /// The insert-if-absent is a single entry operation, so two racing
    /// `create` calls for the same id cannot both succeed.
    pub fn create(
        &self,
        id: SessionId,
        peer: Option<SocketAddr>,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), RelayError> {
        match self.sessions.entry(id) {
            Entry::Occupied(entry) => Err(RelayError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = SessionHandle {
                    id: entry.key().clone(),
                    peer,
                    opened_at: Utc::now(),
                    events: tx,
                };
                entry.insert(handle.clone());
                debug!(session_id = %handle.id, "session registered");
                Ok((handle, rx))
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<SessionHandle> {
        let removed = self.sessions.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(session_id = %id, "session unregistered");
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every live session. No shard guard outlives the call.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Ask every live session to close its upstream and stop.
    pub fn shutdown_all(&self) -> usize {
        let handles = self.handles();
        let notified = handles.iter().filter(|handle| handle.shutdown()).count();
        if notified > 0 {
            info!(sessions = notified, "shutting down live sessions");
        }
        notified
    }
}

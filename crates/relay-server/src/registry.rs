use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_core::{ConnectionId, OutboundFrame};
use relay_telemetry::CONNECTIONS_ACTIVE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
    #[error("user not registered")]
    NotRegistered,
}

/// Write side of one live WebSocket session.
///
/// Frames go through a bounded queue to the session's writer task; only that
/// task touches the socket.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            cancel,
            superseded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn send(&self, frame: &OutboundFrame) -> Result<(), SendError> {
        self.send_raw(frame.to_json())
    }

    pub fn send_raw(&self, text: String) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the owning session to shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Close because a newer session took over this identity.
    pub fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Process-local map from user id to the live session for that id.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `user_id`. Returns the replaced handle.
    pub fn register(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let prior = self.entries.insert(user_id.to_owned(), handle);
        self.report();
        prior
    }

    /// Remove `user_id` unconditionally. No-op if absent.
    pub fn unregister(&self, user_id: &str) -> Option<ConnectionHandle> {
        let removed = self.entries.remove(user_id).map(|(_, h)| h);
        self.report();
        removed
    }

    /// Remove `user_id` only while it still maps to `conn_id`.
    pub fn unregister_connection(&self, user_id: &str, conn_id: &ConnectionId) -> bool {
        let removed = self
            .entries
            .remove_if(user_id, |_, h| h.id() == conn_id)
            .is_some();
        self.report();
        removed
    }

    /// Drop a handle that failed a send and tell its session to close.
    pub fn evict(&self, user_id: &str, handle: &ConnectionHandle) {
        if self.unregister_connection(user_id, handle.id()) {
            tracing::warn!(user_id, conn_id = %handle.id(), "evicted unresponsive connection");
        }
        handle.close();
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.entries.get(user_id).map(|e| e.value().clone())
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Snapshot of registered ids.
    pub fn list_ids(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Queue a frame for `user_id`.
    pub fn send_to(&self, user_id: &str, frame: &OutboundFrame) -> Result<(), SendError> {
        self.lookup(user_id)
            .ok_or(SendError::NotRegistered)?
            .send(frame)
    }

    fn report(&self) {
        metrics::gauge!(CONNECTIONS_ACTIVE).set(self.entries.len() as f64);
    }
}

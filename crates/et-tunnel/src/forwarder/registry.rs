//! Active connection registry

use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Identifier of one accepted local connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State kept for a live connection
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Local client address
    pub peer: SocketAddr,
    /// Cancels the connection's pipe
    pub cancel: CancellationToken,
    /// Handle of the pipe task, set right after spawning
    pub abort: Option<AbortHandle>,
}

impl ConnectionEntry {
    /// Force the connection closed
    pub fn terminate(&self) {
        self.cancel.cancel();
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Connections indexed by ID
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted connection
    pub fn register(&self, peer: SocketAddr, cancel: CancellationToken) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.connections.insert(
            id,
            ConnectionEntry {
                peer,
                cancel,
                abort: None,
            },
        );
        id
    }

    /// Record the pipe task of `id`; ignored if it already finished
    pub fn attach(&self, id: ConnectionId, abort: AbortHandle) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.abort = Some(abort);
        }
    }

    /// Stop tracking `id`
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.connections.remove(&id).map(|(_, entry)| entry)
    }

    /// Remove and return every tracked connection
    pub fn drain(&self) -> Vec<ConnectionEntry> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

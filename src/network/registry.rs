//! Connection Registry
//!
//! Concurrent map from remote address to live connection.
//!
//! Connections do not remove themselves. On close each one pushes its id onto
//! a bounded queue, and a single reclaimer thread turns those notifications
//! into deletes, so the close path never contends for the write lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, TryRecvError};
use parking_lot::RwLock;

use crate::error::Result;
use crate::network::Connection;
use crate::protocol::Protocol;

/// Live connections keyed by [`Connection::id`]
pub struct Registry<P: Protocol> {
    connections: RwLock<HashMap<String, Arc<Connection<P>>>>,
}

impl<P: Protocol> Registry<P> {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite (write lock)
    pub fn put(&self, id: impl Into<String>, conn: Arc<Connection<P>>) {
        self.connections.write().insert(id.into(), conn);
    }

    /// Look up a connection (read lock)
    pub fn get(&self, id: &str) -> Option<Arc<Connection<P>>> {
        self.connections.read().get(id).cloned()
    }

    /// Remove an entry; removing a missing id is a no-op (write lock)
    pub fn delete(&self, id: &str) -> Option<Arc<Connection<P>>> {
        self.connections.write().remove(id)
    }

    /// Point-in-time copy of every registered connection
    pub fn get_all(&self) -> Vec<Arc<Connection<P>>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Remove a connection and close it without `on_disconnected`
    pub fn evict(&self, id: &str) -> Option<Arc<Connection<P>>> {
        let conn = self.delete(id)?;
        conn.close_silent();
        Some(conn)
    }

    /// Delete `id` only while it still maps to a closed connection
    ///
    /// A fresh connection from the same remote address may have replaced the
    /// entry since the notification was sent.
    fn reclaim(&self, id: &str) -> bool {
        let mut connections = self.connections.write();
        match connections.get(id) {
            Some(conn) if conn.is_closed() => {
                connections.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Start the reclaimer thread
    ///
    /// It exits once every sender feeding `closed` has been dropped, which
    /// happens after the owning server and all of its open connections are
    /// gone.
    pub(crate) fn spawn_reclaimer(
        self: &Arc<Self>,
        closed: Receiver<String>,
        idle: Duration,
    ) -> Result<JoinHandle<()>> {
        let registry = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tcpcore-reclaimer".to_string())
            .spawn(move || loop {
                match closed.try_recv() {
                    Ok(id) => {
                        if registry.reclaim(&id) {
                            tracing::trace!(peer = %id, "Reclaimed connection");
                        }
                    }
                    Err(TryRecvError::Empty) => thread::sleep(idle),
                    Err(TryRecvError::Disconnected) => {
                        tracing::debug!("Reclaimer stopped");
                        return;
                    }
                }
            })?;
        Ok(handle)
    }
}

impl<P: Protocol> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

//! ConnectionRegistry: the set of live connections, keyed by id.
//!
//! # Locking
//!
//! One `RwLock` guards the map structure only.  Per-connection state has
//! its own locks inside [`Connection`], and no caller holds the registry
//! lock across I/O or while invoking host code: iteration goes through
//! [`ConnectionRegistry::snapshot`], which clones the `Arc`s and releases
//! the lock before returning.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use ws_core::ConnectionId;

use super::connection::Connection;

/// The registry is at its configured connection limit.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("connection limit of {limit} reached")]
pub struct CapacityError {
    pub limit: usize,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Adds `connection` unless the registry is full.
    ///
    /// The capacity check and the insert happen under one write lock, so
    /// concurrent accepts can never overshoot the limit.
    pub fn insert(&self, connection: Arc<Connection>) -> Result<ConnectionId, CapacityError> {
        let mut map = self.connections.write();
        if map.len() >= self.capacity {
            return Err(CapacityError {
                limit: self.capacity,
            });
        }
        let id = connection.id();
        map.insert(id, connection);
        Ok(id)
    }

    /// Removes and returns the entry for `id`.
    ///
    /// The removed connection is cancelled so its session releases the
    /// transport even if the removal did not come from the session itself.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if let Some(conn) = &removed {
            conn.abort();
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Clones every entry out of the map.  Callers may `remove` while
    /// walking the result.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Runs `f` on every entry of a snapshot.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for conn in self.snapshot() {
            f(&conn);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connections in the open phase.
    pub fn open_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_open())
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

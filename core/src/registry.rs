//! Connection Registry
//!
//! Bidirectional `ConnectionId` <-> `PeerHandle` map. Owned by the worker
//! thread; nothing else reads it. The facade only ever sees ids carried in
//! queue items.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::native::PeerHandle;

/// Stable identifier for a connection outside the native layer.
/// Ids start at 1 and increase monotonically within one worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub handle: PeerHandle,
    pub addr: SocketAddr,
}

/// Why a connect was not registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRefused {
    /// Handle is already registered under this id
    Duplicate(ConnectionId),
    /// Registry is at capacity
    Full,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    by_id: HashMap<ConnectionId, ConnectionRecord>,
    by_handle: HashMap<PeerHandle, ConnectionId>,
    next_id: u64,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        ConnectionRegistry {
            by_id: HashMap::with_capacity(capacity),
            by_handle: HashMap::with_capacity(capacity),
            next_id: 1,
            capacity,
        }
    }

    /// Register a freshly connected peer and allocate its id
    pub fn on_connect(
        &mut self,
        handle: PeerHandle,
        addr: SocketAddr,
    ) -> Result<ConnectionId, RegisterRefused> {
        if let Some(&existing) = self.by_handle.get(&handle) {
            return Err(RegisterRefused::Duplicate(existing));
        }
        if self.by_id.len() >= self.capacity {
            return Err(RegisterRefused::Full);
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.by_handle.insert(handle, id);
        self.by_id.insert(id, ConnectionRecord { id, handle, addr });
        Ok(id)
    }

    /// Retire a peer. Returns `None` when the handle is already gone, which
    /// happens routinely (kick followed by the native disconnect).
    pub fn on_disconnect(&mut self, handle: PeerHandle) -> Option<ConnectionId> {
        let id = self.by_handle.remove(&handle)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn resolve(&self, id: ConnectionId) -> Option<PeerHandle> {
        self.by_id.get(&id).map(|r| r.handle)
    }

    pub fn lookup_handle(&self, handle: PeerHandle) -> Option<ConnectionId> {
        self.by_handle.get(&handle).copied()
    }

    /// Remove every record, in id order
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        self.by_handle.clear();
        let mut records: Vec<_> = self.by_id.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Check both directions agree
    pub fn is_consistent(&self) -> bool {
        self.by_id.len() == self.by_handle.len()
            && self.by_id.iter().all(|(id, record)| {
                record.id == *id && self.by_handle.get(&record.handle) == Some(id)
            })
    }
}

//! Buffer Pool
//!
//! Size-classed lease/return of payload buffers. The worker rents a buffer for
//! every received payload, the facade drops it after dispatch and the buffer
//! goes back to its class. Requests above the largest class get a one-off
//! allocation that is freed instead of returned.

use bytes::BytesMut;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::PoolError;

/// Default size classes in bytes
pub const DEFAULT_CLASSES: [usize; 5] = [256, 1024, 4096, 16 * 1024, 64 * 1024];

/// Default number of idle buffers kept per class
pub const DEFAULT_RETAIN_PER_CLASS: usize = 256;

/// Counters describing pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub rents: u64,
    pub returns: u64,
    /// Rents that had to allocate because the class was empty
    pub misses: u64,
    /// Rents above the largest class
    pub one_off: u64,
    pub rejected_returns: u64,
    pub outstanding: usize,
    /// Idle buffers per class, in class order
    pub idle: Vec<usize>,
}

struct PoolState {
    free: Vec<Vec<BytesMut>>,
    outstanding: HashSet<u64>,
    next_lease: u64,
    stats: PoolStats,
}

struct PoolInner {
    classes: Vec<usize>,
    retain: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a leased buffer back into its class.
    fn reclaim(&self, lease: u64, class: usize, mut bytes: BytesMut) -> Result<(), PoolError> {
        let mut state = self.lock();
        if !state.outstanding.remove(&lease) {
            state.stats.rejected_returns += 1;
            return Err(PoolError::DoubleReturn(lease));
        }
        state.stats.returns += 1;

        let class_size = self.classes[class];
        if bytes.capacity() >= class_size && state.free[class].len() < self.retain {
            bytes.clear();
            state.free[class].push(bytes);
        }
        Ok(())
    }
}

struct Lease {
    id: u64,
    class: usize,
    pool: Weak<PoolInner>,
}

/// Thread-safe pool handle; clones share the same storage
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool. `classes` must be non-empty and strictly increasing.
    pub fn new(classes: &[usize], retain_per_class: usize) -> Self {
        let mut classes = classes.to_vec();
        classes.sort_unstable();
        classes.dedup();

        let free = classes.iter().map(|_| Vec::new()).collect();
        BufferPool {
            inner: Arc::new(PoolInner {
                classes,
                retain: retain_per_class,
                state: Mutex::new(PoolState {
                    free,
                    outstanding: HashSet::new(),
                    next_lease: 1,
                    stats: PoolStats::default(),
                }),
            }),
        }
    }

    /// Lease a buffer with capacity of at least `min_size`
    pub fn rent(&self, min_size: usize) -> PooledBuffer {
        let Some(class) = self.inner.classes.iter().position(|&c| c >= min_size) else {
            self.inner.lock().stats.one_off += 1;
            tracing::trace!("One-off buffer of {} bytes", min_size);
            return PooledBuffer {
                bytes: BytesMut::with_capacity(min_size),
                lease: None,
            };
        };

        let mut state = self.inner.lock();
        let id = state.next_lease;
        state.next_lease += 1;
        state.outstanding.insert(id);
        state.stats.rents += 1;

        let bytes = match state.free[class].pop() {
            Some(bytes) => bytes,
            None => {
                state.stats.misses += 1;
                BytesMut::with_capacity(self.inner.classes[class])
            }
        };

        PooledBuffer {
            bytes,
            lease: Some(Lease {
                id,
                class,
                pool: Arc::downgrade(&self.inner),
            }),
        }
    }

    /// Lease a buffer and copy `data` into it
    pub fn copy_from(&self, data: &[u8]) -> PooledBuffer {
        let mut buffer = self.rent(data.len());
        buffer.bytes.extend_from_slice(data);
        buffer
    }

    /// Explicitly return a buffer. Dropping a buffer returns it as well; this
    /// variant reports buffers that do not belong here.
    pub fn give_back(&self, mut buffer: PooledBuffer) -> Result<(), PoolError> {
        let owned = match &buffer.lease {
            None => return Err(PoolError::Unpooled),
            Some(lease) => std::ptr::eq(lease.pool.as_ptr(), Arc::as_ptr(&self.inner)),
        };
        if !owned {
            self.inner.lock().stats.rejected_returns += 1;
            // Drop sends it back to the pool that leased it.
            return Err(PoolError::ForeignBuffer);
        }

        match buffer.lease.take() {
            Some(lease) => {
                let bytes = std::mem::take(&mut buffer.bytes);
                self.inner.reclaim(lease.id, lease.class, bytes)
            }
            None => Err(PoolError::Unpooled),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let mut stats = state.stats.clone();
        stats.outstanding = state.outstanding.len();
        stats.idle = state.free.iter().map(Vec::len).collect();
        stats
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(&DEFAULT_CLASSES, DEFAULT_RETAIN_PER_CLASS)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("classes", &self.inner.classes)
            .field("retain", &self.inner.retain)
            .finish()
    }
}

/// Storage for exactly one payload in transit
pub struct PooledBuffer {
    bytes: BytesMut,
    lease: Option<Lease>,
}

impl PooledBuffer {
    /// Size of the class this buffer was leased from, `None` for one-off buffers
    pub fn capacity_class(&self) -> Option<usize> {
        let lease = self.lease.as_ref()?;
        let pool = lease.pool.upgrade()?;
        pool.classes.get(lease.class).copied()
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        // Pool already gone: nothing to return to.
        let Some(pool) = lease.pool.upgrade() else {
            return;
        };
        let bytes = std::mem::take(&mut self.bytes);
        if let Err(e) = pool.reclaim(lease.id, lease.class, bytes) {
            tracing::warn!("Buffer return rejected: {}", e);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.bytes.len())
            .field("lease", &self.lease.as_ref().map(|l| l.id))
            .finish()
    }
}

//! Shared buffer pool
//!
//! Storage for [`IoBuffer`]s is recycled through a coarse-locked free list so
//! steady-state request traffic does not allocate. The pool is the one
//! structure touched concurrently by every reactor thread: the free list sits
//! behind a `parking_lot::Mutex`, the accounting counters are atomics.
//!
//! Every allocation must be matched by exactly one release. The counters make
//! that observable ([`PoolStats::outstanding`] returns to zero once every
//! buffer is gone) and a release that would drive `outstanding` below zero is
//! treated as a contract violation: it panics in debug builds and is logged and
//! ignored in release builds.

use crate::buffer::IoBuffer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Capacity handed out when a caller asks for less
pub const DEFAULT_INITIAL_CAPACITY: usize = 128;

/// Upper bound on storage blocks kept on the free list
pub const DEFAULT_MAX_POOLED: usize = 1024;

/// Largest block kept on the free list at full size
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Source of I/O buffers
pub trait BufferAllocator: Send + Sync {
    /// Buffer with at least `min_capacity` writable bytes, position 0
    fn allocate(&self, min_capacity: usize) -> IoBuffer;

    /// Snapshot of allocation accounting
    fn stats(&self) -> PoolStats;
}

/// Allocation accounting snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub allocated: u64,
    pub released: u64,
    pub outstanding: u64,
    /// Storage blocks currently parked on the free list
    pub pooled: usize,
}

pub(crate) struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    initial_capacity: usize,
    max_pooled: usize,
    max_block_size: usize,
    allocated: AtomicU64,
    released: AtomicU64,
    outstanding: AtomicU64,
}

impl PoolShared {
    pub(crate) fn recycle(&self, mut storage: Vec<u8>) {
        let guarded = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if guarded.is_err() {
            error!(
                allocated = self.allocated.load(Ordering::Relaxed),
                released = self.released.load(Ordering::Relaxed),
                "Buffer released more often than allocated; ignoring release"
            );
            debug_assert!(false, "buffer pool double release");
            return;
        }
        self.released.fetch_add(1, Ordering::Relaxed);

        if storage.len() > self.max_block_size {
            storage.truncate(self.max_block_size);
            storage.shrink_to_fit();
        }
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(storage);
        }
    }
}

/// Thread-safe pool of recyclable buffer storage
///
/// Cloning is cheap and every clone shares the same free list and counters.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(initial_capacity: usize, max_pooled: usize) -> Self {
        Self::with_limits(initial_capacity, max_pooled, DEFAULT_MAX_BLOCK_SIZE)
    }

    /// Blocks that grew past `max_block_size` are shrunk to it on release
    pub fn with_limits(initial_capacity: usize, max_pooled: usize, max_block_size: usize) -> Self {
        let initial_capacity = initial_capacity.max(1);
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                initial_capacity,
                max_pooled,
                max_block_size: max_block_size.max(initial_capacity),
                allocated: AtomicU64::new(0),
                released: AtomicU64::new(0),
                outstanding: AtomicU64::new(0),
            }),
        }
    }

    /// Buffers not yet returned
    pub fn outstanding(&self) -> u64 {
        self.shared.outstanding.load(Ordering::Acquire)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_POOLED)
    }
}

impl BufferAllocator for BufferPool {
    fn allocate(&self, min_capacity: usize) -> IoBuffer {
        let capacity = min_capacity.max(self.shared.initial_capacity);
        let recycled = self.shared.free.lock().pop();
        let storage = match recycled {
            Some(mut storage) => {
                if storage.len() < capacity {
                    storage.resize(capacity, 0);
                }
                storage
            }
            None => vec![0; capacity],
        };

        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        IoBuffer::pooled(storage, Arc::clone(&self.shared))
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
            pooled: self.shared.free.lock().len(),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_allocate_release_accounting() {
        let pool = BufferPool::new(16, 8);
        let a = pool.allocate(4);
        let b = pool.allocate(64);
        assert!(a.capacity() >= 16);
        assert!(b.capacity() >= 64);
        assert_eq!(pool.outstanding(), 2);

        a.release();
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.pooled, 2);
    }

    #[test]
    fn test_storage_is_reused() {
        let pool = BufferPool::new(32, 8);
        let mut buf = pool.allocate(32);
        buf.write_u32(7);
        drop(buf);

        let buf = pool.allocate(8);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), buf.capacity());
        assert_eq!(pool.stats().pooled, 0);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let pool = BufferPool::new(8, 1);
        let bufs: Vec<_> = (0..4).map(|_| pool.allocate(8)).collect();
        drop(bufs);
        assert_eq!(pool.stats().pooled, 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_grown_buffer_returns_to_pool() {
        let pool = BufferPool::new(4, 8);
        let mut buf = pool.allocate(4);
        buf.write_bytes(&[0; 256]);
        drop(buf);
        assert_eq!(pool.allocate(1).capacity(), 256);
    }

    #[test]
    fn test_oversized_block_is_shrunk_on_release() {
        let pool = BufferPool::with_limits(16, 8, 1024);
        let mut buf = pool.allocate(16);
        buf.write_bytes(&vec![7; 1 << 20]);
        drop(buf);
        assert_eq!(pool.stats().pooled, 1);

        let reused = pool.allocate(1);
        assert_eq!(reused.capacity(), 1024);
        drop(reused);
        // A request larger than the retained block still gets what it asked for
        assert!(pool.allocate(4096).capacity() >= 4096);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let pool = BufferPool::new(64, 32);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..1_000 {
                        let mut buf = pool.allocate(64);
                        buf.write_i32(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.allocated, 8_000);
        assert_eq!(stats.released, 8_000);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double release")]
    fn test_release_without_allocation_panics_in_debug() {
        let pool = BufferPool::new(8, 8);
        pool.shared.recycle(vec![0; 8]);
    }
}

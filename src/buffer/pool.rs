//! Fixed-Chunk Buffer Pool
//!
//! A bounded ring of pre-allocated, equally sized chunks. The pool trades a
//! little extra allocation under load for never making a caller wait:
//!
//! - `allocate()` pops a chunk when one is available and otherwise creates a
//!   transient chunk of the configured size outside the lock.
//! - `recycle()` pushes a chunk back only while the ring has room, and only if
//!   the chunk was not grown beyond the configured chunk size. Anything else is
//!   simply dropped.
//!
//! The lock is held for index bookkeeping only; no allocation or zeroing
//! happens while it is held.

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Default total size of a processor's pool (16 MB)
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default chunk size (4 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Ring storage guarded by the pool lock.
#[derive(Debug)]
struct Ring {
    items: Box<[Option<BytesMut>]>,
    put_index: usize,
    take_index: usize,
    count: usize,
}

impl Ring {
    fn insert(&mut self, chunk: BytesMut) {
        self.items[self.put_index] = Some(chunk);
        self.put_index = self.inc(self.put_index);
        self.count += 1;
    }

    fn extract(&mut self) -> Option<BytesMut> {
        let chunk = self.items[self.take_index].take()?;
        self.take_index = self.inc(self.take_index);
        self.count -= 1;
        Some(chunk)
    }

    #[inline]
    fn inc(&self, i: usize) -> usize {
        if i + 1 == self.items.len() {
            0
        } else {
            i + 1
        }
    }
}

/// A bounded pool of fixed-size byte chunks.
///
/// # Example
///
/// ```
/// use mysqlmux::buffer::BufferPool;
///
/// let pool = BufferPool::new(16 * 1024, 4096);
/// assert_eq!(pool.capacity(), 4);
///
/// let chunk = pool.allocate();
/// assert_eq!(pool.size(), 3);
///
/// pool.recycle(chunk);
/// assert_eq!(pool.size(), 4);
/// ```
#[derive(Debug)]
pub struct BufferPool {
    chunk_size: usize,
    capacity: usize,
    ring: Mutex<Ring>,
    /// Chunks created because the ring was empty
    new_count: AtomicU64,
}

impl BufferPool {
    /// Creates a pool holding `ceil(buffer_size / chunk_size)` chunks, all
    /// allocated up front.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn new(buffer_size: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");

        let capacity = buffer_size.div_ceil(chunk_size).max(1);
        let mut ring = Ring {
            items: (0..capacity).map(|_| None).collect(),
            put_index: 0,
            take_index: 0,
            count: 0,
        };
        for _ in 0..capacity {
            ring.insert(BytesMut::with_capacity(chunk_size));
        }

        Self {
            chunk_size,
            capacity,
            ring: Mutex::new(ring),
            new_count: AtomicU64::new(0),
        }
    }

    /// Maximum number of chunks the pool retains.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size in bytes of every pooled chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks currently sitting in the pool.
    pub fn size(&self) -> usize {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner).count
    }

    /// Number of transient chunks created because the pool was empty.
    pub fn new_count(&self) -> u64 {
        self.new_count.load(Ordering::Relaxed)
    }

    /// Takes a chunk from the pool, or creates a transient one if the pool
    /// is exhausted. Never blocks on an empty pool.
    pub fn allocate(&self) -> BytesMut {
        let chunk = {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            if ring.count == 0 {
                None
            } else {
                ring.extract()
            }
        };

        match chunk {
            Some(chunk) => chunk,
            None => {
                self.new_count.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.chunk_size)
            }
        }
    }

    /// Returns a chunk to the pool.
    ///
    /// Chunks that grew past the chunk size are rejected, and chunks arriving
    /// while the pool is already full are dropped.
    pub fn recycle(&self, mut chunk: BytesMut) {
        if chunk.capacity() > self.chunk_size {
            return;
        }

        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.count != self.capacity {
            chunk.clear();
            ring.insert(chunk);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(BufferPool::new(16 * 1024, 4096).capacity(), 4);
        assert_eq!(BufferPool::new(16 * 1024 + 1, 4096).capacity(), 5);
        assert_eq!(BufferPool::new(100, 4096).capacity(), 1);
    }

    #[test]
    fn test_pool_starts_full() {
        let pool = BufferPool::new(8 * 4096, 4096);
        assert_eq!(pool.size(), 8);
        assert_eq!(pool.new_count(), 0);
    }

    #[test]
    fn test_allocate_takes_from_pool() {
        let pool = BufferPool::new(4 * 4096, 4096);
        let chunk = pool.allocate();
        assert!(chunk.capacity() >= 4096);
        assert!(chunk.is_empty());
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.new_count(), 0);
    }

    #[test]
    fn test_overflow_accounting() {
        let pool = BufferPool::new(4 * 4096, 4096);
        assert_eq!(pool.capacity(), 4);

        let chunks: Vec<_> = (0..6).map(|_| pool.allocate()).collect();

        assert_eq!(chunks.len(), 6);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.new_count(), 2);
    }

    #[test]
    fn test_recycle_clears_contents() {
        let pool = BufferPool::new(4096, 4096);
        let mut chunk = pool.allocate();
        chunk.put_slice(b"stale bytes");
        pool.recycle(chunk);

        let chunk = pool.allocate();
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_recycle_rejects_oversized_chunk() {
        let pool = BufferPool::new(2 * 4096, 4096);
        let _a = pool.allocate();
        assert_eq!(pool.size(), 1);

        pool.recycle(BytesMut::with_capacity(8192));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_recycle_beyond_capacity_is_dropped() {
        let pool = BufferPool::new(2 * 4096, 4096);
        assert_eq!(pool.size(), 2);

        pool.recycle(BytesMut::with_capacity(4096));
        pool.recycle(BytesMut::with_capacity(1024));
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_count_stays_within_bounds() {
        let pool = BufferPool::new(4 * 4096, 4096);
        let mut held = Vec::new();

        // Deterministic mix of allocations and recycles, including overflow
        // chunks and oversized chunks.
        let mut seed: u32 = 0x9e37_79b9;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 3 {
                0 => held.push(pool.allocate()),
                1 => {
                    if let Some(chunk) = held.pop() {
                        pool.recycle(chunk);
                    }
                }
                _ => pool.recycle(BytesMut::with_capacity(if seed % 2 == 0 {
                    4096
                } else {
                    65536
                })),
            }
            let size = pool.size();
            assert!(size <= pool.capacity(), "size {} exceeds capacity", size);
        }
    }

    #[test]
    fn test_concurrent_allocate_recycle() {
        let pool = Arc::new(BufferPool::new(16 * 4096, 4096));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let a = pool.allocate();
                        let b = pool.allocate();
                        pool.recycle(a);
                        pool.recycle(b);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.size() <= pool.capacity());
        assert_eq!(pool.size(), pool.capacity());
    }
}

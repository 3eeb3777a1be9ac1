//! Memory accounting shared by concurrent scan tasks and exported arrays.
//!
//! A pool only counts bytes; it never allocates. Holders of memory take a
//! [`MemoryReservation`], which returns its bytes to the pool when dropped,
//! so accounting stays balanced on every exit path.

use std::{
    fmt::Debug,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{QuarryError, Result};

/// Accounting for bytes held by scans and interchange exports.
///
/// Implementations must tolerate concurrent calls from many task executions.
pub trait MemoryPool: Send + Sync + Debug {
    /// Account for `bytes` more, or fail if a limit would be exceeded.
    fn try_grow(&self, bytes: usize) -> Result<()>;

    /// Return `bytes` to the pool.
    fn shrink(&self, bytes: usize);

    /// Bytes currently reserved.
    fn reserved(&self) -> usize;

    /// Highest value `reserved` has reached.
    fn peak(&self) -> usize;
}

/// Lock-free pool with an optional upper bound.
#[derive(Debug)]
pub struct TrackingMemoryPool {
    reserved: AtomicUsize,
    peak: AtomicUsize,
    limit: usize,
}

impl Default for TrackingMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingMemoryPool {
    /// Create an unbounded pool
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create a pool refusing reservations beyond `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            reserved: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl MemoryPool for TrackingMemoryPool {
    fn try_grow(&self, bytes: usize) -> Result<()> {
        let updated = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|next| *next <= self.limit)
            })
            .map_err(|current| QuarryError::ResourcesExhausted {
                requested: bytes,
                reserved: current,
                limit: self.limit,
            })?;
        self.peak.fetch_max(updated + bytes, Ordering::AcqRel);
        Ok(())
    }

    fn shrink(&self, bytes: usize) {
        let previous = self.reserved.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "memory pool underflow");
    }

    fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

static DEFAULT_POOL: LazyLock<Arc<dyn MemoryPool>> =
    LazyLock::new(|| Arc::new(TrackingMemoryPool::new()));

/// Process-wide pool used when a scan or export is not given one.
pub fn default_memory_pool() -> Arc<dyn MemoryPool> {
    Arc::clone(&DEFAULT_POOL)
}

/// Bytes held against a pool, released when dropped.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<dyn MemoryPool>,
    size: usize,
}

impl MemoryReservation {
    /// An empty reservation against `pool`.
    pub fn new(pool: Arc<dyn MemoryPool>) -> Self {
        Self { pool, size: 0 }
    }

    /// Bytes currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.pool
    }

    /// Hold `bytes` more, failing without side effects if the pool refuses.
    pub fn try_grow(&mut self, bytes: usize) -> Result<()> {
        self.pool.try_grow(bytes)?;
        self.size += bytes;
        Ok(())
    }

    /// Return up to `bytes` to the pool.
    pub fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.size);
        self.pool.shrink(bytes);
        self.size -= bytes;
    }

    /// Grow or shrink so exactly `bytes` are held.
    pub fn try_resize(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.size {
            self.try_grow(bytes - self.size)
        } else {
            self.shrink(self.size - bytes);
            Ok(())
        }
    }

    /// Release everything, returning the number of bytes freed.
    pub fn free(&mut self) -> usize {
        let size = self.size;
        if size > 0 {
            self.shrink(size);
        }
        size
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn reservations_return_bytes_on_drop() {
        let pool: Arc<dyn MemoryPool> = Arc::new(TrackingMemoryPool::new());
        {
            let mut a = MemoryReservation::new(Arc::clone(&pool));
            a.try_grow(100).unwrap();
            let mut b = MemoryReservation::new(Arc::clone(&pool));
            b.try_resize(50).unwrap();
            assert_eq!(pool.reserved(), 150);
            b.try_resize(10).unwrap();
            assert_eq!(pool.reserved(), 110);
        }
        assert_eq!(pool.reserved(), 0);
        assert_eq!(pool.peak(), 150);
    }

    #[test]
    fn limit_is_enforced() {
        let pool: Arc<dyn MemoryPool> = Arc::new(TrackingMemoryPool::with_limit(64));
        let mut r = MemoryReservation::new(Arc::clone(&pool));
        r.try_grow(60).unwrap();
        let err = r.try_grow(10).unwrap_err();
        assert!(matches!(
            err,
            QuarryError::ResourcesExhausted {
                requested: 10,
                reserved: 60,
                limit: 64
            }
        ));
        assert_eq!(r.size(), 60);
    }

    #[test]
    fn concurrent_accounting_balances() {
        let pool: Arc<dyn MemoryPool> = Arc::new(TrackingMemoryPool::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let mut r = MemoryReservation::new(Arc::clone(&pool));
                        r.try_grow(i % 17 + 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.reserved(), 0);
    }
}

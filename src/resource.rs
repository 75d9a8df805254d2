//! Resource Management
//!
//! Bounded pool of fixed-size frame buffers shared by every relay session.
//! The number of frames in circulation never exceeds the slot count; when all
//! slots are checked out, acquisition waits until a frame is returned.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Practical TCP MSS for Ethernet paths using TCP timestamps
pub const MAX_FRAME_SIZE: usize = 1448;

/// Default total budget for pooled frames
pub const DEFAULT_BUFFER_BUDGET: usize = 100 * 1024 * 1024;

/// Smallest usable pool: one session needs a frame per direction
pub const MIN_SLOTS: usize = 2;

/// Pool of reusable frame buffers with a hard cap on frames in circulation
pub struct BufferPool {
    frame_size: usize,
    capacity: usize,
    slots: Semaphore,
    free: Mutex<Vec<Box<[u8]>>>,
    stats: PoolStats,
}

/// Pool usage counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub allocated: AtomicUsize,
    pub acquired_total: AtomicUsize,
    pub waits: AtomicUsize,
    pub peak_in_use: AtomicUsize,
}

impl BufferPool {
    /// Create a pool whose frames fit within `budget` bytes
    pub fn new(budget: usize, frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self::with_capacity(budget / frame_size, frame_size)
    }

    /// Create a pool with an explicit slot count
    pub fn with_capacity(capacity: usize, frame_size: usize) -> Self {
        let capacity = if capacity < MIN_SLOTS {
            warn!(
                "Buffer pool capacity {} is below the minimum, using {}",
                capacity, MIN_SLOTS
            );
            MIN_SLOTS
        } else {
            capacity.min(Semaphore::MAX_PERMITS)
        };

        debug!(
            capacity,
            frame_size,
            "Created buffer pool ({} KiB cap)",
            capacity * frame_size / 1024
        );

        Self {
            frame_size,
            capacity,
            slots: Semaphore::new(capacity),
            free: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
        }
    }

    /// Acquire one frame, waiting while the pool is exhausted
    pub async fn acquire(self: &Arc<Self>) -> PooledBuffer {
        self.reserve(1).await;
        self.take_frame()
    }

    /// Acquire the two frames a relay session needs in a single step
    pub async fn acquire_pair(self: &Arc<Self>) -> (PooledBuffer, PooledBuffer) {
        self.reserve(2).await;
        (self.take_frame(), self.take_frame())
    }

    /// Return a frame to the pool
    pub fn release(&self, buf: PooledBuffer) {
        drop(buf);
    }

    /// Size of every frame handed out
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Maximum number of frames in circulation
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently checked out
    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Frames allocated so far (never exceeds capacity)
    pub fn allocated(&self) -> usize {
        self.stats.allocated.load(Ordering::Relaxed)
    }

    /// Snapshot of pool counters
    pub fn get_stats(&self) -> PoolUsageStats {
        PoolUsageStats {
            capacity: self.capacity,
            frame_size: self.frame_size,
            in_use: self.in_use(),
            allocated: self.allocated(),
            acquired_total: self.stats.acquired_total.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
            peak_in_use: self.stats.peak_in_use.load(Ordering::Relaxed),
        }
    }

    async fn reserve(&self, frames: u32) {
        let permit = match self.slots.try_acquire_many(frames) {
            Ok(permit) => permit,
            Err(_) => {
                self.stats.waits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    in_use = self.in_use(),
                    "Buffer pool exhausted, waiting for a frame"
                );
                match self.slots.acquire_many(frames).await {
                    Ok(permit) => permit,
                    Err(_) => unreachable!("buffer pool semaphore is never closed"),
                }
            }
        };
        // Slots are given back one by one as each frame drops.
        permit.forget();

        self.stats
            .acquired_total
            .fetch_add(frames as usize, Ordering::Relaxed);
        let current = self.in_use();
        self.stats.peak_in_use.fetch_max(current, Ordering::Relaxed);
    }

    fn take_frame(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        let frame = match reused {
            Some(frame) => frame,
            None => {
                self.stats.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.frame_size].into_boxed_slice()
            }
        };

        PooledBuffer {
            frame: Some(frame),
            pool: Arc::clone(self),
        }
    }

    fn put_frame(&self, frame: Box<[u8]>) {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(frame);
        self.slots.add_permits(1);
    }
}

/// Frame checked out of a [`BufferPool`]; returned to the pool when dropped
pub struct PooledBuffer {
    frame: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.frame.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.frame.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.put_frame(frame);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// Buffer pool statistics for monitoring
#[derive(Debug, Clone)]
pub struct PoolUsageStats {
    pub capacity: usize,
    pub frame_size: usize,
    pub in_use: usize,
    pub allocated: usize,
    pub acquired_total: usize,
    pub waits: usize,
    pub peak_in_use: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_capacity_from_budget() {
        let pool = BufferPool::new(10 * MAX_FRAME_SIZE + 100, MAX_FRAME_SIZE);
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.frame_size(), MAX_FRAME_SIZE);

        let tiny = BufferPool::new(100, MAX_FRAME_SIZE);
        assert_eq!(tiny.capacity(), MIN_SLOTS);
    }

    #[tokio::test]
    async fn test_frames_are_reused() {
        let pool = Arc::new(BufferPool::with_capacity(4, 64));

        let (a, b) = pool.acquire_pair().await;
        assert_eq!(a.len(), 64);
        assert_eq!(b.len(), 64);
        assert_eq!(pool.in_use(), 2);

        pool.release(a);
        drop(b);
        assert_eq!(pool.in_use(), 0);

        let _c = pool.acquire().await;
        let _d = pool.acquire().await;
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.get_stats().acquired_total, 4);
    }

    #[tokio::test]
    async fn test_exhausted_pool_blocks_until_release() {
        let pool = Arc::new(BufferPool::with_capacity(2, 16));
        let (first, _second) = pool.acquire_pair().await;

        let waiter_pool = Arc::clone(&pool);
        let mut waiter = task::spawn(async move { waiter_pool.acquire().await });
        assert_pending!(waiter.poll());
        assert_eq!(pool.allocated(), 2);

        drop(first);
        assert!(waiter.is_woken());
        let third = assert_ready!(waiter.poll());
        assert_eq!(third.len(), 16);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.get_stats().waits, 1);
    }

    #[tokio::test]
    async fn test_pair_waits_for_both_frames() {
        let pool = Arc::new(BufferPool::with_capacity(3, 16));
        let (held_a, held_b) = pool.acquire_pair().await;

        // One frame free is not enough for a pair.
        let result = tokio::time::timeout(Duration::from_millis(50), pool.acquire_pair()).await;
        assert!(result.is_err());
        assert_eq!(pool.in_use(), 2);

        drop(held_a);
        let pair = tokio::time::timeout(Duration::from_millis(50), pool.acquire_pair()).await;
        assert!(pair.is_ok());
        drop(held_b);
    }
}

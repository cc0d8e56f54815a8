//! Arena of recyclable frame payload buffers
//!
//! The acquisition loop takes buffers from the pool to hand to the device;
//! whoever ends up owning the frame returns the buffer simply by dropping it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

use super::frame::Frame;

pub(crate) struct PoolShared {
    free: ArrayQueue<BytesMut>,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

impl PoolShared {
    pub(crate) fn recycle(&self, buffer: BytesMut) {
        // a full free list just lets the buffer go
        if self.free.push(buffer).is_ok() {
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub recycled: u64,
    pub free: usize,
}

#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    /// `retain` bounds how many idle buffers are kept for reuse.
    pub fn new(retain: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: ArrayQueue::new(retain.max(1)),
                allocated: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    /// Take a zero-filled buffer of `len` bytes, reusing an idle one if
    /// possible.
    pub fn acquire(&self, len: usize) -> Frame {
        let buffer = match self.shared.free.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer.resize(len, 0);
                buffer
            }
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::zeroed(len)
            }
        };
        Frame::pooled(buffer, Arc::downgrade(&self.shared))
    }

    /// Release all idle buffers.
    pub fn shrink(&self) {
        while self.shared.free.pop().is_some() {}
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            recycled: self.shared.recycled.load(Ordering::Relaxed),
            free: self.shared.free.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_frame_returns_to_pool() {
        let pool = FramePool::new(4);
        let frame = pool.acquire(1024);
        assert_eq!(frame.len(), 1024);
        assert_eq!(pool.stats().free, 0);

        drop(frame);
        assert_eq!(pool.stats().free, 1);

        let again = pool.acquire(16);
        assert_eq!(again.len(), 16);
        assert!(again.data().iter().all(|&b| b == 0));

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_reused_buffer_is_zeroed() {
        let pool = FramePool::new(1);
        let mut frame = pool.acquire(8);
        frame.data_mut().fill(0xAB);
        frame.meta.sequence = 42;
        drop(frame);

        let frame = pool.acquire(8);
        assert!(frame.data().iter().all(|&b| b == 0));
        assert_eq!(frame.meta.sequence, 0);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = FramePool::new(2);
        let frames: Vec<Frame> = (0..5).map(|_| pool.acquire(8)).collect();
        drop(frames);

        assert_eq!(pool.stats().free, 2);
        pool.shrink();
        assert_eq!(pool.stats().free, 0);
    }

    #[test]
    fn test_frame_outliving_pool_is_freed() {
        let pool = FramePool::new(2);
        let frame = pool.acquire(8);
        drop(pool);
        drop(frame);
    }
}

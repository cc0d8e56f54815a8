//! Lock-free SPSC ring buffer with a blocking "wait for N items" primitive
//!
//! [`SpscQueue::split`] hands out exactly one [`Producer`] and one
//! [`Consumer`]. Neither handle is `Clone` and both mutate through `&mut
//! self`, so one pusher and one popper is enforced by the borrow checker.
//! Each counter has a single writer, so no compare-and-swap is needed: the
//! producer publishes a slot by bumping `push_count` with release ordering
//! and the consumer frees a slot by bumping `pop_count`. Counters are 64-bit
//! atomics and never wrap in practice.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use super::signal::Signal;
use crate::error::QueueError;

/// Outcome of [`Consumer::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least the requested number of items is available
    Satisfied,
    /// The timeout elapsed first
    TimedOut,
    /// The wait can never be satisfied (queue closed, or more items requested
    /// than the queue can hold)
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

/// Fixed-capacity ring shared by a [`Producer`] and a [`Consumer`].
pub struct SpscQueue<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: u64,

    /// Written only by the producer
    push_count: CachePadded<AtomicU64>,
    /// Written only by the consumer
    pop_count: CachePadded<AtomicU64>,
    /// Push count the consumer is waiting for, 0 when nobody waits
    push_condition: CachePadded<AtomicU64>,

    signal: Signal,
    closed: AtomicBool,
    dropped: AtomicU64,
}

// SAFETY: slots are only reachable through the unique `Producer` and
// `Consumer` handles. Slot `i` is only touched by the producer while
// `i >= push_count` and only by the consumer while `pop_count <= i <
// push_count`; the counters hand each slot over with release/acquire ordering.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QueueError::InvalidCapacity(capacity));
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            push_count: CachePadded::new(AtomicU64::new(0)),
            pop_count: CachePadded::new(AtomicU64::new(0)),
            push_condition: CachePadded::new(AtomicU64::new(0)),
            signal: Signal::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Divide the queue into its two endpoints.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let queue = Arc::new(self);
        (
            Producer {
                queue: Arc::clone(&queue),
            },
            Consumer { queue },
        )
    }

    /// Number of queued items. Exact from the consumer's point of view.
    fn len(&self) -> usize {
        // pop first: it can only grow towards push
        let pop = self.pop_count.load(Ordering::Acquire);
        let push = self.push_count.load(Ordering::Acquire);
        (push.saturating_sub(pop) as usize).min(self.slots.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.signal.set();
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.push_count.load(Ordering::Acquire),
            popped: self.pop_count.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Pushing endpoint. Dropping it closes the queue.
pub struct Producer<T> {
    queue: Arc<SpscQueue<T>>,
}

impl<T> Producer<T> {
    /// Move `item` into the queue.
    ///
    /// A full queue never blocks; the item is handed back in `Err` and the
    /// drop is counted.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        let queue = &*self.queue;
        let push = queue.push_count.load(Ordering::Relaxed);
        let pop = queue.pop_count.load(Ordering::Acquire);

        if push - pop >= queue.slots.len() as u64 {
            queue.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }

        // SAFETY: the slot is outside the consumer's readable window until
        // the store below publishes it.
        unsafe {
            *queue.slots[(push & queue.mask) as usize].get() = Some(item);
        }

        let pushed = push + 1;
        queue.push_count.store(pushed, Ordering::SeqCst);

        let condition = queue.push_condition.load(Ordering::SeqCst);
        if condition > 0 && pushed >= condition {
            queue.signal.set();
        }

        Ok(())
    }

    /// Wake a blocked waiter; waits that are not already satisfied fail from
    /// now on. Pushing is still allowed.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn monitor(&self) -> QueueMonitor<T> {
        QueueMonitor {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Popping endpoint.
pub struct Consumer<T> {
    queue: Arc<SpscQueue<T>>,
}

impl<T> Consumer<T> {
    /// Take the oldest item, if any.
    pub fn try_pop(&mut self) -> Option<T> {
        let queue = &*self.queue;
        let pop = queue.pop_count.load(Ordering::Relaxed);
        let push = queue.push_count.load(Ordering::Acquire);

        if pop >= push {
            return None;
        }

        // SAFETY: `pop < push`, so the producer has published this slot and
        // will not touch it again until `pop_count` moves past it.
        let item = unsafe { (*queue.slots[(pop & queue.mask) as usize].get()).take() };
        queue.pop_count.store(pop + 1, Ordering::Release);

        item
    }

    /// Block until at least `n` items are queued, the timeout elapses, or
    /// the queue is closed.
    pub fn wait(&mut self, n: usize, timeout: Duration) -> WaitStatus {
        let queue = &*self.queue;
        let target = queue.pop_count.load(Ordering::Relaxed) + n as u64;

        if queue.push_count.load(Ordering::Acquire) >= target {
            return WaitStatus::Satisfied;
        }
        if n > queue.slots.len() || queue.closed.load(Ordering::Acquire) {
            return WaitStatus::Failed;
        }
        if timeout.is_zero() {
            return WaitStatus::TimedOut;
        }

        let deadline = Instant::now().checked_add(timeout);
        queue.push_condition.store(target, Ordering::SeqCst);

        // Reset, then check again before sleeping: a push that landed before
        // the reset would otherwise go unnoticed. A wake-up meant for an
        // earlier wait finds the target unmet and the queue open, and loops.
        let status = loop {
            queue.signal.reset();

            if queue.push_count.load(Ordering::SeqCst) >= target {
                break WaitStatus::Satisfied;
            }
            if queue.closed.load(Ordering::SeqCst) {
                break WaitStatus::Failed;
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() || !queue.signal.wait(remaining) {
                break if queue.push_count.load(Ordering::SeqCst) >= target {
                    WaitStatus::Satisfied
                } else {
                    WaitStatus::TimedOut
                };
            }
        };

        queue.push_condition.store(0, Ordering::SeqCst);
        status
    }

    /// Pop and drop everything. Returns the number of items dropped.
    pub fn clear(&mut self) -> usize {
        let mut cleared = 0;
        while self.try_pop().is_some() {
            cleared += 1;
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    pub fn monitor(&self) -> QueueMonitor<T> {
        QueueMonitor {
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Read-only view of a queue's counters, usable from any thread.
pub struct QueueMonitor<T> {
    queue: Arc<SpscQueue<T>>,
}

impl<T> Clone for QueueMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> QueueMonitor<T> {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

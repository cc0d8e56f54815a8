//! The capability set every pipeline stage exposes
//!
//! A stage is consumed through this trait only, so a disk writer can feed a
//! transform stage exactly like a camera can.

use std::time::Duration;

use parking_lot::Mutex;

use super::errors::{self, ErrorChannel};
use super::queue::{Consumer, Producer, QueueMonitor, SpscQueue, WaitStatus};
use crate::error::StageError;

/// The consumer-facing side of a pipeline stage.
///
/// Pop-side methods are serialized per stage, but are meant to be called
/// from the single thread that consumes this stage (the host, or the next
/// stage's worker). `shutdown` may be called from anywhere.
pub trait ImageQueue: Send + Sync {
    type Item: Send + 'static;

    /// Pop the oldest available item.
    fn get_image(&self) -> Option<Self::Item>;

    fn available_images(&self) -> usize;

    /// Block until `n` items are available or `timeout` elapses.
    fn wait_images(&self, n: usize, timeout: Duration) -> WaitStatus;

    /// Discard all queued and in-flight items, upstream stages included.
    ///
    /// A stage's worker flushes its upstream from its own thread, which is
    /// that upstream's consumer, and the caller clears this stage's output.
    /// Every queue is therefore drained by its own consumer.
    fn flush_images(&self) -> Result<(), StageError>;

    fn get_error(&self) -> Option<String>;

    fn error_count(&self) -> usize;

    /// Stop the worker and release queued items. Idempotent.
    fn shutdown(&self) -> Result<(), StageError>;

    /// Pop exactly `n` items, or none if fewer are available.
    fn get_images(&self, n: usize) -> Result<Vec<Self::Item>, StageError> {
        let available = self.available_images();
        if n > available {
            return Err(StageError::InsufficientImages {
                requested: n,
                available,
            });
        }
        Ok((0..n).filter_map(|_| self.get_image()).collect())
    }

    /// Drain the queue and return only the newest item.
    fn get_last_image(&self) -> Option<Self::Item> {
        std::iter::from_fn(|| self.get_image()).last()
    }

    fn get_errors(&self) -> Vec<String> {
        std::iter::from_fn(|| self.get_error()).collect()
    }
}

/// A source stage fed directly by the host, e.g. to replay recorded frames
/// into a downstream stage. The host thread is the producer.
pub struct ManualSource<T> {
    producer: Mutex<Producer<T>>,
    consumer: Mutex<Consumer<T>>,
    monitor: QueueMonitor<T>,
    errors: ErrorChannel,
}

impl<T: Send + 'static> ManualSource<T> {
    pub fn new(capacity: usize) -> Result<Self, StageError> {
        let (producer, consumer) = SpscQueue::new(capacity)?.split();
        // nothing runs here that could report
        let (_, errors) = errors::channel("manual-source", 16)?;

        Ok(Self {
            monitor: consumer.monitor(),
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            errors,
        })
    }

    /// Producer side. A full queue hands the item back.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.producer.lock().try_push(item)
    }
}

impl<T: Send + 'static> ImageQueue for ManualSource<T> {
    type Item = T;

    fn get_image(&self) -> Option<T> {
        self.consumer.lock().try_pop()
    }

    fn available_images(&self) -> usize {
        self.monitor.len()
    }

    fn wait_images(&self, n: usize, timeout: Duration) -> WaitStatus {
        self.consumer.lock().wait(n, timeout)
    }

    fn flush_images(&self) -> Result<(), StageError> {
        self.consumer.lock().clear();
        Ok(())
    }

    fn get_error(&self) -> Option<String> {
        self.errors.pop()
    }

    fn error_count(&self) -> usize {
        self.errors.len()
    }

    fn shutdown(&self) -> Result<(), StageError> {
        self.producer.lock().close();
        Ok(())
    }
}

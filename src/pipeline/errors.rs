//! Per-stage error channel
//!
//! The stage worker owns the [`ErrorReporter`]; whoever polls the stage reads
//! through the [`ErrorChannel`]. A full channel drops the newest message so a
//! slow error reader can never stall the worker.

use parking_lot::Mutex;
use tracing::warn;

use super::queue::{Consumer, Producer, QueueMonitor, SpscQueue};
use crate::error::QueueError;

/// Create a connected reporter and channel for `stage`.
pub fn channel(
    stage: impl Into<String>,
    capacity: usize,
) -> Result<(ErrorReporter, ErrorChannel), QueueError> {
    let stage = stage.into();
    let (producer, consumer) = SpscQueue::new(capacity)?.split();
    let monitor = consumer.monitor();

    Ok((
        ErrorReporter {
            stage: stage.clone(),
            producer,
        },
        ErrorChannel {
            stage,
            consumer: Mutex::new(consumer),
            monitor,
        },
    ))
}

/// Producer side, owned by the worker thread
pub struct ErrorReporter {
    stage: String,
    producer: Producer<String>,
}

impl ErrorReporter {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Record a message.
    pub fn report(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(stage = %self.stage, "{}", message);
        metrics::counter!("framepipe_stage_errors_total", "stage" => self.stage.clone())
            .increment(1);

        if self.producer.try_push(message).is_err() {
            metrics::counter!("framepipe_stage_errors_dropped_total", "stage" => self.stage.clone())
                .increment(1);
        }
    }
}

/// Consumer side, owned by the stage
pub struct ErrorChannel {
    stage: String,
    consumer: Mutex<Consumer<String>>,
    monitor: QueueMonitor<String>,
}

impl ErrorChannel {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn pop(&self) -> Option<String> {
        self.consumer.lock().try_pop()
    }

    pub fn drain(&self) -> Vec<String> {
        let mut consumer = self.consumer.lock();
        std::iter::from_fn(|| consumer.try_pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.monitor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitor.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.monitor.stats().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_drain_in_order() {
        let (mut reporter, errors) = channel("test", 4).unwrap();
        reporter.report("first");
        reporter.report(String::from("second"));

        assert_eq!(errors.len(), 2);
        assert_eq!(errors.pop().as_deref(), Some("first"));
        assert_eq!(errors.drain(), vec!["second".to_string()]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_overflow_keeps_oldest() {
        let (mut reporter, errors) = channel("test", 2).unwrap();
        for i in 0..5 {
            reporter.report(format!("error {i}"));
        }

        assert_eq!(errors.drain(), vec!["error 0", "error 1"]);
        assert_eq!(errors.dropped(), 3);
        assert_eq!(reporter.stage(), errors.stage());
    }
}

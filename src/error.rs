//! Error types for queues, devices, transforms and pipeline stages

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue capacity {0} is not a non-zero power of two")]
    InvalidCapacity(usize),
}

/// Errors reported by a capture device or its buffer stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("timed out waiting for a buffer")]
    Timeout,

    #[error("buffer was aborted")]
    Aborted,

    #[error("device is not connected")]
    NotConnected,

    #[error("buffer of {capacity} bytes cannot hold a {required} byte payload")]
    BufferTooSmall { capacity: usize, required: usize },

    #[error("device buffer queue is full ({maximum} buffers)")]
    QueueFull { maximum: usize },

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("invalid transform dimensions {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("cannot copy the data to the transform buffer (image={actual}; buffer={expected})")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("unsupported bit depth {0}")]
    UnsupportedBitDepth(u32),

    #[error("coefficient index {index} out of range for {len} outputs")]
    IndexOutOfRange { index: i32, len: usize },
}

/// Lifecycle errors of a pipeline stage.
///
/// Per-item failures never show up here; those are queued on the stage's
/// error channel and the stage keeps running.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("could not start the {stage} worker thread")]
    ThreadSpawn {
        stage: String,
        #[source]
        source: io::Error,
    },

    #[error("{stage} worker did not complete the flush within {timeout:?}")]
    FlushTimeout { stage: String, timeout: Duration },

    #[error("{stage} worker failed to flush, see its error channel")]
    FlushFailed { stage: String },

    #[error("{stage} worker does not respond after {timeout:?}")]
    ShutdownTimeout { stage: String, timeout: Duration },

    #[error("{stage} worker panicked")]
    WorkerPanicked { stage: String },

    #[error("{stage} worker has stopped")]
    NotRunning { stage: String },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("requested {requested} images but only {available} are available")]
    InsufficientImages { requested: usize, available: usize },
}

impl StageError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

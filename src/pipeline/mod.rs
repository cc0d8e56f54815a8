//! Queue primitives, the acquisition loop and stage composition

pub mod errors;
pub mod queue;
pub mod signal;
pub mod stage;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

pub use errors::{ErrorChannel, ErrorReporter};
pub use queue::{Consumer, Producer, QueueMonitor, QueueStats, SpscQueue, WaitStatus};
pub use stage::{ImageQueue, ManualSource};
pub use worker::{AcquisitionLoop, Fetch, LoopOptions, LoopState, StageWorker};

use crate::capture::{CameraSource, DeviceControl, DeviceStream, Frame, PoolStats};
use crate::error::StageError;
use crate::storage::DiskWriter;
use crate::transform::FftProcessor;
use crate::utils::ThreadPriority;
use crate::{Config, PipelineConfig};

/// Construction parameters shared by every stage
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub queue_capacity: usize,
    pub error_capacity: usize,
    /// Idle frame buffers kept for reuse by a device source
    pub pool_retain: usize,
    pub loop_options: LoopOptions,
    pub flush_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&PipelineConfig> for StageOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            error_capacity: config.error_capacity,
            pool_retain: config.pool_retain,
            loop_options: LoopOptions {
                wait_timeout: Duration::from_millis(config.wait_timeout_ms),
                error_backoff: Duration::from_millis(config.error_backoff_ms),
                ..Default::default()
            },
            flush_timeout: Duration::from_millis(config.flush_timeout_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub source: QueueStats,
    pub pool: PoolStats,
    pub writer: Option<QueueStats>,
    pub written_images: u64,
    pub transform: Option<QueueStats>,
    pub processed_images: u64,
}

/// A device source, optionally followed by a disk writer and a transform
/// stage, wired at construction time.
///
/// The transform consumes the writer's output when the writer passes frames
/// through, and the source directly when there is no writer.
pub struct Pipeline {
    source: Arc<CameraSource>,
    writer: Option<Arc<DiskWriter>>,
    transform: Option<FftProcessor>,
}

impl Pipeline {
    pub fn build<S: DeviceStream>(
        config: &Config,
        control: Arc<dyn DeviceControl>,
        stream: S,
    ) -> Result<Self, StageError> {
        if let (Some(storage), Some(_)) = (&config.storage, &config.transform) {
            if !storage.pass_through {
                return Err(StageError::InvalidPipeline(
                    "a transform after the disk writer needs pass-through enabled".into(),
                ));
            }
        }

        let options = StageOptions::from(&config.pipeline);
        let mut source_options = options.clone();
        if config.capture.elevate_priority {
            source_options.loop_options.priority = ThreadPriority::Elevated;
        }
        source_options.loop_options.core = config.capture.pin_core;

        let source = Arc::new(CameraSource::initialize(control, stream, &source_options)?);
        let mut upstream: Arc<dyn ImageQueue<Item = Frame>> = source.clone();

        let writer = match &config.storage {
            Some(storage) => {
                let writer = Arc::new(DiskWriter::initialize(storage, upstream.clone(), &options)?);
                upstream = writer.clone();
                Some(writer)
            }
            None => None,
        };

        let transform = match &config.transform {
            Some(transform) => Some(FftProcessor::initialize(transform, upstream, &options)?),
            None => None,
        };

        info!(
            writer = writer.is_some(),
            transform = transform.is_some(),
            "Pipeline built"
        );

        Ok(Self {
            source,
            writer,
            transform,
        })
    }

    pub fn start(&self) -> Result<(), StageError> {
        self.source.start()
    }

    pub fn stop(&self) -> Result<(), StageError> {
        self.source.stop()
    }

    pub fn source(&self) -> &CameraSource {
        &self.source
    }

    pub fn writer(&self) -> Option<&DiskWriter> {
        self.writer.as_deref()
    }

    pub fn transform(&self) -> Option<&FftProcessor> {
        self.transform.as_ref()
    }

    /// The last stage producing frames, if nothing downstream consumes them.
    pub fn frame_output(&self) -> Option<&dyn ImageQueue<Item = Frame>> {
        if self.transform.is_some() {
            return None;
        }
        match &self.writer {
            Some(writer) if writer.is_pass_through() => Some(&**writer),
            Some(_) => None,
            None => Some(&*self.source),
        }
    }

    /// Flush every stage, starting the cascade at the last one.
    ///
    /// Each stage flushes its upstream from its own worker thread before
    /// resetting itself, so the source is flushed first and every queue is
    /// drained by its consumer. Call this from the thread that consumes the
    /// last stage.
    pub fn flush(&self) -> Result<(), StageError> {
        if let Some(transform) = &self.transform {
            transform.flush_images()
        } else if let Some(writer) = &self.writer {
            writer.flush_images()
        } else {
            self.source.flush_images()
        }
    }

    /// Drain the error channels of every stage, tagged with the stage name.
    pub fn errors(&self) -> Vec<(&'static str, String)> {
        let mut errors: Vec<_> = self
            .source
            .get_errors()
            .into_iter()
            .map(|e| ("camera-source", e))
            .collect();
        if let Some(writer) = &self.writer {
            errors.extend(writer.get_errors().into_iter().map(|e| ("disk-writer", e)));
        }
        if let Some(transform) = &self.transform {
            errors.extend(
                transform
                    .get_errors()
                    .into_iter()
                    .map(|e| ("fft-processor", e)),
            );
        }
        errors
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            source: self.source.queue_stats(),
            pool: self.source.pool_stats(),
            writer: self.writer.as_ref().map(|w| w.queue_stats()),
            written_images: self.writer.as_ref().map_or(0, |w| w.written_images()),
            transform: self.transform.as_ref().map(|t| t.queue_stats()),
            processed_images: self.transform.as_ref().map_or(0, |t| t.processed_images()),
        }
    }

    /// Shut stages down, downstream first, so no worker outlives its
    /// upstream. Every stage is attempted; the first failure is returned.
    pub fn shutdown(&self) -> Result<(), StageError> {
        let mut results = Vec::with_capacity(3);
        if let Some(transform) = &self.transform {
            results.push(transform.shutdown());
        }
        if let Some(writer) = &self.writer {
            results.push(writer.shutdown());
        }
        results.push(self.source.shutdown());

        results.into_iter().collect()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Pipeline shutdown failed: {}", e);
        }
    }
}

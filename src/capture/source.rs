//! Device-facing pipeline stage
//!
//! A dedicated worker retrieves filled buffers from the device stream,
//! moves them into the output queue and immediately hands the device a
//! fresh buffer from the frame pool. The device stream is owned by that
//! worker; flushes (abort, drain, refill) run there too.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::device::{BufferStatus, DeviceControl, DeviceStream, Retrieved};
use super::frame::Frame;
use super::pool::{FramePool, PoolStats};
use crate::error::{DeviceError, StageError};
use crate::pipeline::errors::{self, ErrorChannel, ErrorReporter};
use crate::pipeline::queue::{Consumer, Producer, QueueMonitor, QueueStats, SpscQueue, WaitStatus};
use crate::pipeline::stage::ImageQueue;
use crate::pipeline::worker::{AcquisitionLoop, Fetch, StageWorker};
use crate::pipeline::StageOptions;

const STAGE_NAME: &str = "camera-source";

pub struct CameraSource {
    control: Arc<dyn DeviceControl>,
    output: Mutex<Consumer<Frame>>,
    monitor: QueueMonitor<Frame>,
    errors: ErrorChannel,
    /// Buffer size the device queue was last filled with
    payload_size: Arc<AtomicUsize>,
    pool: FramePool,
    worker: Mutex<Option<AcquisitionLoop>>,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
}

impl CameraSource {
    /// Start the acquisition worker and fill the device's buffer queue.
    ///
    /// Returns once the initial fill has completed, so the device is ready
    /// for [`CameraSource::start`].
    pub fn initialize<S: DeviceStream>(
        control: Arc<dyn DeviceControl>,
        stream: S,
        options: &StageOptions,
    ) -> Result<Self, StageError> {
        let (producer, output) = SpscQueue::new(options.queue_capacity)?.split();
        let (reporter, errors) = errors::channel(STAGE_NAME, options.error_capacity)?;
        let pool = FramePool::new(options.pool_retain);
        let payload_size = Arc::new(AtomicUsize::new(0));

        let worker = SourceWorker {
            stream,
            control: Arc::clone(&control),
            pool: pool.clone(),
            output: producer,
            payload_size: Arc::clone(&payload_size),
        };

        let acquisition = AcquisitionLoop::spawn(
            STAGE_NAME,
            worker,
            reporter,
            options.loop_options.clone(),
        )?;

        // the initial fill doubles as the readiness hand-shake
        acquisition.flush(options.flush_timeout)?;

        info!(
            payload_size = payload_size.load(Ordering::Acquire),
            "Camera source initialized"
        );

        Ok(Self {
            control,
            monitor: output.monitor(),
            output: Mutex::new(output),
            errors,
            payload_size,
            pool,
            worker: Mutex::new(Some(acquisition)),
            flush_timeout: options.flush_timeout,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    /// Start acquisition, regenerating the device buffers first if the
    /// payload size changed since they were allocated.
    pub fn start(&self) -> Result<(), StageError> {
        let worker = self.worker.lock();
        let acquisition = worker
            .as_ref()
            .filter(|acquisition| acquisition.is_running())
            .ok_or_else(|| StageError::NotRunning {
                stage: STAGE_NAME.into(),
            })?;

        let size = self.control.payload_size()?;
        let current = self.payload_size.load(Ordering::Acquire);
        if size != current {
            info!(from = current, to = size, "Payload size changed, regenerating buffers");
            acquisition.flush(self.flush_timeout)?;
        }

        self.control.start_acquisition()?;
        info!("Acquisition started");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), StageError> {
        self.control.stop_acquisition()?;
        info!("Acquisition stopped");
        Ok(())
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size.load(Ordering::Acquire)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.monitor.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl ImageQueue for CameraSource {
    type Item = Frame;

    fn get_image(&self) -> Option<Frame> {
        self.output.lock().try_pop()
    }

    fn available_images(&self) -> usize {
        self.monitor.len()
    }

    fn wait_images(&self, n: usize, timeout: Duration) -> WaitStatus {
        self.output.lock().wait(n, timeout)
    }

    /// Abort and refill the device buffers on the worker, then clear the
    /// output from the calling (consumer) thread.
    fn flush_images(&self) -> Result<(), StageError> {
        let result = match self.worker.lock().as_ref() {
            Some(acquisition) => acquisition.flush(self.flush_timeout),
            None => Ok(()),
        };

        let cleared = self.output.lock().clear();
        debug!(cleared, "Flushed camera source");
        result
    }

    fn get_error(&self) -> Option<String> {
        self.errors.pop()
    }

    fn error_count(&self) -> usize {
        self.errors.len()
    }

    fn shutdown(&self) -> Result<(), StageError> {
        let Some(mut acquisition) = self.worker.lock().take() else {
            return Ok(());
        };

        if let Err(e) = self.control.stop_acquisition() {
            warn!("Could not stop acquisition during shutdown: {}", e);
        }

        // the worker drops its producer on exit, which closes the output
        acquisition.stop(self.shutdown_timeout)
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Camera source shutdown failed: {}", e);
        }
    }
}

struct SourceWorker<S> {
    stream: S,
    control: Arc<dyn DeviceControl>,
    pool: FramePool,
    output: Producer<Frame>,
    payload_size: Arc<AtomicUsize>,
}

impl<S: DeviceStream> SourceWorker<S> {
    /// Hand the device a fresh buffer in place of a retrieved one.
    fn requeue(&mut self, errors: &mut ErrorReporter) {
        let frame = self.pool.acquire(self.payload_size.load(Ordering::Acquire));
        if let Err(e) = self.stream.queue_buffer(frame) {
            errors.report(format!("Could not queue a new buffer: {e}"));
        }
    }
}

impl<S: DeviceStream> StageWorker for SourceWorker<S> {
    type Input = Retrieved;

    fn fetch(&mut self, timeout: Duration) -> Fetch<Retrieved> {
        match self.stream.retrieve_buffer(timeout) {
            Ok(retrieved) => Fetch::Item(retrieved),
            Err(DeviceError::Timeout) => Fetch::Timeout,
            Err(e) => Fetch::Failed(format!("Buffer retrieval failed: {e}")),
        }
    }

    fn process(&mut self, retrieved: Retrieved, errors: &mut ErrorReporter) {
        match retrieved.status {
            BufferStatus::Complete => {
                if self.output.try_push(retrieved.frame).is_err() {
                    metrics::counter!("framepipe_frames_dropped_total", "stage" => STAGE_NAME)
                        .increment(1);
                    errors.report("Buffer queuing operation failed.");
                }
            }
            // not an error, the buffer is simply recycled
            BufferStatus::Aborted | BufferStatus::NotImage => {}
            BufferStatus::Failed(e) => errors.report(format!("Acquisition failed: {e}")),
        }

        self.requeue(errors);
    }

    fn flush(&mut self, errors: &mut ErrorReporter) -> bool {
        self.stream.abort_queued_buffers();
        let mut drained = 0;
        while self.stream.retrieve_buffer(Duration::ZERO).is_ok() {
            drained += 1;
        }

        let size = match self.control.payload_size() {
            Ok(size) => size,
            Err(e) => {
                errors.report(format!("Could not read the payload size: {e}"));
                return false;
            }
        };
        if size != self.payload_size.swap(size, Ordering::AcqRel) {
            // idle buffers of the old size are of no further use
            self.pool.shrink();
        }

        let mut queued = 0;
        while self.stream.queued_buffer_count() < self.stream.queued_buffer_maximum() {
            if let Err(e) = self.stream.queue_buffer(self.pool.acquire(size)) {
                errors.report(format!("Could not fill the device buffer queue: {e}"));
                return false;
            }
            queued += 1;
        }

        debug!(drained, queued, size, "Device buffer queue regenerated");
        true
    }

    fn finish(&mut self) {
        self.stream.abort_queued_buffers();
        while self.stream.retrieve_buffer(Duration::ZERO).is_ok() {}
    }
}

//! Disk-persist stage
//!
//! Appends every frame payload to a destination, back to back with no
//! framing. In pass-through mode the frame is forwarded to this stage's own
//! output queue afterwards, so the writer can act as the source of another
//! stage.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::capture::Frame;
use crate::error::StageError;
use crate::pipeline::errors::{self, ErrorChannel, ErrorReporter};
use crate::pipeline::queue::{Consumer, Producer, QueueMonitor, QueueStats, SpscQueue, WaitStatus};
use crate::pipeline::stage::ImageQueue;
use crate::pipeline::worker::{fetch_upstream, AcquisitionLoop, Fetch, StageWorker};
use crate::pipeline::StageOptions;
use crate::StorageConfig;

const STAGE_NAME: &str = "disk-writer";

/// Sequential byte sink the writer persists to
pub trait Destination: Send + 'static {
    /// Write `data` with a single call and report how much was accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Discard everything written so far.
    fn truncate(&mut self) -> io::Result<()>;
}

pub struct FileDestination {
    file: File,
    path: PathBuf,
}

impl FileDestination {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Destination for FileDestination {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write(data)
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)
    }
}

pub struct DiskWriter {
    output: Mutex<Consumer<Frame>>,
    monitor: QueueMonitor<Frame>,
    errors: ErrorChannel,
    written: Arc<AtomicU64>,
    worker: Mutex<Option<AcquisitionLoop>>,
    pass_through: bool,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
}

impl DiskWriter {
    /// Open the configured file and start consuming `upstream`.
    pub fn initialize(
        config: &StorageConfig,
        upstream: Arc<dyn ImageQueue<Item = Frame>>,
        options: &StageOptions,
    ) -> Result<Self, StageError> {
        let destination = FileDestination::create(&config.path).map_err(|e| {
            StageError::io(format!("Could not create {}", config.path.display()), e)
        })?;

        info!(path = %config.path.display(), pass_through = config.pass_through, "Writing frames to disk");
        Self::with_destination(destination, config.pass_through, upstream, options)
    }

    pub fn with_destination<D: Destination>(
        destination: D,
        pass_through: bool,
        upstream: Arc<dyn ImageQueue<Item = Frame>>,
        options: &StageOptions,
    ) -> Result<Self, StageError> {
        let (producer, output) = SpscQueue::new(options.queue_capacity)?.split();
        let (reporter, errors) = errors::channel(STAGE_NAME, options.error_capacity)?;
        let written = Arc::new(AtomicU64::new(0));

        let worker = WriterWorker {
            upstream,
            destination,
            output: producer,
            written: Arc::clone(&written),
            pass_through,
        };
        let acquisition = AcquisitionLoop::spawn(
            STAGE_NAME,
            worker,
            reporter,
            options.loop_options.clone(),
        )?;

        Ok(Self {
            monitor: output.monitor(),
            output: Mutex::new(output),
            errors,
            written,
            worker: Mutex::new(Some(acquisition)),
            pass_through,
            flush_timeout: options.flush_timeout,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    /// Frames completely written since start or the last flush
    pub fn written_images(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.monitor.stats()
    }
}

impl ImageQueue for DiskWriter {
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

    /// On the worker: flush the upstream, truncate the destination and reset
    /// the written count. Then drop queued pass-through frames from the
    /// calling (consumer) thread.
    fn flush_images(&self) -> Result<(), StageError> {
        let result = match self.worker.lock().as_ref() {
            Some(acquisition) => acquisition.flush(self.flush_timeout),
            None => Ok(()),
        };

        let cleared = self.output.lock().clear();
        debug!(cleared, "Flushed disk writer");
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

        let result = acquisition.stop(self.shutdown_timeout);
        info!(written = self.written_images(), "Disk writer shut down");
        result
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Disk writer shutdown failed: {}", e);
        }
    }
}

struct WriterWorker<D> {
    upstream: Arc<dyn ImageQueue<Item = Frame>>,
    destination: D,
    output: Producer<Frame>,
    written: Arc<AtomicU64>,
    pass_through: bool,
}

impl<D: Destination> StageWorker for WriterWorker<D> {
    type Input = Frame;

    fn fetch(&mut self, timeout: Duration) -> Fetch<Frame> {
        fetch_upstream(&*self.upstream, timeout)
    }

    fn process(&mut self, frame: Frame, errors: &mut ErrorReporter) {
        let requested = frame.len();
        match self.destination.write(frame.data()) {
            Ok(written) if written == requested => {
                self.written.fetch_add(1, Ordering::AcqRel);
                metrics::counter!("framepipe_frames_written_total").increment(1);
            }
            Ok(written) => errors.report(format!(
                "Write operation failed: incomplete write ({written} of {requested} bytes)."
            )),
            Err(e) => errors.report(format!("Write operation failed: {e}")),
        }

        if !self.pass_through {
            return;
        }

        if self.output.try_push(frame).is_err() {
            metrics::counter!("framepipe_frames_dropped_total", "stage" => STAGE_NAME)
                .increment(1);
            errors.report("Pass-through queuing operation failed.");
        }
    }

    fn flush(&mut self, errors: &mut ErrorReporter) -> bool {
        // this worker is the upstream's only consumer
        if let Err(e) = self.upstream.flush_images() {
            errors.report(format!("Could not flush the upstream stage: {e}"));
            return false;
        }
        if let Err(e) = self.destination.truncate() {
            errors.report(format!("Could not truncate the destination: {e}"));
            return false;
        }
        self.written.store(0, Ordering::Release);
        true
    }
}

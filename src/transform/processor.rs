//! Transform stage: 2-D spectrum of every frame, reduced to a sparse set of
//! coefficients
//!
//! A non-negative index `k` selects raw output bin `k`; a negative index `-k`
//! selects the complex conjugate of bin `k`, which is the value of the
//! mirrored bin that the half spectrum omits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use num_complex::Complex64;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::fft::RealFft2d;
use crate::capture::Frame;
use crate::error::{StageError, TransformError};
use crate::pipeline::errors::{self, ErrorChannel, ErrorReporter};
use crate::pipeline::queue::{Consumer, Producer, QueueMonitor, QueueStats, SpscQueue, WaitStatus};
use crate::pipeline::stage::ImageQueue;
use crate::pipeline::worker::{fetch_upstream, AcquisitionLoop, Fetch, StageWorker};
use crate::pipeline::StageOptions;
use crate::TransformConfig;

const STAGE_NAME: &str = "fft-processor";

/// Selected coefficients of one frame's spectrum
#[derive(Debug, Clone, PartialEq)]
pub struct FftExtract {
    pub coefficients: Vec<Complex64>,
    /// Timestamp of the source frame
    pub timestamp: u64,
    pub sequence: u64,
}

/// Pick `indices` out of a transform output.
pub fn extract_coefficients(
    output: &[Complex64],
    indices: &[i32],
) -> Result<Vec<Complex64>, TransformError> {
    indices
        .iter()
        .map(|&index| {
            let value = output
                .get(index.unsigned_abs() as usize)
                .copied()
                .ok_or(TransformError::IndexOutOfRange {
                    index,
                    len: output.len(),
                })?;
            Ok(if index < 0 { value.conj() } else { value })
        })
        .collect()
}

pub struct FftProcessor {
    output: Mutex<Consumer<FftExtract>>,
    monitor: QueueMonitor<FftExtract>,
    errors: ErrorChannel,
    indices: Arc<ArcSwap<Vec<i32>>>,
    processed: Arc<AtomicU64>,
    worker: Mutex<Option<AcquisitionLoop>>,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
}

impl FftProcessor {
    pub fn initialize(
        config: &TransformConfig,
        upstream: Arc<dyn ImageQueue<Item = Frame>>,
        options: &StageOptions,
    ) -> Result<Self, StageError> {
        let fft = RealFft2d::new(config.width, config.height)?;
        let (producer, output) = SpscQueue::new(options.queue_capacity)?.split();
        let (reporter, errors) = errors::channel(STAGE_NAME, options.error_capacity)?;
        let indices = Arc::new(ArcSwap::from_pointee(config.indices.clone()));
        let processed = Arc::new(AtomicU64::new(0));

        info!(
            width = config.width,
            height = config.height,
            coefficients = config.indices.len(),
            "Transform planned"
        );

        let worker = TransformWorker {
            upstream,
            fft,
            indices: Arc::clone(&indices),
            output: producer,
            processed: Arc::clone(&processed),
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
            indices,
            processed,
            worker: Mutex::new(Some(acquisition)),
            flush_timeout: options.flush_timeout,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    /// Replace the coefficient selection; takes effect from the next frame.
    pub fn set_indices(&self, indices: Vec<i32>) {
        debug!(coefficients = indices.len(), "Coefficient indices replaced");
        self.indices.store(Arc::new(indices));
    }

    pub fn indices(&self) -> Arc<Vec<i32>> {
        self.indices.load_full()
    }

    /// Frames transformed since start, whether or not the result fit in the
    /// output queue
    pub fn processed_images(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.monitor.stats()
    }
}

impl ImageQueue for FftProcessor {
    type Item = FftExtract;

    fn get_image(&self) -> Option<FftExtract> {
        self.output.lock().try_pop()
    }

    fn available_images(&self) -> usize {
        self.monitor.len()
    }

    fn wait_images(&self, n: usize, timeout: Duration) -> WaitStatus {
        self.output.lock().wait(n, timeout)
    }

    /// Flush the upstream on the worker, then drop queued results from the
    /// calling (consumer) thread.
    fn flush_images(&self) -> Result<(), StageError> {
        let result = match self.worker.lock().as_ref() {
            Some(acquisition) => acquisition.flush(self.flush_timeout),
            None => Ok(()),
        };

        let cleared = self.output.lock().clear();
        debug!(cleared, "Flushed transform results");
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

        acquisition.stop(self.shutdown_timeout)
    }
}

impl Drop for FftProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Transform shutdown failed: {}", e);
        }
    }
}

struct TransformWorker {
    upstream: Arc<dyn ImageQueue<Item = Frame>>,
    fft: RealFft2d,
    indices: Arc<ArcSwap<Vec<i32>>>,
    output: Producer<FftExtract>,
    processed: Arc<AtomicU64>,
}

impl TransformWorker {
    fn transform(&mut self, frame: &Frame) -> Result<FftExtract, TransformError> {
        let data = frame.data();
        match frame.bits_per_pixel() {
            8 => self.fft.set_data_in(data.iter().map(|&b| f64::from(b)))?,
            16 => self.fft.set_data_in(
                data.chunks_exact(2)
                    .map(|c| f64::from(u16::from_le_bytes([c[0], c[1]]))),
            )?,
            bits => return Err(TransformError::UnsupportedBitDepth(bits)),
        }

        self.fft.transform_forward();

        let indices = self.indices.load();
        Ok(FftExtract {
            coefficients: extract_coefficients(self.fft.output(), &indices)?,
            timestamp: frame.timestamp(),
            sequence: frame.sequence(),
        })
    }
}

impl StageWorker for TransformWorker {
    type Input = Frame;

    fn fetch(&mut self, timeout: Duration) -> Fetch<Frame> {
        fetch_upstream(&*self.upstream, timeout)
    }

    fn process(&mut self, frame: Frame, errors: &mut ErrorReporter) {
        let extract = match self.transform(&frame) {
            Ok(extract) => extract,
            Err(e) => {
                errors.report(format!("Process operation failed: {e}"));
                return;
            }
        };
        // release the frame buffer before queueing
        drop(frame);
        self.processed.fetch_add(1, Ordering::AcqRel);
        metrics::counter!("framepipe_transforms_total").increment(1);

        if self.output.try_push(extract).is_err() {
            metrics::counter!("framepipe_frames_dropped_total", "stage" => STAGE_NAME)
                .increment(1);
            errors.report("Could not push the transformed data to the output queue.");
        }
    }

    fn flush(&mut self, errors: &mut ErrorReporter) -> bool {
        // this worker is the upstream's only consumer
        match self.upstream.flush_images() {
            Ok(()) => true,
            Err(e) => {
                errors.report(format!("Could not flush the upstream stage: {e}"));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::pipeline::stage::ManualSource;
    use crate::pipeline::worker::LoopOptions;

    fn options() -> StageOptions {
        StageOptions {
            queue_capacity: 16,
            loop_options: LoopOptions {
                wait_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config(indices: Vec<i32>) -> TransformConfig {
        TransformConfig {
            width: 4,
            height: 4,
            indices,
        }
    }

    fn mono8(sequence: u64, timestamp: u64) -> Frame {
        let data: Vec<u8> = (0..16).map(|i| (i * 3 % 7) as u8).collect();
        Frame::new(
            data,
            FrameMetadata {
                sequence,
                width: 4,
                height: 4,
                format: PixelFormat::Mono8,
                timestamp,
            },
        )
    }

    fn reference_output(frame: &Frame) -> Vec<Complex64> {
        let mut fft = RealFft2d::new(4, 4).unwrap();
        fft.set_data_in(frame.data().iter().map(|&b| f64::from(b)))
            .unwrap();
        fft.transform_forward();
        fft.output().to_vec()
    }

    #[test]
    fn test_extract_coefficients() {
        let output = [
            Complex64::new(1.0, 0.0),
            Complex64::new(2.0, 3.0),
            Complex64::new(4.0, -5.0),
        ];
        assert_eq!(
            extract_coefficients(&output, &[1, -2, 0]).unwrap(),
            vec![output[1], Complex64::new(4.0, 5.0), output[0]]
        );
        assert_eq!(
            extract_coefficients(&output, &[-3]),
            Err(TransformError::IndexOutOfRange { index: -3, len: 3 })
        );
        assert!(extract_coefficients(&output, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_positive_and_conjugate_indices() {
        let source = Arc::new(ManualSource::<Frame>::new(16).unwrap());
        let processor =
            FftProcessor::initialize(&config(vec![2, -3]), source.clone(), &options()).unwrap();

        let frame = mono8(7, 42);
        let raw = reference_output(&frame);
        source.push(frame).unwrap();

        assert_eq!(
            processor.wait_images(1, Duration::from_secs(5)),
            WaitStatus::Satisfied
        );
        let extract = processor.get_image().unwrap();
        assert_eq!(extract.coefficients.len(), 2);
        assert_eq!(extract.coefficients[0], raw[2]);
        assert_eq!(extract.coefficients[1], raw[3].conj());
        assert_eq!(extract.timestamp, 42);
        assert_eq!(extract.sequence, 7);
        assert_eq!(processor.processed_images(), 1);
    }

    #[test]
    fn test_bad_index_skips_frame_and_continues() {
        let source = Arc::new(ManualSource::<Frame>::new(16).unwrap());
        let processor =
            FftProcessor::initialize(&config(vec![12]), source.clone(), &options()).unwrap();

        source.push(mono8(0, 0)).unwrap();
        assert_eq!(
            processor.wait_images(1, Duration::from_millis(300)),
            WaitStatus::TimedOut
        );
        let error = processor.get_error().unwrap();
        assert!(error.contains("index 12 out of range"), "{error}");

        processor.set_indices(vec![0]);
        assert_eq!(*processor.indices(), vec![0]);

        let frame = mono8(1, 1);
        let dc: f64 = frame.data().iter().map(|&b| f64::from(b)).sum();
        source.push(frame).unwrap();
        assert_eq!(
            processor.wait_images(1, Duration::from_secs(5)),
            WaitStatus::Satisfied
        );
        let coefficients = processor.get_image().unwrap().coefficients;
        assert_eq!(coefficients.len(), 1);
        assert!((coefficients[0] - Complex64::new(dc, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn test_sixteen_bit_samples_are_little_endian() {
        let source = Arc::new(ManualSource::<Frame>::new(16).unwrap());
        let processor =
            FftProcessor::initialize(&config(vec![0]), source.clone(), &options()).unwrap();

        let data: Vec<u8> = std::iter::repeat([0x01, 0x02]).take(16).flatten().collect();
        let meta = FrameMetadata {
            width: 4,
            height: 4,
            format: PixelFormat::Mono16,
            ..Default::default()
        };
        source.push(Frame::new(data, meta)).unwrap();

        assert_eq!(
            processor.wait_images(1, Duration::from_secs(5)),
            WaitStatus::Satisfied
        );
        let extract = processor.get_image().unwrap();
        assert_eq!(extract.coefficients.len(), 1);
        assert!((extract.coefficients[0] - Complex64::new(16.0 * 513.0, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn test_unsupported_input_is_reported() {
        let source = Arc::new(ManualSource::<Frame>::new(16).unwrap());
        let processor =
            FftProcessor::initialize(&config(vec![0]), source.clone(), &options()).unwrap();

        let rgb = FrameMetadata {
            format: PixelFormat::Rgb24,
            ..Default::default()
        };
        source.push(Frame::new(vec![0u8; 48], rgb)).unwrap();
        source.push(Frame::new(vec![0u8; 9], FrameMetadata::default())).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while processor.error_count() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let errors = processor.get_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("unsupported bit depth 24"));
        assert!(errors[1].contains("image=9; buffer=16"));
        assert_eq!(processor.processed_images(), 0);
    }

    #[test]
    fn test_flush_reaches_upstream() {
        let source = Arc::new(ManualSource::<Frame>::new(16).unwrap());
        let processor =
            FftProcessor::initialize(&config(vec![0]), source.clone(), &options()).unwrap();

        for i in 0..3 {
            source.push(mono8(i, i)).unwrap();
        }
        assert_eq!(
            processor.wait_images(3, Duration::from_secs(5)),
            WaitStatus::Satisfied
        );

        processor.flush_images().unwrap();
        assert_eq!(processor.available_images(), 0);
        assert_eq!(source.available_images(), 0);

        // processing resumes after the flush
        source.push(mono8(3, 3)).unwrap();
        assert_eq!(
            processor.wait_images(1, Duration::from_secs(5)),
            WaitStatus::Satisfied
        );
        assert_eq!(processor.get_image().unwrap().sequence, 3);
        assert_eq!(processor.error_count(), 0);
    }

    #[test]
    fn test_invalid_dimensions_fail_initialize() {
        let source = Arc::new(ManualSource::<Frame>::new(16).unwrap());
        let config = TransformConfig {
            width: 0,
            height: 4,
            indices: vec![],
        };
        assert!(matches!(
            FftProcessor::initialize(&config, source, &options()),
            Err(StageError::Transform(TransformError::InvalidDimensions { .. }))
        ));
    }
}

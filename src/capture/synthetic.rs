//! Software camera that produces a moving test pattern at a fixed rate
//!
//! Implements the device boundary the same way a hardware driver would:
//! frames are only produced into buffers that were queued beforehand, and a
//! resolution change makes undersized buffers fail until they are replaced.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use super::device::{BufferStatus, DeviceControl, DeviceStream, Retrieved};
use super::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::DeviceError;
use crate::utils::monotonic_ticks;
use crate::CaptureConfig;

pub struct SyntheticCamera;

impl SyntheticCamera {
    /// Open a camera with the geometry, rate and buffer count from `config`.
    pub fn open(config: &CaptureConfig) -> (Arc<SyntheticControl>, SyntheticStream) {
        info!(
            "Opening synthetic camera {}x{} {:?} @ {} fps",
            config.width, config.height, config.format, config.fps
        );

        let control = Arc::new(SyntheticControl {
            width: AtomicU32::new(config.width),
            height: AtomicU32::new(config.height),
            format: config.format,
            acquiring: AtomicBool::new(false),
        });

        let stream = SyntheticStream {
            control: Arc::clone(&control),
            queued: VecDeque::new(),
            aborted: VecDeque::new(),
            maximum: config.buffer_count.max(1) as usize,
            interval: Duration::from_secs(1) / config.fps.max(1),
            next_due: None,
            sequence: 0,
            frame_limit: config.frame_limit,
        };

        (control, stream)
    }
}

pub struct SyntheticControl {
    width: AtomicU32,
    height: AtomicU32,
    format: PixelFormat,
    acquiring: AtomicBool,
}

impl SyntheticControl {
    /// Change the output geometry, which changes the payload size.
    pub fn set_resolution(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
    }

    pub fn resolution(&self) -> (u32, u32) {
        (
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
        )
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::Acquire)
    }
}

impl DeviceControl for SyntheticControl {
    fn payload_size(&self) -> Result<usize, DeviceError> {
        let (width, height) = self.resolution();
        Ok(self.format.payload_size(width, height))
    }

    fn start_acquisition(&self) -> Result<(), DeviceError> {
        self.acquiring.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<(), DeviceError> {
        self.acquiring.store(false, Ordering::Release);
        Ok(())
    }
}

pub struct SyntheticStream {
    control: Arc<SyntheticControl>,
    queued: VecDeque<Frame>,
    aborted: VecDeque<Frame>,
    maximum: usize,
    interval: Duration,
    next_due: Option<Instant>,
    sequence: u64,
    frame_limit: Option<u64>,
}

impl SyntheticStream {
    fn exhausted(&self) -> bool {
        self.frame_limit.is_some_and(|limit| self.sequence >= limit)
    }

    /// Sleep until the next frame is due; false if that is beyond `timeout`.
    fn pace(&mut self, timeout: Duration) -> bool {
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);

        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return false;
            }
            thread::sleep(wait);
        }

        self.next_due = Some((due + self.interval).max(now));
        true
    }

    fn render(&mut self, mut frame: Frame) -> Retrieved {
        let (width, height) = self.control.resolution();
        let format = self.control.format;
        let required = format.payload_size(width, height);

        if frame.len() < required {
            let capacity = frame.len();
            return Retrieved {
                frame,
                status: BufferStatus::Failed(DeviceError::BufferTooSmall { capacity, required }),
            };
        }

        frame.truncate(required);
        fill_pattern(frame.data_mut(), width as usize, format, self.sequence);
        frame.meta = FrameMetadata {
            sequence: self.sequence,
            width,
            height,
            format,
            timestamp: monotonic_ticks(),
        };
        self.sequence += 1;

        Retrieved {
            frame,
            status: BufferStatus::Complete,
        }
    }
}

impl DeviceStream for SyntheticStream {
    fn queue_buffer(&mut self, frame: Frame) -> Result<(), DeviceError> {
        if self.queued.len() >= self.maximum {
            return Err(DeviceError::QueueFull {
                maximum: self.maximum,
            });
        }
        self.queued.push_back(frame);
        Ok(())
    }

    fn retrieve_buffer(&mut self, timeout: Duration) -> Result<Retrieved, DeviceError> {
        if let Some(frame) = self.aborted.pop_front() {
            return Ok(Retrieved {
                frame,
                status: BufferStatus::Aborted,
            });
        }

        if !self.control.is_acquiring() || self.queued.is_empty() || self.exhausted() {
            self.next_due = None;
            thread::sleep(timeout);
            return Err(DeviceError::Timeout);
        }

        if !self.pace(timeout) {
            return Err(DeviceError::Timeout);
        }

        match self.queued.pop_front() {
            Some(frame) => Ok(self.render(frame)),
            None => Err(DeviceError::Timeout),
        }
    }

    fn abort_queued_buffers(&mut self) {
        self.aborted.extend(self.queued.drain(..));
    }

    fn queued_buffer_count(&self) -> usize {
        self.queued.len()
    }

    fn queued_buffer_maximum(&self) -> usize {
        self.maximum
    }
}

/// Diagonal gradient that shifts by one per frame
fn fill_pattern(data: &mut [u8], width: usize, format: PixelFormat, sequence: u64) {
    let bytes_per_pixel = (format.bits_per_pixel() / 8) as usize;
    let width = width.max(1);

    for (index, pixel) in data.chunks_exact_mut(bytes_per_pixel).enumerate() {
        let (x, y) = (index % width, index / width);
        let value = (x as u64 + y as u64 + sequence) as u8;
        match format {
            PixelFormat::Mono16 => {
                pixel.copy_from_slice(&(u16::from(value) * 257).to_le_bytes());
            }
            PixelFormat::Mono8 | PixelFormat::Rgb24 => pixel.fill(value),
        }
    }
}

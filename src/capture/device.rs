//! Boundary to the physical capture device
//!
//! A device is split in two halves: the control half (parameters, start and
//! stop) may be used from any thread, while the stream half with its queue of
//! in-flight buffers belongs to the acquisition worker alone.

use std::time::Duration;

use super::frame::Frame;
use crate::error::DeviceError;

/// How a retrieved buffer was completed by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferStatus {
    Complete,
    /// Returned unfilled because the queue was aborted
    Aborted,
    /// The device filled the buffer with a non-image payload
    NotImage,
    Failed(DeviceError),
}

/// A buffer handed back by the device
#[derive(Debug)]
pub struct Retrieved {
    pub frame: Frame,
    pub status: BufferStatus,
}

pub trait DeviceControl: Send + Sync {
    /// Bytes needed to hold one frame at the current settings
    fn payload_size(&self) -> Result<usize, DeviceError>;

    fn start_acquisition(&self) -> Result<(), DeviceError>;

    fn stop_acquisition(&self) -> Result<(), DeviceError>;
}

pub trait DeviceStream: Send + 'static {
    /// Give an empty buffer to the device to fill.
    fn queue_buffer(&mut self, frame: Frame) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for the device to hand back a buffer.
    fn retrieve_buffer(&mut self, timeout: Duration) -> Result<Retrieved, DeviceError>;

    /// Make every queued buffer retrievable immediately with status
    /// [`BufferStatus::Aborted`].
    fn abort_queued_buffers(&mut self);

    fn queued_buffer_count(&self) -> usize;

    fn queued_buffer_maximum(&self) -> usize;
}

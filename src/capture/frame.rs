use std::fmt;
use std::sync::Weak;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use super::pool::PoolShared;

/// A uniquely owned image buffer.
///
/// Frames are never cloned. Dropping a frame that came from a [`FramePool`]
/// hands its buffer back to the pool.
///
/// [`FramePool`]: super::pool::FramePool
pub struct Frame {
    data: BytesMut,

    /// Frame metadata
    pub meta: FrameMetadata,

    recycler: Option<Weak<PoolShared>>,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture time in monotonic ticks (nanoseconds)
    pub timestamp: u64,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Mono8,
    /// 16-bit little-endian
    Mono16,
    Rgb24,
}

impl PixelFormat {
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Mono16 => 16,
            PixelFormat::Rgb24 => 24,
        }
    }

    /// Payload size of a `width` x `height` image
    pub fn payload_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bits_per_pixel() as usize / 8
    }
}

impl Frame {
    /// A standalone frame holding a copy of `data`, freed normally on drop
    pub fn new(data: impl AsRef<[u8]>, meta: FrameMetadata) -> Self {
        Self {
            data: BytesMut::from(data.as_ref()),
            meta,
            recycler: None,
        }
    }

    pub(crate) fn pooled(data: BytesMut, recycler: Weak<PoolShared>) -> Self {
        Self {
            data,
            meta: FrameMetadata::default(),
            recycler: Some(recycler),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shrink the valid payload to `len` bytes (a no-op if already shorter).
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.meta.format.bits_per_pixel()
    }

    pub fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .field("pooled", &self.recycler.is_some())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.recycler.take().and_then(|weak| weak.upgrade()) {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod transform;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{DeviceError, QueueError, StageError, TransformError};
pub use pipeline::{ImageQueue, Pipeline, StageOptions, WaitStatus};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    /// Disk writer after the source, if set
    pub storage: Option<StorageConfig>,
    /// Transform stage at the end of the chain, if set
    pub transform: Option<TransformConfig>,
}

impl Config {
    /// Defaults, overlaid by the TOML file at `path` (if given) and then by
    /// `FRAMEPIPE__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix("FRAMEPIPE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Buffers kept queued on the device
    pub buffer_count: u32,
    /// Stop producing after this many frames
    pub frame_limit: Option<u64>,
    pub elevate_priority: bool,
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output queue slots per stage; a power of two
    pub queue_capacity: usize,
    /// Error channel slots per stage; a power of two
    pub error_capacity: usize,
    pub pool_retain: usize,
    pub wait_timeout_ms: u64,
    pub error_backoff_ms: u64,
    pub flush_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Forward written frames to the next stage
    pub pass_through: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub width: usize,
    pub height: usize,
    /// Output bins to keep; `-k` keeps the conjugate of bin `k`
    pub indices: Vec<i32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mono8,
            buffer_count: 16,
            frame_limit: None,
            elevate_priority: true,
            pin_core: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1 << 17,
            error_capacity: 1 << 10,
            pool_retain: 64,
            wait_timeout_ms: 1000,
            error_backoff_ms: 1,
            flush_timeout_ms: 10_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("frames.bin"),
            pass_through: true,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            indices: vec![0],
        }
    }
}

pub mod device;
pub mod frame;
pub mod pool;
pub mod source;
pub mod synthetic;

pub use device::{BufferStatus, DeviceControl, DeviceStream, Retrieved};
pub use frame::Frame;
pub use frame::{FrameMetadata, PixelFormat};
pub use pool::{FramePool, PoolStats};
pub use source::CameraSource;
pub use synthetic::SyntheticCamera;

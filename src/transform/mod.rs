pub mod fft;
pub mod processor;

pub use fft::RealFft2d;
pub use processor::{extract_coefficients, FftExtract, FftProcessor};

//! JPEG compression worker

pub mod compressor;

pub use compressor::{JpegCompressor, JpegListener, Rejected};

//! Stream pixel formats and sizes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel formats a stream can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PixelFormat {
    /// 16-bit Bayer mosaic (RGGB), one sample per pixel
    Raw16,
    /// Packed 8-bit RGB
    Rgb888,
    /// Packed 8-bit RGB with opaque alpha
    Rgba8888,
    /// YUV 4:2:0, Y plane followed by interleaved VU
    Nv21,
    /// YUV 4:2:0 planar; accepted by stream configuration, not rendered
    Yv12,
    /// Compressed image (JPEG)
    Blob,
    /// 16-bit depth samples
    Depth16,
    /// Count-prefixed list of (x, y, z, confidence) points
    DepthPointCloud,
}

impl PixelFormat {
    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Blob)
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, PixelFormat::Depth16 | PixelFormat::DepthPointCloud)
    }

    /// Bytes per pixel for packed formats; None for planar and variable-size ones
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Raw16 | PixelFormat::Depth16 => Some(2),
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Rgba8888 => Some(4),
            PixelFormat::Nv21 | PixelFormat::Yv12 => None,
            PixelFormat::Blob | PixelFormat::DepthPointCloud => None,
        }
    }

    /// Bytes needed for a buffer with `stride` pixels per row and `height` rows.
    ///
    /// Compressed buffers get `max_compressed` bytes.
    pub fn buffer_size(&self, stride: u32, height: u32, max_compressed: usize) -> usize {
        let pixels = stride as usize * height as usize;
        match self {
            PixelFormat::Raw16 | PixelFormat::Depth16 => pixels * 2,
            PixelFormat::Rgb888 => pixels * 3,
            PixelFormat::Rgba8888 => pixels * 4,
            PixelFormat::Nv21 | PixelFormat::Yv12 => pixels * 3 / 2,
            PixelFormat::Blob => max_compressed,
            PixelFormat::DepthPointCloud => crate::sensor::encode::POINT_CLOUD_BYTES,
        }
    }

    pub fn all() -> &'static [PixelFormat] {
        &[
            PixelFormat::Raw16,
            PixelFormat::Rgb888,
            PixelFormat::Rgba8888,
            PixelFormat::Nv21,
            PixelFormat::Yv12,
            PixelFormat::Blob,
            PixelFormat::Depth16,
            PixelFormat::DepthPointCloud,
        ]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Raw16 => "RAW16",
            PixelFormat::Rgb888 => "RGB888",
            PixelFormat::Rgba8888 => "RGBA8888",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yv12 => "YV12",
            PixelFormat::Blob => "BLOB",
            PixelFormat::Depth16 => "DEPTH16",
            PixelFormat::DepthPointCloud => "DEPTH_POINT_CLOUD",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RAW16" | "RAW_SENSOR" => Ok(PixelFormat::Raw16),
            "RGB888" | "RGB24" => Ok(PixelFormat::Rgb888),
            "RGBA8888" => Ok(PixelFormat::Rgba8888),
            "NV21" | "YCRCB_420_SP" => Ok(PixelFormat::Nv21),
            "YV12" => Ok(PixelFormat::Yv12),
            "BLOB" | "JPEG" => Ok(PixelFormat::Blob),
            "DEPTH16" | "Y16" => Ok(PixelFormat::Depth16),
            "DEPTH_POINT_CLOUD" => Ok(PixelFormat::DepthPointCloud),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const QVGA: Resolution = Resolution {
        width: 320,
        height: 240,
    };
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

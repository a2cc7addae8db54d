//! Simulated image sensor
//!
//! This module contains the sensor physics constants, the procedural
//! scene, the per-format pixel encoders, the owned stream buffers and the
//! free-running capture engine that ties them together.

pub mod buffer;
pub mod capture;
pub mod encode;
pub mod format;
pub mod scene;

pub use buffer::{BufferStatus, Fence, LockedBuffer, StreamBuffer};
pub use capture::{CapturedFrame, Sensor, SensorEvent, SensorListener, SensorPhase, SensorStats};
pub use format::{PixelFormat, Resolution};
pub use scene::{ColorFilter, Material, Scene};

use serde::{Deserialize, Serialize};

/// Exposure time range in nanoseconds (1 us to 0.3 s)
pub const EXPOSURE_TIME_RANGE: (u64, u64) = (1_000, 300_000_000);
/// Frame duration range in nanoseconds (~1/30 s to 0.3 s)
pub const FRAME_DURATION_RANGE: (u64, u64) = (33_331_760, 300_000_000);
/// Shortest gap between the end of one exposure and the next frame
pub const MIN_VERTICAL_BLANK: u64 = 10_000;
/// ISO-style sensitivity range
pub const SENSITIVITY_RANGE: (u32, u32) = (100, 1600);
pub const DEFAULT_SENSITIVITY: u32 = 100;

/// Output characteristics
pub const MAX_RAW_VALUE: u32 = 4000;
pub const BLACK_LEVEL: u32 = 1000;

/// Pixel well characteristics
pub const SATURATION_VOLTAGE: f32 = 0.520;
pub const SATURATION_ELECTRONS: u32 = 2000;
pub const VOLTS_PER_LUX_SECOND: f32 = 0.100;
pub const ELECTRONS_PER_LUX_SECOND: f32 =
    SATURATION_ELECTRONS as f32 / SATURATION_VOLTAGE * VOLTS_PER_LUX_SECOND;
/// Digital counts per electron at unit sensitivity
pub const BASE_GAIN_FACTOR: f32 = MAX_RAW_VALUE as f32 / SATURATION_ELECTRONS as f32;

/// Read noise, in electrons before gain and in counts after gain
pub const READ_NOISE_STDDEV_BEFORE_GAIN: f32 = 1.177;
pub const READ_NOISE_STDDEV_AFTER_GAIN: f32 = 2.100;
pub const READ_NOISE_VAR_BEFORE_GAIN: f32 = READ_NOISE_STDDEV_BEFORE_GAIN * READ_NOISE_STDDEV_BEFORE_GAIN;
pub const READ_NOISE_VAR_AFTER_GAIN: f32 = READ_NOISE_STDDEV_AFTER_GAIN * READ_NOISE_STDDEV_AFTER_GAIN;

/// Per-frame sensor controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorControls {
    pub exposure_ns: u64,
    pub frame_duration_ns: u64,
    pub sensitivity: u32,
    pub frame_number: u32,
}

impl Default for SensorControls {
    fn default() -> Self {
        Self {
            exposure_ns: FRAME_DURATION_RANGE.0 - MIN_VERTICAL_BLANK,
            frame_duration_ns: FRAME_DURATION_RANGE.0,
            sensitivity: DEFAULT_SENSITIVITY,
            frame_number: 0,
        }
    }
}

impl SensorControls {
    pub fn new(exposure_ns: u64, frame_duration_ns: u64, sensitivity: u32, frame_number: u32) -> Self {
        Self {
            exposure_ns,
            frame_duration_ns,
            sensitivity,
            frame_number,
        }
    }

    /// Clamp every field into its range and stretch the frame duration so
    /// that `frame_duration_ns >= exposure_ns + MIN_VERTICAL_BLANK`.
    pub fn clamped(self) -> Self {
        let exposure_ns = self.exposure_ns.clamp(EXPOSURE_TIME_RANGE.0, EXPOSURE_TIME_RANGE.1);
        let frame_duration_ns = self
            .frame_duration_ns
            .clamp(FRAME_DURATION_RANGE.0, FRAME_DURATION_RANGE.1)
            .max(exposure_ns + MIN_VERTICAL_BLANK);
        Self {
            exposure_ns,
            frame_duration_ns,
            sensitivity: self.sensitivity.clamp(SENSITIVITY_RANGE.0, SENSITIVITY_RANGE.1),
            frame_number: self.frame_number,
        }
    }
}

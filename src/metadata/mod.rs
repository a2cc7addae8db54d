//! Per-request settings and per-frame result metadata
//!
//! A [`Metadata`] bag maps a [`Tag`] to a typed [`Value`]. Requests carry
//! one as their settings; the pipeline runs 3A over it, augments it with
//! sensor-side facts and hands it back in the capture result.

pub mod enums;
pub mod template;

pub use enums::*;
pub use template::{default_settings, RequestTemplate};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CameraError, Result};

/// Metadata keys understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    // request
    RequestId,
    RequestFrameCount,
    RequestPipelineDepth,

    // control
    ControlMode,
    ControlSceneMode,
    ControlCaptureIntent,
    ControlEffectMode,
    ControlAeMode,
    ControlAeLock,
    ControlAePrecaptureTrigger,
    ControlAePrecaptureId,
    ControlAeTargetFpsRange,
    ControlAeState,
    ControlAfMode,
    ControlAfTrigger,
    ControlAfTriggerId,
    ControlAfState,
    ControlAwbMode,
    ControlAwbLock,
    ControlAwbState,

    // sensor
    SensorExposureTime,
    SensorFrameDuration,
    SensorSensitivity,
    SensorTimestamp,
    SensorRollingShutterSkew,

    // lens
    LensFocalLength,
    LensFocusDistance,
    LensAperture,
    LensFocusRange,
    LensState,

    // flash
    FlashMode,
    FlashState,

    // processing blocks
    HotPixelMode,
    NoiseReductionMode,
    ShadingMode,
    ColorCorrectionMode,
    TonemapMode,
    EdgeMode,

    ScalerCropRegion,

    // jpeg
    JpegQuality,
    JpegThumbnailSize,
    JpegOrientation,

    // statistics
    StatisticsFaceDetectMode,
    StatisticsSceneFlicker,
}

/// A single metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Byte(u8),
    Int(i32),
    Long(i64),
    Float(f32),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::Ints(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Floats(v)
    }
}

/// Ordered key/value metadata bag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<Tag, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: Tag, value: impl Into<Value>) {
        self.entries.insert(tag, value.into());
    }

    pub fn get(&self, tag: Tag) -> Option<&Value> {
        self.entries.get(&tag)
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Value> {
        self.entries.remove(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &Value)> {
        self.entries.iter().map(|(tag, value)| (*tag, value))
    }

    pub fn byte(&self, tag: Tag) -> Option<u8> {
        match self.get(tag)? {
            Value::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn int(&self, tag: Tag) -> Option<i32> {
        match self.get(tag)? {
            Value::Int(v) => Some(*v),
            Value::Byte(v) => Some(*v as i32),
            _ => None,
        }
    }

    pub fn long(&self, tag: Tag) -> Option<i64> {
        match self.get(tag)? {
            Value::Long(v) => Some(*v),
            Value::Int(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn float(&self, tag: Tag) -> Option<f32> {
        match self.get(tag)? {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn ints(&self, tag: Tag) -> Option<&[i32]> {
        match self.get(tag)? {
            Value::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn floats(&self, tag: Tag) -> Option<&[f32]> {
        match self.get(tag)? {
            Value::Floats(v) => Some(v),
            _ => None,
        }
    }

    /// Read an enum entry.
    ///
    /// Returns `Ok(None)` when the entry is absent and an error when it holds
    /// something other than a known byte value.
    pub fn get_enum<E: MetadataEnum>(&self, tag: Tag) -> Result<Option<E>> {
        let Some(value) = self.get(tag) else {
            return Ok(None);
        };
        match value {
            Value::Byte(v) => E::from_u8(*v)
                .map(Some)
                .ok_or_else(|| CameraError::Config(format!("unknown value {} for {:?}", v, tag))),
            other => Err(CameraError::Config(format!(
                "{:?} must be a byte, got {:?}",
                tag, other
            ))),
        }
    }

    pub fn set_enum<E: MetadataEnum>(&mut self, tag: Tag, value: E) {
        self.set(tag, value.to_u8());
    }

    /// Boolean switch stored as a byte (lock flags)
    pub fn flag(&self, tag: Tag) -> bool {
        self.byte(tag).is_some_and(|v| v != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut md = Metadata::new();
        md.set(Tag::SensorExposureTime, 10_000_000i64);
        md.set(Tag::SensorSensitivity, 100i32);
        md.set(Tag::LensAperture, 2.8f32);
        md.set(Tag::ControlAeTargetFpsRange, vec![5, 30]);

        assert_eq!(md.long(Tag::SensorExposureTime), Some(10_000_000));
        assert_eq!(md.long(Tag::SensorSensitivity), Some(100));
        assert_eq!(md.float(Tag::LensAperture), Some(2.8));
        assert_eq!(md.ints(Tag::ControlAeTargetFpsRange), Some(&[5, 30][..]));
        assert_eq!(md.byte(Tag::SensorSensitivity), None);
        assert_eq!(md.len(), 4);
    }

    #[test]
    fn test_enum_access() {
        let mut md = Metadata::new();
        assert_eq!(md.get_enum::<AfMode>(Tag::ControlAfMode).unwrap(), None);

        md.set_enum(Tag::ControlAfMode, AfMode::ContinuousVideo);
        assert_eq!(
            md.get_enum::<AfMode>(Tag::ControlAfMode).unwrap(),
            Some(AfMode::ContinuousVideo)
        );

        md.set(Tag::ControlAwbMode, 42u8);
        let err = md.get_enum::<AwbMode>(Tag::ControlAwbMode).unwrap_err();
        assert_eq!(err.code(), "configuration");
    }

    #[test]
    fn test_serialization() {
        let mut md = Metadata::new();
        md.set_enum(Tag::ControlMode, ControlMode::Auto);
        md.set(Tag::JpegQuality, 80u8);

        let json = serde_json::to_string(&md).unwrap();
        assert!(json.contains("control_mode"));
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, md);
    }
}

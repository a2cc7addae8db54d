//! Default request settings per use case

use serde::{Deserialize, Serialize};

use super::enums::*;
use super::{Metadata, Tag};
use crate::config::{Capability, CapabilitySet};
use crate::error::{CameraError, Result};
use crate::sensor::Resolution;

/// Request template kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
    Manual,
}

impl RequestTemplate {
    pub const ALL: [RequestTemplate; 6] = [
        RequestTemplate::Preview,
        RequestTemplate::StillCapture,
        RequestTemplate::VideoRecord,
        RequestTemplate::VideoSnapshot,
        RequestTemplate::ZeroShutterLag,
        RequestTemplate::Manual,
    ];

    fn is_video(self) -> bool {
        matches!(self, RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot)
    }

    fn capture_intent(self) -> CaptureIntent {
        match self {
            RequestTemplate::Preview => CaptureIntent::Preview,
            RequestTemplate::StillCapture => CaptureIntent::StillCapture,
            RequestTemplate::VideoRecord => CaptureIntent::VideoRecord,
            RequestTemplate::VideoSnapshot => CaptureIntent::VideoSnapshot,
            RequestTemplate::ZeroShutterLag => CaptureIntent::ZeroShutterLag,
            RequestTemplate::Manual => CaptureIntent::Manual,
        }
    }

    fn af_mode(self) -> AfMode {
        match self {
            RequestTemplate::Preview
            | RequestTemplate::StillCapture
            | RequestTemplate::ZeroShutterLag => AfMode::ContinuousPicture,
            RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => AfMode::ContinuousVideo,
            RequestTemplate::Manual => AfMode::Off,
        }
    }

    fn processing_mode(self) -> ProcessingMode {
        match self {
            RequestTemplate::StillCapture
            | RequestTemplate::VideoSnapshot
            | RequestTemplate::ZeroShutterLag => ProcessingMode::HighQuality,
            _ => ProcessingMode::Fast,
        }
    }
}

/// Build the default settings for `template`.
///
/// Cameras without backward-compatible output only offer the preview template.
pub fn default_settings(
    template: RequestTemplate,
    caps: &CapabilitySet,
    resolution: Resolution,
) -> Result<Metadata> {
    let compatible = caps.has(Capability::BackwardCompatible);
    if !compatible && template != RequestTemplate::Preview {
        return Err(CameraError::Config(format!(
            "template {:?} needs backward-compatible output",
            template
        )));
    }
    let manual = template == RequestTemplate::Manual;

    let mut md = Metadata::new();
    md.set(Tag::RequestId, 0i32);
    md.set(Tag::RequestFrameCount, 0i32);
    md.set(Tag::LensFocalLength, 5.0f32);

    if compatible {
        md.set(Tag::LensFocusDistance, 0.0f32);
        md.set(Tag::LensAperture, 2.8f32);
        md.set_enum(Tag::FlashMode, FlashMode::Off);
        md.set(
            Tag::ScalerCropRegion,
            vec![0, 0, resolution.width as i32, resolution.height as i32],
        );
        md.set(Tag::JpegQuality, 80u8);
        md.set(Tag::JpegThumbnailSize, vec![640, 480]);
        md.set(Tag::JpegOrientation, 0i32);
        md.set_enum(Tag::StatisticsFaceDetectMode, FaceDetectMode::Off);
    }

    if caps.has(Capability::ManualSensor) {
        md.set(Tag::SensorExposureTime, 10_000_000i64);
        md.set(Tag::SensorFrameDuration, 33_333_333i64);
        md.set(Tag::SensorSensitivity, 100i32);
    }

    if caps.has(Capability::ManualPostProcessing) {
        let mode = template.processing_mode();
        for tag in [
            Tag::HotPixelMode,
            Tag::NoiseReductionMode,
            Tag::ShadingMode,
            Tag::ColorCorrectionMode,
            Tag::TonemapMode,
            Tag::EdgeMode,
        ] {
            md.set_enum(tag, mode);
        }
    }

    md.set_enum(Tag::ControlCaptureIntent, template.capture_intent());
    md.set_enum(
        Tag::ControlMode,
        if manual { ControlMode::Off } else { ControlMode::Auto },
    );
    let min_fps = if template.is_video() { 30 } else { 5 };
    md.set(Tag::ControlAeTargetFpsRange, vec![min_fps, 30]);

    if compatible {
        md.set_enum(Tag::ControlEffectMode, EffectMode::Off);
        md.set_enum(Tag::ControlSceneMode, SceneMode::FacePriority);
        md.set_enum(Tag::ControlAeMode, if manual { AeMode::Off } else { AeMode::On });
        md.set(Tag::ControlAeLock, 0u8);
        md.set_enum(Tag::ControlAePrecaptureTrigger, AePrecaptureTrigger::Idle);
        md.set_enum(Tag::ControlAwbMode, if manual { AwbMode::Off } else { AwbMode::Auto });
        md.set(Tag::ControlAwbLock, 0u8);
        md.set_enum(Tag::ControlAfMode, template.af_mode());
        md.set_enum(Tag::ControlAfTrigger, AfTrigger::Idle);
    }

    Ok(md)
}

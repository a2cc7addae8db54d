//! 3A simulation
//!
//! [`ThreeA`] runs the AE, AF and AWB state machines once per request,
//! writes their outcome back into the request settings and reports AE/AF
//! state changes as [`CameraEvent`]s for the caller to publish.

pub mod ae;
pub mod af;
pub mod awb;

pub use ae::{AeInput, AutoExposure};
pub use af::AutoFocus;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use crate::config::{Capability, CameraConfig, CapabilitySet};
use crate::error::{CameraError, Result};
use crate::events::CameraEvent;
use crate::metadata::{
    AeMode, AePrecaptureTrigger, AeState, AfMode, AfState, AfTrigger, AwbMode, AwbState, ControlMode,
    LensState, Metadata, MetadataEnum, SceneMode, Tag,
};

/// Per-camera 3A state
pub struct ThreeA {
    ae: AutoExposure,
    af: AutoFocus,
    awb_state: AwbState,
    caps: CapabilitySet,
    facing_back: bool,
    face_priority: bool,
    rng: StdRng,
}

impl ThreeA {
    pub fn new(config: &CameraConfig) -> Self {
        let rng = match config.control.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            ae: AutoExposure::new(config.control.stable_ae_max_frames),
            af: AutoFocus::new(),
            awb_state: AwbState::Inactive,
            caps: config.capabilities(),
            facing_back: config.facing_back,
            face_priority: false,
            rng,
        }
    }

    pub fn ae_state(&self) -> AeState {
        self.ae.state()
    }

    pub fn af_state(&self) -> AfState {
        self.af.state()
    }

    pub fn awb_state(&self) -> AwbState {
        self.awb_state
    }

    /// Run 3A for one request and write the results into `settings`.
    ///
    /// Invalid or missing controls are configuration errors; on error the
    /// settings are left untouched.
    pub fn process(&mut self, frame_number: u32, settings: &mut Metadata) -> Result<Vec<CameraEvent>> {
        let ae_before = self.ae.state();
        let af_before = self.af.state();

        let control_mode: ControlMode = settings
            .get_enum(Tag::ControlMode)?
            .ok_or_else(|| CameraError::invalid(frame_number, "missing control mode"))?;

        let ae_active = match control_mode {
            ControlMode::Off => {
                self.ae.reset();
                self.af.reset();
                self.awb_state = AwbState::Inactive;
                false
            }
            ControlMode::UseSceneMode | ControlMode::Auto => {
                self.face_priority = match control_mode {
                    ControlMode::UseSceneMode => self.scene_mode_face_priority(frame_number, settings)?,
                    _ => false,
                };
                self.run(frame_number, settings)?
            }
        };

        self.write_back(settings, ae_active);

        let mut events = Vec::new();
        let ae_after = self.ae.state();
        if ae_after != ae_before {
            events.push(CameraEvent::AeStateChanged {
                frame_number,
                from: ae_before,
                to: ae_after,
                trigger_id: settings.int(Tag::ControlAePrecaptureId),
            });
        }
        let af_after = self.af.state();
        if af_after != af_before {
            events.push(CameraEvent::AfStateChanged {
                frame_number,
                from: af_before,
                to: af_after,
                trigger_id: settings.int(Tag::ControlAfTriggerId),
            });
        }
        trace!(
            "Frame {}: AE {:?} AF {:?} AWB {:?}",
            frame_number,
            ae_after,
            af_after,
            self.awb_state
        );
        Ok(events)
    }

    fn scene_mode_face_priority(&self, frame_number: u32, settings: &Metadata) -> Result<bool> {
        if !self.caps.has(Capability::BackwardCompatible) {
            return Err(CameraError::invalid(
                frame_number,
                "scene mode needs backward-compatible output",
            ));
        }
        match settings.get_enum::<SceneMode>(Tag::ControlSceneMode)? {
            Some(SceneMode::FacePriority) => Ok(true),
            Some(other) => Err(CameraError::invalid(
                frame_number,
                format!("unsupported scene mode {:?}", other),
            )),
            None => Err(CameraError::invalid(frame_number, "missing scene mode")),
        }
    }

    /// Read a mode entry, required when the camera is backward compatible
    fn mode<E: MetadataEnum>(&self, frame_number: u32, settings: &Metadata, tag: Tag, fallback: E) -> Result<E> {
        match settings.get_enum(tag)? {
            Some(mode) => Ok(mode),
            None if self.caps.has(Capability::BackwardCompatible) => {
                Err(CameraError::invalid(frame_number, format!("missing {:?}", tag)))
            }
            None => Ok(fallback),
        }
    }

    /// Run the three state machines; returns whether AE drives the exposure
    fn run(&mut self, frame_number: u32, settings: &Metadata) -> Result<bool> {
        // Validate everything before any state machine moves
        let ae_mode = self.mode(frame_number, settings, Tag::ControlAeMode, AeMode::On)?;
        let af_mode = self.mode(frame_number, settings, Tag::ControlAfMode, AfMode::Off)?;
        let awb_mode = self.mode(frame_number, settings, Tag::ControlAwbMode, AwbMode::Auto)?;
        let af_trigger = settings
            .get_enum::<AfTrigger>(Tag::ControlAfTrigger)?
            .unwrap_or(AfTrigger::Idle);
        let precapture = settings
            .get_enum::<AePrecaptureTrigger>(Tag::ControlAePrecaptureTrigger)?
            == Some(AePrecaptureTrigger::Start);
        let awb_state = awb::step(frame_number, awb_mode, settings.flag(Tag::ControlAwbLock))?;

        self.af
            .step(frame_number, af_mode, af_trigger, self.facing_back, &mut self.rng)?;

        self.ae.step(
            AeInput {
                mode: ae_mode,
                locked: settings.flag(Tag::ControlAeLock),
                precapture,
                face_priority: self.face_priority,
            },
            &mut self.rng,
        );
        self.awb_state = awb_state;

        Ok(ae_mode != AeMode::Off)
    }

    fn write_back(&self, settings: &mut Metadata, ae_active: bool) {
        if ae_active {
            settings.set(Tag::SensorExposureTime, self.ae.current_exposure_ns());
            settings.set(Tag::SensorSensitivity, self.ae.sensitivity());
        }
        settings.set_enum(Tag::ControlAeState, self.ae.state());
        settings.set_enum(Tag::ControlAfState, self.af.state());
        settings.set_enum(Tag::ControlAwbState, self.awb_state);

        let lens = match self.af.state() {
            AfState::PassiveScan | AfState::ActiveScan => LensState::Moving,
            _ => LensState::Stationary,
        };
        settings.set_enum(Tag::LensState, lens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraProfile;
    use crate::metadata::{default_settings, RequestTemplate};
    use crate::sensor::Resolution;

    fn seeded(profile: CameraProfile) -> ThreeA {
        let mut config = CameraConfig {
            profile,
            ..Default::default()
        };
        config.control.seed = Some(11);
        ThreeA::new(&config)
    }

    fn preview() -> Metadata {
        default_settings(
            RequestTemplate::Preview,
            &CameraProfile::Full.capabilities(),
            Resolution::VGA,
        )
        .unwrap()
    }

    #[test]
    fn test_precapture_reports_state_changes() {
        let mut three_a = seeded(CameraProfile::Full);
        let mut settings = preview();
        settings.set_enum(Tag::ControlAePrecaptureTrigger, AePrecaptureTrigger::Start);
        settings.set(Tag::ControlAePrecaptureId, 17i32);

        let events = three_a.process(1, &mut settings).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            CameraEvent::AeStateChanged {
                from: AeState::Inactive,
                to: AeState::Precapture,
                trigger_id: Some(17),
                ..
            }
        )));
        assert_eq!(
            settings.get_enum::<AeState>(Tag::ControlAeState).unwrap(),
            Some(AeState::Precapture)
        );
        assert!(settings.long(Tag::SensorExposureTime).is_some());

        settings.set_enum(Tag::ControlAePrecaptureTrigger, AePrecaptureTrigger::Idle);
        let mut frame = 2;
        while three_a.ae_state() == AeState::Precapture && frame < 50 {
            three_a.process(frame, &mut settings).unwrap();
            frame += 1;
        }
        assert_eq!(three_a.ae_state(), AeState::Converged);
    }

    #[test]
    fn test_control_off_keeps_manual_exposure() {
        let mut three_a = seeded(CameraProfile::Full);
        let mut settings = default_settings(
            RequestTemplate::Manual,
            &CameraProfile::Full.capabilities(),
            Resolution::VGA,
        )
        .unwrap();
        settings.set(Tag::SensorExposureTime, 42_000_000i64);

        three_a.process(1, &mut settings).unwrap();
        assert_eq!(settings.long(Tag::SensorExposureTime), Some(42_000_000));
        assert_eq!(
            settings.get_enum::<AfState>(Tag::ControlAfState).unwrap(),
            Some(AfState::Inactive)
        );
        assert_eq!(
            settings.get_enum::<LensState>(Tag::LensState).unwrap(),
            Some(LensState::Stationary)
        );
    }

    #[test]
    fn test_scene_mode_rules() {
        let mut three_a = seeded(CameraProfile::Full);
        let mut settings = preview();
        settings.set_enum(Tag::ControlMode, ControlMode::UseSceneMode);
        three_a.process(1, &mut settings).unwrap();

        settings.set_enum(Tag::ControlSceneMode, SceneMode::Night);
        let err = three_a.process(2, &mut settings).unwrap_err();
        assert_eq!(err.code(), "configuration");
    }

    #[test]
    fn test_missing_modes_rejected_when_compatible() {
        let mut three_a = seeded(CameraProfile::Full);
        let mut settings = preview();
        settings.remove(Tag::ControlAwbMode);
        let before = three_a.af_state();
        assert_eq!(three_a.process(1, &mut settings).unwrap_err().code(), "configuration");
        assert_eq!(three_a.af_state(), before);

        let mut settings = preview();
        settings.remove(Tag::ControlMode);
        assert!(three_a.process(1, &mut settings).is_err());
    }

    #[test]
    fn test_depth_camera_defaults_modes() {
        let mut three_a = seeded(CameraProfile::Depth);
        let mut settings = default_settings(
            RequestTemplate::Preview,
            &CameraProfile::Depth.capabilities(),
            Resolution::VGA,
        )
        .unwrap();
        three_a.process(1, &mut settings).unwrap();
        assert_eq!(
            settings.get_enum::<AwbState>(Tag::ControlAwbState).unwrap(),
            Some(AwbState::Converged)
        );
    }

    #[test]
    fn test_af_scan_moves_lens() {
        let mut three_a = seeded(CameraProfile::Full);
        let mut settings = preview();
        settings.set_enum(Tag::ControlAfMode, AfMode::Auto);
        settings.set_enum(Tag::ControlAfTrigger, AfTrigger::Start);
        settings.set(Tag::ControlAfTriggerId, 5i32);

        let events = three_a.process(1, &mut settings).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            CameraEvent::AfStateChanged {
                to: AfState::ActiveScan,
                trigger_id: Some(5),
                ..
            }
        )));
        assert_eq!(
            settings.get_enum::<LensState>(Tag::LensState).unwrap(),
            Some(LensState::Moving)
        );
    }
}

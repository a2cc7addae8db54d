//! Enumerated metadata values
//!
//! Every enum is stored in a [`Metadata`](super::Metadata) bag as a single
//! byte, so unknown values coming from a caller are representable and are
//! rejected only where an algorithm actually needs to interpret them.

use serde::{Deserialize, Serialize};

/// An enum stored as one byte in a metadata bag
pub trait MetadataEnum: Sized + Copy {
    fn to_u8(self) -> u8;
    fn from_u8(value: u8) -> Option<Self>;
}

macro_rules! metadata_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl MetadataEnum for $name {
            fn to_u8(self) -> u8 {
                self as u8
            }

            fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $(v if v == $value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

metadata_enum! {
    /// Top-level 3A switch
    ControlMode {
        Off = 0,
        Auto = 1,
        UseSceneMode = 2,
    }
}

metadata_enum! {
    SceneMode {
        Disabled = 0,
        FacePriority = 1,
        Action = 2,
        Portrait = 3,
        Landscape = 4,
        Night = 5,
    }
}

metadata_enum! {
    CaptureIntent {
        Custom = 0,
        Preview = 1,
        StillCapture = 2,
        VideoRecord = 3,
        VideoSnapshot = 4,
        ZeroShutterLag = 5,
        Manual = 6,
    }
}

metadata_enum! {
    AeMode {
        Off = 0,
        On = 1,
        OnAutoFlash = 2,
        OnAlwaysFlash = 3,
        OnAutoFlashRedeye = 4,
    }
}

metadata_enum! {
    AePrecaptureTrigger {
        Idle = 0,
        Start = 1,
    }
}

metadata_enum! {
    AeState {
        Inactive = 0,
        Searching = 1,
        Converged = 2,
        Locked = 3,
        FlashRequired = 4,
        Precapture = 5,
    }
}

metadata_enum! {
    AfMode {
        Off = 0,
        Auto = 1,
        Macro = 2,
        ContinuousVideo = 3,
        ContinuousPicture = 4,
        Edof = 5,
    }
}

metadata_enum! {
    AfTrigger {
        Idle = 0,
        Start = 1,
        Cancel = 2,
    }
}

metadata_enum! {
    AfState {
        Inactive = 0,
        PassiveScan = 1,
        PassiveFocused = 2,
        ActiveScan = 3,
        FocusedLocked = 4,
        NotFocusedLocked = 5,
        PassiveUnfocused = 6,
    }
}

metadata_enum! {
    AwbMode {
        Off = 0,
        Auto = 1,
        Incandescent = 2,
        Fluorescent = 3,
        WarmFluorescent = 4,
        Daylight = 5,
        CloudyDaylight = 6,
        Twilight = 7,
        Shade = 8,
    }
}

metadata_enum! {
    AwbState {
        Inactive = 0,
        Searching = 1,
        Converged = 2,
        Locked = 3,
    }
}

metadata_enum! {
    LensState {
        Stationary = 0,
        Moving = 1,
    }
}

metadata_enum! {
    FlashMode {
        Off = 0,
        Single = 1,
        Torch = 2,
    }
}

metadata_enum! {
    FlashState {
        Unavailable = 0,
        Charging = 1,
        Ready = 2,
        Fired = 3,
    }
}

metadata_enum! {
    /// Shared by noise reduction, edge, shading, tonemap, hot pixel and
    /// color correction mode entries
    ProcessingMode {
        Off = 0,
        Fast = 1,
        HighQuality = 2,
    }
}

metadata_enum! {
    SceneFlicker {
        None = 0,
        Flicker50Hz = 1,
        Flicker60Hz = 2,
    }
}

metadata_enum! {
    FaceDetectMode {
        Off = 0,
        Simple = 1,
        Full = 2,
    }
}

metadata_enum! {
    EffectMode {
        Off = 0,
        Mono = 1,
        Negative = 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_values() {
        assert_eq!(AfState::NotFocusedLocked.to_u8(), 5);
        assert_eq!(AfState::from_u8(3), Some(AfState::ActiveScan));
        assert_eq!(AwbMode::from_u8(8), Some(AwbMode::Shade));
        assert_eq!(AwbMode::from_u8(9), None);
        assert_eq!(AePrecaptureTrigger::from_u8(1), Some(AePrecaptureTrigger::Start));
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&AeState::Precapture).unwrap();
        assert_eq!(json, "\"precapture\"");
    }
}

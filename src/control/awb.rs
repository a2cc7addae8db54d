//! Simulated auto white balance

use crate::error::{CameraError, Result};
use crate::metadata::{AwbMode, AwbState};

/// Resolve the AWB state for one request. Supported modes converge at once.
pub fn step(frame_number: u32, mode: AwbMode, locked: bool) -> Result<AwbState> {
    match mode {
        AwbMode::Off => Ok(AwbState::Inactive),
        AwbMode::Auto
        | AwbMode::Incandescent
        | AwbMode::Fluorescent
        | AwbMode::Daylight
        | AwbMode::Shade => Ok(if locked {
            AwbState::Locked
        } else {
            AwbState::Converged
        }),
        AwbMode::WarmFluorescent | AwbMode::CloudyDaylight | AwbMode::Twilight => {
            Err(CameraError::invalid(
                frame_number,
                format!("unsupported AWB mode {:?}", mode),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_modes() {
        assert_eq!(step(1, AwbMode::Off, false).unwrap(), AwbState::Inactive);
        assert_eq!(step(1, AwbMode::Daylight, false).unwrap(), AwbState::Converged);
        assert_eq!(step(1, AwbMode::Auto, true).unwrap(), AwbState::Locked);
        assert_eq!(step(1, AwbMode::Twilight, false).unwrap_err().code(), "configuration");
    }
}

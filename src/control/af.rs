//! Simulated auto-focus
//!
//! At most one state transition per request. Scans resolve instantly and
//! succeed two times out of three.

use rand::Rng;

use crate::error::{CameraError, Result};
use crate::metadata::{AfMode, AfState, AfTrigger};

#[derive(Debug, Clone)]
pub struct AutoFocus {
    state: AfState,
    mode: Option<AfMode>,
}

impl Default for AutoFocus {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoFocus {
    pub fn new() -> Self {
        Self {
            state: AfState::Inactive,
            mode: None,
        }
    }

    pub fn state(&self) -> AfState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = AfState::Inactive;
    }

    /// Advance one request.
    ///
    /// Front-facing cameras have no focuser and only accept `Off`.
    pub fn step<R: Rng>(
        &mut self,
        frame_number: u32,
        mode: AfMode,
        trigger: AfTrigger,
        facing_back: bool,
        rng: &mut R,
    ) -> Result<AfState> {
        match mode {
            AfMode::Off => {
                self.state = AfState::Inactive;
                return Ok(self.state);
            }
            AfMode::Auto | AfMode::Macro | AfMode::ContinuousVideo | AfMode::ContinuousPicture => {
                if !facing_back {
                    return Err(CameraError::invalid(
                        frame_number,
                        format!("front camera does not support AF mode {:?}", mode),
                    ));
                }
            }
            AfMode::Edof => {
                return Err(CameraError::invalid(
                    frame_number,
                    format!("unsupported AF mode {:?}", mode),
                ));
            }
        }

        let mode_changed = self.mode != Some(mode);
        self.mode = Some(mode);

        let start = match trigger {
            AfTrigger::Idle => false,
            AfTrigger::Start => true,
            AfTrigger::Cancel => {
                // Stays inactive until at least the next request
                self.state = AfState::Inactive;
                return Ok(self.state);
            }
        };

        let continuous = matches!(mode, AfMode::ContinuousVideo | AfMode::ContinuousPicture);

        self.state = match self.state {
            AfState::Inactive if start => {
                if continuous {
                    AfState::NotFocusedLocked
                } else {
                    AfState::ActiveScan
                }
            }
            AfState::Inactive if continuous && !mode_changed => AfState::PassiveScan,
            AfState::PassiveScan | AfState::PassiveFocused if start => sweep(rng),
            AfState::PassiveScan if rng.gen_ratio(1, 3) => AfState::PassiveFocused,
            AfState::ActiveScan => sweep(rng),
            AfState::FocusedLocked | AfState::NotFocusedLocked if start && !continuous => {
                AfState::ActiveScan
            }
            other => other,
        };

        Ok(self.state)
    }
}

/// Finish a focus sweep, focused two times out of three
fn sweep<R: Rng>(rng: &mut R) -> AfState {
    if rng.gen_ratio(2, 3) {
        AfState::FocusedLocked
    } else {
        AfState::NotFocusedLocked
    }
}

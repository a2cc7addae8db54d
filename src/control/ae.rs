//! Simulated auto-exposure
//!
//! AE keeps a current exposure that ramps toward a target at a fixed
//! fraction of the remaining distance per request. A precapture trigger
//! pins the target to the nominal exposure and holds the state machine in
//! `Precapture` until it has run for a minimum number of requests and is
//! within 10% of the target. Without a trigger, a converged AE occasionally
//! picks a new target a few stops away and searches toward it.

use rand::Rng;

use crate::metadata::{AeMode, AeState};
use crate::sensor::DEFAULT_SENSITIVITY;

/// Nominal exposure in normal operation
pub const NORMAL_EXPOSURE_NS: i64 = 10_000_000;
/// Nominal exposure when face priority is active
pub const FACE_PRIORITY_EXPOSURE_NS: i64 = 30_000_000;
/// Requests a precapture sequence runs before it may converge
pub const PRECAPTURE_MIN_FRAMES: u32 = 10;
/// Fraction of the remaining distance covered per request
pub const EXPOSURE_TRACK_RATE: f64 = 0.1;
/// Range, in stops around nominal, of a new search target
pub const EXPOSURE_WANDER_STOPS: (f64, f64) = (-2.0, 1.0);

/// Per-request AE inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeInput {
    pub mode: AeMode,
    pub locked: bool,
    pub precapture: bool,
    pub face_priority: bool,
}

#[derive(Debug, Clone)]
pub struct AutoExposure {
    state: AeState,
    counter: u32,
    target_ns: i64,
    current_ns: i64,
    sensitivity: i32,
    stable_max_frames: u32,
}

impl AutoExposure {
    /// `stable_max_frames` is the mean number of stable requests between
    /// two spontaneous searches
    pub fn new(stable_max_frames: u32) -> Self {
        Self {
            state: AeState::Inactive,
            counter: 0,
            target_ns: NORMAL_EXPOSURE_NS,
            current_ns: NORMAL_EXPOSURE_NS,
            sensitivity: DEFAULT_SENSITIVITY as i32,
            stable_max_frames: stable_max_frames.max(1),
        }
    }

    pub fn state(&self) -> AeState {
        self.state
    }

    pub fn current_exposure_ns(&self) -> i64 {
        self.current_ns
    }

    pub fn target_exposure_ns(&self) -> i64 {
        self.target_ns
    }

    pub fn sensitivity(&self) -> i32 {
        self.sensitivity
    }

    /// Drop to `Inactive`, as when 3A is switched off
    pub fn reset(&mut self) {
        self.state = AeState::Inactive;
        self.counter = 0;
    }

    /// Advance one request and return the new state
    pub fn step<R: Rng>(&mut self, input: AeInput, rng: &mut R) -> AeState {
        if input.mode == AeMode::Off {
            self.state = AeState::Inactive;
            return self.state;
        }

        let nominal = if input.face_priority {
            FACE_PRIORITY_EXPOSURE_NS
        } else {
            NORMAL_EXPOSURE_NS
        };

        if input.precapture || self.state == AeState::Precapture {
            if self.state != AeState::Precapture {
                self.counter = 0;
            }
            self.target_ns = nominal;

            if self.counter > PRECAPTURE_MIN_FRAMES && self.on_target() {
                self.counter = 0;
                self.state = if input.locked {
                    AeState::Locked
                } else {
                    AeState::Converged
                };
            } else {
                self.track();
                self.counter += 1;
                self.state = AeState::Precapture;
            }
        } else if !input.locked {
            match self.state {
                AeState::Converged | AeState::Inactive => {
                    self.counter += 1;
                    if rng.gen_ratio(1, self.stable_max_frames) {
                        let stops = rng.gen_range(EXPOSURE_WANDER_STOPS.0..EXPOSURE_WANDER_STOPS.1);
                        self.target_ns = (nominal as f64 * 2f64.powf(stops)) as i64;
                        self.state = AeState::Searching;
                    }
                }
                AeState::Searching => {
                    self.track();
                    if self.on_target() {
                        self.state = AeState::Converged;
                        self.counter = 0;
                    }
                }
                AeState::Locked | AeState::FlashRequired | AeState::Precapture => {
                    self.state = AeState::Converged;
                    self.counter = 0;
                }
            }
        } else {
            // A lock settles an idle AE first, so Inactive never jumps to Locked
            self.state = match self.state {
                AeState::Inactive => AeState::Converged,
                _ => AeState::Locked,
            };
        }

        self.state
    }

    fn track(&mut self) {
        let delta = (self.target_ns - self.current_ns) as f64 * EXPOSURE_TRACK_RATE;
        self.current_ns += delta as i64;
    }

    fn on_target(&self) -> bool {
        (self.target_ns - self.current_ns).abs() < self.target_ns / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn input(precapture: bool, locked: bool) -> AeInput {
        AeInput {
            mode: AeMode::On,
            locked,
            precapture,
            face_priority: false,
        }
    }

    #[test]
    fn test_precapture_sequence() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ae = AutoExposure::new(100);
        assert_eq!(ae.state(), AeState::Inactive);

        let mut states = vec![ae.step(input(true, false), &mut rng)];
        while states.len() < 50 && *states.last().unwrap() == AeState::Precapture {
            states.push(ae.step(input(false, false), &mut rng));
        }

        assert_eq!(states[0], AeState::Precapture);
        let last = *states.last().unwrap();
        assert!(matches!(last, AeState::Converged | AeState::Locked));
        assert!(states.len() as u32 > PRECAPTURE_MIN_FRAMES);
        assert!(states[..states.len() - 1].iter().all(|s| *s == AeState::Precapture));
    }

    #[test]
    fn test_precapture_with_lock_ends_locked() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ae = AutoExposure::new(100);
        let mut state = ae.step(input(true, true), &mut rng);
        for _ in 0..50 {
            if state != AeState::Precapture {
                break;
            }
            state = ae.step(input(false, true), &mut rng);
        }
        assert_eq!(state, AeState::Locked);
    }

    #[test]
    fn test_face_priority_ramps_exposure() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ae = AutoExposure::new(100);
        let face = AeInput {
            face_priority: true,
            ..input(true, false)
        };
        let mut state = ae.step(face, &mut rng);
        for _ in 0..100 {
            if state != AeState::Precapture {
                break;
            }
            state = ae.step(AeInput { precapture: false, ..face }, &mut rng);
        }
        assert_eq!(state, AeState::Converged);
        assert!(ae.current_exposure_ns() > 27_000_000);
    }

    #[test]
    fn test_lock_never_jumps_from_inactive() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut ae = AutoExposure::new(100);
        assert_eq!(ae.step(input(false, true), &mut rng), AeState::Converged);
        assert_eq!(ae.step(input(false, true), &mut rng), AeState::Locked);
        assert_eq!(ae.step(input(false, false), &mut rng), AeState::Converged);
    }

    #[test]
    fn test_wander_searches_and_converges() {
        let mut rng = StdRng::seed_from_u64(9);
        // A wander chance of one forces a search on the first idle request
        let mut ae = AutoExposure::new(1);
        assert_eq!(ae.step(input(false, false), &mut rng), AeState::Searching);

        let mut state = AeState::Searching;
        for _ in 0..200 {
            state = ae.step(input(false, false), &mut rng);
            if state != AeState::Searching {
                break;
            }
        }
        assert_eq!(state, AeState::Converged);
        let target = ae.target_exposure_ns();
        assert!(target >= NORMAL_EXPOSURE_NS / 4 && target <= NORMAL_EXPOSURE_NS * 2);
    }

    #[test]
    fn test_off_is_inactive() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut ae = AutoExposure::new(100);
        let off = AeInput {
            mode: AeMode::Off,
            ..input(true, false)
        };
        assert_eq!(ae.step(off, &mut rng), AeState::Inactive);
        assert_eq!(ae.current_exposure_ns(), NORMAL_EXPOSURE_NS);
    }
}

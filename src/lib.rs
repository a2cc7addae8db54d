//! fake-camera - Simulated camera sensor and capture pipeline
//!
//! This crate renders a procedural scene through a model of an image
//! sensor, runs a simplified 3A loop over capture requests and returns
//! finished buffers, including JPEG output, in the order a real camera
//! device would.

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod jpeg;
pub mod metadata;
pub mod pipeline;
pub mod sensor;
pub mod utils;

pub use config::CameraConfig;
pub use error::{CameraError, Result};
pub use pipeline::FakeCamera;

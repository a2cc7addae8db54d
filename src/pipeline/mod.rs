//! Capture request pipeline
//!
//! Request admission, stream configuration, the bounded in-flight queue
//! and the worker threads that turn sensor frames into capture results.

pub mod camera;
mod configure;
pub mod inflight;
mod readout;
pub mod request;
pub mod sequencer;
pub mod stream;

pub use camera::FakeCamera;
pub use inflight::{InFlightQueue, InFlightRequest};
pub use request::{CameraMessage, CaptureRequest, CaptureResult, ErrorCode, MessageSink, Notify, RequestRejected};
pub use sequencer::{Sequencer, StagedRequest};
pub use stream::{StreamConfig, StreamDirection, StreamRegistry};

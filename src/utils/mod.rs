//! Shared primitives for the capture pipeline
//!
//! Log throttling for repeating render warnings, timed waits on tokio
//! primitives from worker threads, and the bounded queue used for the
//! cross-thread handoffs.

pub mod blocking;
pub mod queue;
pub mod throttle;

pub use blocking::block_on_timeout;
pub use queue::BoundedQueue;
pub use throttle::LogThrottler;

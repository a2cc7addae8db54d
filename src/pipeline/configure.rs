//! Configure worker of the staged sequencer
//!
//! Takes staged requests in order, waits for in-flight room and the
//! sensor vsync, then dispatches them. Failures here happen after the
//! caller's submission returned, so they are reported through the message
//! channel with the request's buffers marked as errors.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::request::ErrorCode;
use super::sequencer::{Core, StagedRequest};

pub(crate) fn configure_loop(core: Arc<Core>) {
    debug!("Configure worker started");
    while !core.stopping() {
        let Some(staged) = core.staged.pop_timeout(core.pipeline.sync_wait()) else {
            continue;
        };
        configure_one(&core, staged);
        core.pending_configure.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Configure worker stopped");
}

fn configure_one(core: &Core, staged: StagedRequest) {
    let deadline = Instant::now() + core.pipeline.admission_timeout();
    while !core.in_flight.wait_for_room(core.pipeline.sync_wait()) {
        if core.stopping() {
            core.fail_staged(staged, ErrorCode::Device, "pipeline closed");
            return;
        }
        if Instant::now() >= deadline {
            core.fail_staged(staged, ErrorCode::Request, "no room in the in-flight queue");
            return;
        }
    }

    if !core.sync_to_vsync() {
        let code = if core.stopping() {
            ErrorCode::Device
        } else {
            ErrorCode::Request
        };
        core.fail_staged(staged, code, "sensor vsync timed out");
        return;
    }
    core.dispatch(staged);
}

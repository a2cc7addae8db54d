//! Request sequencer
//!
//! Owns the worker threads between request admission and result delivery.
//! In the direct shape the submitting thread waits for queue room and the
//! sensor vsync itself; in the staged shape a configure thread does that
//! waiting so submission returns as soon as the request is staged. Both
//! feed the same in-flight queue and readout thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::configure;
use super::inflight::{InFlightQueue, InFlightRequest};
use super::readout;
use super::request::{CaptureResult, ErrorCode, MessageSink, Notify};
use crate::config::{PipelineConfig, SequencerShape};
use crate::error::{CameraError, Result};
use crate::events::{CameraEvent, EventBus};
use crate::jpeg::JpegCompressor;
use crate::sensor::{
    BufferStatus, CapturedFrame, LockedBuffer, Sensor, SensorControls, SensorEvent, SensorListener, StreamBuffer,
};
use crate::utils::{BoundedQueue, LogThrottler};

/// Requests the staged shape holds between submission and its configure thread
const STAGED_CAPACITY: usize = 1;

/// A request that passed admission, with its sensor controls and locked
/// destination buffers
pub struct StagedRequest {
    pub request: InFlightRequest,
    pub controls: SensorControls,
    pub buffers: Vec<LockedBuffer>,
}

/// A staged request refused by the sequencer, handed back whole
pub type StageRejected = (StagedRequest, CameraError);

/// State shared by the sequencer threads
pub(crate) struct Core {
    pub sensor: Arc<Sensor>,
    pub compressor: Arc<JpegCompressor>,
    pub in_flight: InFlightQueue,
    pub staged: BoundedQueue<StagedRequest>,
    /// Staged requests not yet in the in-flight queue
    pub pending_configure: AtomicUsize,
    pub sink: MessageSink,
    pub events: EventBus,
    pub pipeline: PipelineConfig,
    /// Whether results carry the backward-compatible metadata set
    pub backward_compatible: bool,
    pub throttler: LogThrottler,
    stop_flag: AtomicBool,
}

impl Core {
    pub(crate) fn new(
        sensor: Arc<Sensor>,
        compressor: Arc<JpegCompressor>,
        sink: MessageSink,
        events: EventBus,
        pipeline: PipelineConfig,
        backward_compatible: bool,
    ) -> Self {
        Self {
            sensor,
            compressor,
            in_flight: InFlightQueue::new(pipeline.max_in_flight),
            staged: BoundedQueue::new(STAGED_CAPACITY),
            pending_configure: AtomicUsize::new(0),
            sink,
            events,
            pipeline,
            backward_compatible,
            throttler: LogThrottler::default(),
            stop_flag: AtomicBool::new(false),
        }
    }

    /// The sequencer is stopping, or the sensor is no longer running
    pub fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst) || !self.sensor.is_running()
    }

    /// Wait for the next sensor vsync, retrying in short steps.
    /// Returns `false` once the retry budget is spent or on shutdown.
    pub fn sync_to_vsync(&self) -> bool {
        for _ in 0..=self.pipeline.max_sync_retries {
            if self.stopping() {
                return false;
            }
            if self.sensor.wait_for_vsync(self.pipeline.sync_wait()) {
                return true;
            }
        }
        false
    }

    /// Hand a request to the sensor and queue it for readout.
    ///
    /// The caller must have waited for queue room and the vsync.
    pub fn dispatch(&self, staged: StagedRequest) {
        let StagedRequest {
            request,
            controls,
            buffers,
        } = staged;
        debug!(
            "Frame {}: exposure {} ns, frame {} ns, gain {}",
            request.frame_number, controls.exposure_ns, controls.frame_duration_ns, controls.sensitivity
        );
        self.sensor.configure(controls, buffers);
        if let Err(request) = self.in_flight.push(request, Duration::ZERO) {
            // Only on shutdown; the buffers are reclaimed from the sensor
            warn!("Frame {}: in-flight queue closed", request.frame_number);
            self.fail_request(request, ErrorCode::Device, "pipeline closed");
        }
    }

    /// Report a request that will never produce a result with metadata.
    ///
    /// Output buffers the stopped sensor still holds for the frame come back
    /// with status Error, together with any input buffer.
    pub fn fail_request(&self, request: InFlightRequest, code: ErrorCode, reason: &str) {
        self.sink.request_error(request.frame_number, code);
        let output_buffers = self
            .sensor
            .reclaim(request.frame_number)
            .map(|frame| unlock_failed(frame.buffers))
            .unwrap_or_default();
        if !output_buffers.is_empty() || request.input_buffer.is_some() {
            self.sink.result(CaptureResult {
                frame_number: request.frame_number,
                settings: None,
                output_buffers,
                input_buffer: request.input_buffer,
            });
        }
        self.publish_error(request.frame_number, code, reason);
    }

    /// Return the buffers of a frame whose request already failed
    pub fn return_stale(&self, frame: CapturedFrame) {
        let output_buffers = unlock_failed(frame.buffers);
        if output_buffers.is_empty() {
            return;
        }
        warn!(
            "Returning {} buffer(s) of failed frame {}",
            output_buffers.len(),
            frame.frame_number
        );
        self.sink.result(CaptureResult {
            frame_number: frame.frame_number,
            settings: None,
            output_buffers,
            input_buffer: None,
        });
    }

    /// Fail a staged request, returning its buffers with error status
    pub fn fail_staged(&self, staged: StagedRequest, code: ErrorCode, reason: &str) {
        let StagedRequest { request, buffers, .. } = staged;
        self.sink.request_error(request.frame_number, code);
        self.sink.result(CaptureResult {
            frame_number: request.frame_number,
            settings: None,
            output_buffers: buffers.into_iter().map(|b| b.unlock(BufferStatus::Error)).collect(),
            input_buffer: request.input_buffer,
        });
        self.publish_error(request.frame_number, code, reason);
    }

    fn publish_error(&self, frame_number: u32, code: ErrorCode, reason: &str) {
        warn!("Frame {} failed ({:?}): {}", frame_number, code, reason);
        let code = match code {
            ErrorCode::Request => "request",
            ErrorCode::Buffer => "buffer",
            ErrorCode::Device => "device",
        };
        self.events.publish(CameraEvent::Error {
            frame_number: Some(frame_number),
            code: code.to_string(),
            message: reason.to_string(),
        });
    }
}

/// Unlock a failed frame's buffers with error status, leaving out the
/// compression scratch
fn unlock_failed(buffers: Vec<LockedBuffer>) -> Vec<StreamBuffer> {
    buffers
        .into_iter()
        .filter(|b| b.stream_id() > 0)
        .map(|b| b.unlock(BufferStatus::Error))
        .collect()
}

/// Turns sensor exposure starts into shutter notifications
pub(crate) struct ShutterNotifier {
    pub sink: MessageSink,
}

impl SensorListener for ShutterNotifier {
    fn on_sensor_event(&self, frame_number: u32, event: SensorEvent, timestamp_ns: i64) {
        match event {
            SensorEvent::ExposureStart => self.sink.notify(Notify::ShutterOpened {
                frame_number,
                timestamp_ns,
            }),
        }
    }
}

pub struct Sequencer {
    core: Arc<Core>,
    shape: SequencerShape,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Sequencer {
    pub(crate) fn new(
        sensor: Arc<Sensor>,
        compressor: Arc<JpegCompressor>,
        sink: MessageSink,
        events: EventBus,
        pipeline: PipelineConfig,
        backward_compatible: bool,
    ) -> Self {
        let shape = pipeline.shape;
        Self {
            core: Arc::new(Core::new(sensor, compressor, sink, events, pipeline, backward_compatible)),
            shape,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn shape(&self) -> SequencerShape {
        self.shape
    }

    /// Start the worker threads. Starting a running sequencer is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }

        info!("Starting {:?} request sequencer", self.shape);
        self.core.stop_flag.store(false, Ordering::SeqCst);
        self.core.in_flight.reopen();
        self.core.staged.reopen();

        let core = self.core.clone();
        threads.push(spawn("camera-readout", move || readout::readout_loop(core))?);

        if self.shape == SequencerShape::Staged {
            let core = self.core.clone();
            match spawn("camera-configure", move || configure::configure_loop(core)) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    drop(threads);
                    self.stop();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stop the worker threads and fail every request still pending.
    ///
    /// Stop the sensor first so frames it still holds are returned here.
    pub fn stop(&self) {
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        self.core.stop_flag.store(true, Ordering::SeqCst);
        self.core.in_flight.close();
        self.core.staged.close();
        if !threads.is_empty() {
            info!("Stopping request sequencer");
        }
        for thread in threads {
            let _ = thread.join();
        }

        for staged in self.core.staged.drain() {
            self.core.pending_configure.fetch_sub(1, Ordering::SeqCst);
            self.core.fail_staged(staged, ErrorCode::Device, "pipeline closed");
        }
        for request in self.core.in_flight.drain() {
            self.core.fail_request(request, ErrorCode::Device, "pipeline closed");
        }
        if !self.core.sensor.is_running() {
            for frame in self.core.sensor.take_unread() {
                self.core.return_stale(frame);
            }
        }
    }

    /// Queue a request for capture.
    ///
    /// Direct: blocks until the in-flight queue has room and the sensor is
    /// at a vsync, then configures the sensor. Staged: blocks only until the
    /// configure thread can take the request. A refused request is handed
    /// back with its buffers still locked.
    pub fn submit(&self, staged: StagedRequest) -> std::result::Result<(), StageRejected> {
        let core = &self.core;
        if core.stopping() {
            return Err((staged, CameraError::InvalidState("sequencer stopped".into())));
        }

        match self.shape {
            SequencerShape::Direct => {
                if !core.in_flight.wait_for_room(core.pipeline.admission_timeout()) {
                    return Err((
                        staged,
                        CameraError::Timeout(format!(
                            "room in the in-flight queue (capacity {})",
                            core.in_flight.capacity()
                        )),
                    ));
                }
                if !core.sync_to_vsync() {
                    core.events.publish(CameraEvent::Error {
                        frame_number: Some(staged.request.frame_number),
                        code: "timeout".into(),
                        message: "sensor vsync".into(),
                    });
                    return Err((staged, CameraError::Timeout("sensor vsync".into())));
                }
                core.dispatch(staged);
                Ok(())
            }
            SequencerShape::Staged => {
                core.pending_configure.fetch_add(1, Ordering::SeqCst);
                match core.staged.push_timeout(staged, core.pipeline.admission_timeout()) {
                    Ok(()) => Ok(()),
                    Err(staged) => {
                        core.pending_configure.fetch_sub(1, Ordering::SeqCst);
                        Err((
                            staged,
                            CameraError::QueueFull {
                                capacity: STAGED_CAPACITY,
                            },
                        ))
                    }
                }
            }
        }
    }

    /// Wait until the in-flight queue has room below capacity
    pub fn wait_for_readout(&self, timeout: Duration) -> bool {
        self.core.in_flight.wait_for_room(timeout)
    }

    /// Requests staged, queued or mid-readout
    pub fn pending(&self) -> usize {
        self.core.pending_configure.load(Ordering::SeqCst) + self.core.in_flight.len()
    }

    /// True only when nothing is staged, queued or being read out
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until [`Sequencer::is_idle`]. Returns `false` on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // The staged count has no condition of its own; re-check each step
            let step = (deadline - now).min(self.core.pipeline.sync_wait());
            if self.core.in_flight.is_idle() {
                std::thread::sleep(step);
            } else {
                self.core.in_flight.wait_until_idle(step);
            }
        }
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|e| CameraError::Internal(format!("failed to spawn {} thread: {}", name, e)))
}

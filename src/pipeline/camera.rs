//! Camera context
//!
//! [`FakeCamera`] ties one sensor, one JPEG compressor, the 3A simulator
//! and the request sequencer together. The surrounding system creates one
//! per simulated device and drives it through the usual lifecycle: new,
//! configure streams, submit requests, close. Results and notifications
//! come back, in order, on the receiver from [`FakeCamera::take_messages`].

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::inflight::InFlightRequest;
use super::request::{CameraMessage, CaptureRequest, MessageSink, RequestRejected};
use super::sequencer::{Sequencer, ShutterNotifier, StagedRequest};
use super::stream::{StreamConfig, StreamRegistry};
use crate::config::{CameraConfig, Capability, CapabilitySet};
use crate::control::ThreeA;
use crate::error::{CameraError, Result};
use crate::events::{CameraEvent, EventBus, PipelineState};
use crate::jpeg::JpegCompressor;
use crate::metadata::{default_settings, Metadata, RequestTemplate, Tag};
use crate::sensor::{
    BufferStatus, LockedBuffer, Sensor, SensorControls, StreamBuffer, EXPOSURE_TIME_RANGE, FRAME_DURATION_RANGE,
    SENSITIVITY_RANGE,
};

type Locked = std::result::Result<Vec<LockedBuffer>, (Vec<StreamBuffer>, CameraError)>;

/// One simulated camera device
pub struct FakeCamera {
    config: CameraConfig,
    caps: CapabilitySet,
    sensor: Arc<Sensor>,
    compressor: Arc<JpegCompressor>,
    sequencer: Sequencer,
    three_a: ThreeA,
    streams: StreamRegistry,
    prev_settings: Option<Metadata>,
    events: EventBus,
    messages: Option<mpsc::UnboundedReceiver<CameraMessage>>,
    state: PipelineState,
}

impl FakeCamera {
    /// Open a camera and start its sensor and worker threads
    pub fn new(config: CameraConfig) -> Result<Self> {
        Self::with_event_bus(config, EventBus::new())
    }

    /// Open a camera that publishes on an existing event bus
    pub fn with_event_bus(config: CameraConfig, events: EventBus) -> Result<Self> {
        config.validate()?;
        let caps = config.capabilities();
        let (sink, messages) = MessageSink::channel();

        let sensor = Arc::new(Sensor::new(&config.sensor));
        sensor.set_listener(Some(Arc::new(ShutterNotifier { sink: sink.clone() })));
        let compressor = Arc::new(JpegCompressor::new(config.jpeg.max_size));
        let sequencer = Sequencer::new(
            sensor.clone(),
            compressor.clone(),
            sink,
            events.clone(),
            config.pipeline.clone(),
            caps.has(Capability::BackwardCompatible),
        );

        sensor.start()?;
        if let Err(e) = sequencer.start() {
            sensor.stop();
            return Err(e);
        }

        info!(
            "Opened fake camera: {:?}, {} sensor, {} facing",
            config.profile,
            sensor.resolution(),
            if config.facing_back { "back" } else { "front" }
        );
        let camera = Self {
            three_a: ThreeA::new(&config),
            caps,
            sensor,
            compressor,
            sequencer,
            streams: StreamRegistry::new(),
            prev_settings: None,
            events,
            messages: Some(messages),
            state: PipelineState::Open,
            config,
        };
        camera.events.publish(CameraEvent::PipelineStateChanged {
            state: PipelineState::Open,
        });
        Ok(camera)
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn sensor(&self) -> &Sensor {
        &self.sensor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn three_a(&self) -> &ThreeA {
        &self.three_a
    }

    /// Take the result and notification receiver. Only the first call
    /// returns it.
    pub fn take_messages(&mut self) -> Option<mpsc::UnboundedReceiver<CameraMessage>> {
        self.messages.take()
    }

    /// Declare the streams requests may use.
    ///
    /// Must not be called with requests in flight. The first request after
    /// a configuration has to carry settings.
    pub fn configure_streams(&mut self, streams: &[StreamConfig]) -> Result<()> {
        self.ensure_open()?;
        if !self.sequencer.is_idle() {
            return Err(CameraError::InvalidState(format!(
                "{} request(s) still in flight",
                self.sequencer.pending()
            )));
        }
        self.streams.configure(streams, &self.caps, self.sensor.resolution())?;
        self.prev_settings = None;
        self.set_state(PipelineState::Ready);
        Ok(())
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Default settings of a request template
    pub fn default_request_settings(&self, template: RequestTemplate) -> Result<Metadata> {
        default_settings(template, &self.caps, self.sensor.resolution())
    }

    /// Run 3A for a request and hand it to the sequencer.
    ///
    /// Blocks for buffer fences, a busy compressor, in-flight room and (in
    /// the direct shape) the sensor vsync. On any failure the request comes
    /// back untouched apart from 3A state, which has already advanced.
    pub fn process_capture_request(&mut self, request: CaptureRequest) -> std::result::Result<(), RequestRejected> {
        let mut settings = match self.check_request(&request) {
            Ok(settings) => settings,
            Err(e) => return Err(RequestRejected::new(request, e)),
        };
        let frame_number = request.frame_number;

        match self.three_a.process(frame_number, &mut settings) {
            Ok(events) => self.events.publish_all(events),
            Err(e) => return Err(RequestRejected::new(request, e)),
        }
        let controls = sensor_controls(frame_number, &mut settings);
        let jpeg_quality = settings.byte(Tag::JpegQuality).unwrap_or(self.config.jpeg.quality);
        let has_blob = request.has_blob();

        let CaptureRequest {
            frame_number,
            settings: submitted,
            output_buffers,
            input_buffer,
        } = request;
        let reassemble = |output_buffers: Vec<StreamBuffer>, input_buffer: Option<StreamBuffer>, settings| CaptureRequest {
            frame_number,
            settings,
            output_buffers,
            input_buffer,
        };

        let buffers = match lock_all(output_buffers, self.config.pipeline.fence_timeout()) {
            Ok(buffers) => buffers,
            Err((buffers, e)) => {
                return Err(RequestRejected::new(reassemble(buffers, input_buffer, submitted), e));
            }
        };

        if has_blob && !self.compressor.wait_for_done(self.config.pipeline.admission_timeout()) {
            return Err(RequestRejected::new(
                reassemble(unlock_all(buffers), input_buffer, submitted),
                CameraError::Timeout("JPEG compressor".into()),
            ));
        }

        let staged = StagedRequest {
            request: InFlightRequest {
                frame_number,
                settings: settings.clone(),
                input_buffer,
                jpeg_quality,
            },
            controls,
            buffers,
        };
        if let Err((staged, e)) = self.sequencer.submit(staged) {
            let StagedRequest { request, buffers, .. } = staged;
            return Err(RequestRejected::new(
                reassemble(unlock_all(buffers), request.input_buffer, submitted),
                e,
            ));
        }

        debug!("Frame {} submitted", frame_number);
        self.prev_settings = Some(settings);
        self.set_state(PipelineState::Active);
        Ok(())
    }

    /// Wait until every submitted request has its results out, including
    /// compressed buffers. Returns `false` on timeout.
    pub fn wait_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.sequencer.wait_until_idle(timeout) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.compressor.wait_for_done(remaining) {
            return false;
        }
        if self.state == PipelineState::Active {
            self.set_state(PipelineState::Ready);
        }
        true
    }

    /// Stop the sensor, sequencer and compressor. Pending requests are
    /// failed with error notifications and their buffers come back with
    /// status Error. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == PipelineState::Closed {
            return;
        }
        info!("Closing fake camera");
        self.sensor.stop();
        self.sequencer.stop();
        self.compressor.cancel();
        self.set_state(PipelineState::Closed);
    }

    /// Forward sensor phase changes to the event bus until the camera is
    /// dropped. Must be called inside a tokio runtime.
    pub fn forward_sensor_phases(&self) -> JoinHandle<()> {
        let mut phases = self.sensor.phase_watch();
        let events = self.events.clone();
        tokio::spawn(async move {
            while phases.changed().await.is_ok() {
                let phase = *phases.borrow_and_update();
                events.publish(CameraEvent::SensorPhaseChanged { phase });
            }
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == PipelineState::Closed {
            return Err(CameraError::InvalidState("camera is closed".into()));
        }
        Ok(())
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            debug!("Pipeline {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.publish(CameraEvent::PipelineStateChanged { state });
        }
    }

    /// Validate a request and pick the settings it runs with
    fn check_request(&self, request: &CaptureRequest) -> Result<Metadata> {
        self.ensure_open()?;
        let frame_number = request.frame_number;
        if !self.streams.is_configured() {
            return Err(CameraError::InvalidState(format!(
                "frame {}: streams are not configured",
                frame_number
            )));
        }

        let settings = match (&request.settings, &self.prev_settings) {
            (Some(settings), _) | (None, Some(settings)) => settings.clone(),
            (None, None) => {
                return Err(CameraError::invalid(
                    frame_number,
                    "first request after stream configuration carries no settings",
                ))
            }
        };

        if let Some(input) = &request.input_buffer {
            if self.streams.input_stream() != Some(input.stream_id) {
                return Err(CameraError::invalid(
                    frame_number,
                    format!("input buffer of stream {} is not from the input stream", input.stream_id),
                ));
            }
        }
        if request.output_buffers.is_empty() {
            return Err(CameraError::invalid(frame_number, "no output buffers"));
        }

        let buffers = request
            .input_buffer
            .iter()
            .map(|b| (b, true))
            .chain(request.output_buffers.iter().map(|b| (b, false)));
        for (buffer, as_input) in buffers {
            self.streams.check_buffer(frame_number, buffer, as_input)?;
            if buffer.status != BufferStatus::Ok {
                return Err(CameraError::invalid(
                    frame_number,
                    format!("buffer of stream {} has error status", buffer.stream_id),
                ));
            }
        }
        Ok(settings)
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sensor controls of a request. A frame duration too short for the
/// exposure is stretched and written back.
fn sensor_controls(frame_number: u32, settings: &mut Metadata) -> SensorControls {
    let exposure = settings
        .long(Tag::SensorExposureTime)
        .map(|ns| ns.max(0) as u64)
        .unwrap_or(EXPOSURE_TIME_RANGE.0);
    let frame_duration = settings
        .long(Tag::SensorFrameDuration)
        .map(|ns| ns.max(0) as u64)
        .unwrap_or(FRAME_DURATION_RANGE.0);
    let sensitivity = settings
        .int(Tag::SensorSensitivity)
        .map(|iso| iso.max(0) as u32)
        .unwrap_or(SENSITIVITY_RANGE.0);

    let controls = SensorControls::new(exposure, frame_duration, sensitivity, frame_number).clamped();
    if controls.frame_duration_ns != frame_duration && settings.contains(Tag::SensorFrameDuration) {
        settings.set(Tag::SensorFrameDuration, controls.frame_duration_ns as i64);
    }
    controls
}

/// Lock every buffer in order; on failure all of them are handed back
fn lock_all(buffers: Vec<StreamBuffer>, timeout: Duration) -> Locked {
    let mut locked = Vec::with_capacity(buffers.len());
    let mut pending = buffers.into_iter();
    while let Some(buffer) = pending.next() {
        match buffer.lock(timeout) {
            Ok(buffer) => locked.push(buffer),
            Err((failed, e)) => {
                let mut returned = unlock_all(locked);
                returned.push(failed);
                returned.extend(pending);
                return Err((returned, e));
            }
        }
    }
    Ok(locked)
}

fn unlock_all(buffers: Vec<LockedBuffer>) -> Vec<StreamBuffer> {
    buffers.into_iter().map(|b| b.unlock(BufferStatus::Ok)).collect()
}

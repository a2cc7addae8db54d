//! Readout worker
//!
//! Pairs each in-flight request with the frame the sensor rendered for it,
//! returns the finished buffers with the augmented metadata, and hands a
//! compressed-image target to the JPEG compressor. The compressed buffer
//! comes back later in a result of its own, always after the main result.

use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::inflight::InFlightRequest;
use super::request::{CaptureResult, ErrorCode, MessageSink, Notify};
use super::sequencer::Core;
use crate::jpeg::JpegListener;
use crate::metadata::{FlashState, Metadata, SceneFlicker, Tag};
use crate::sensor::{BufferStatus, CapturedFrame, LockedBuffer, PixelFormat, StreamBuffer};
use crate::warn_throttled;

/// Stages a request passes through, counting compression
const MAX_PIPELINE_DEPTH: u8 = 4;
/// Nearest in-focus distance reported in results, in diopters
const FOCUS_RANGE_NEAR: f32 = 1.0 / 5.0;

pub(crate) fn readout_loop(core: Arc<Core>) {
    debug!("Readout worker started");
    while !core.stopping() {
        let Some(request) = core.in_flight.begin_readout(core.pipeline.readout_wait()) else {
            continue;
        };

        trace!("Beginning readout of frame {}", request.frame_number);
        match wait_for_frame(&core, request.frame_number) {
            Some(frame) => deliver(&core, request, frame),
            None => {
                let code = if core.stopping() {
                    ErrorCode::Device
                } else {
                    ErrorCode::Request
                };
                core.fail_request(request, code, "sensor frame never arrived");
            }
        }
        core.in_flight.finish();
    }
    debug!("Readout worker stopped");
}

/// Wait for the sensor frame of `frame_number`. Stale frames of requests
/// that already failed have their buffers returned.
fn wait_for_frame(core: &Core, frame_number: u32) -> Option<CapturedFrame> {
    for _ in 0..core.pipeline.max_readout_retries.max(1) {
        if core.stopping() {
            return None;
        }
        let Some(frame) = core.sensor.wait_for_new_frame(core.pipeline.readout_wait()) else {
            continue;
        };
        if frame.frame_number == frame_number {
            return Some(frame);
        }
        warn!(
            "Skipping sensor frame {} while waiting for frame {}",
            frame.frame_number, frame_number
        );
        core.return_stale(frame);
    }
    None
}

fn deliver(core: &Core, request: InFlightRequest, frame: CapturedFrame) {
    let CapturedFrame {
        frame_number,
        capture_time_ns,
        buffers,
        failed_streams,
    } = frame;

    let mut ready = Vec::with_capacity(buffers.len());
    let mut blob = None;
    let mut compress_input = None;

    for buffer in buffers {
        if buffer.stream_id() == 0 {
            compress_input = Some(buffer);
        } else if buffer.format() == PixelFormat::Blob {
            blob = Some(buffer);
        } else {
            ready.push(finish_buffer(&core.sink, frame_number, buffer, &failed_streams));
        }
    }

    let jpeg_job = match (blob, compress_input) {
        (Some(blob), Some(input)) if !failed_streams.contains(&blob.stream_id()) => Some(vec![blob, input]),
        (Some(blob), _) => {
            warn_throttled!(
                core.throttler,
                "jpeg_input",
                "Frame {}: no compression input for stream {}",
                frame_number,
                blob.stream_id()
            );
            ready.push(error_buffer(&core.sink, frame_number, blob));
            None
        }
        (None, _) => None,
    };

    let mut settings = request.settings;
    augment(core, &mut settings, capture_time_ns, jpeg_job.is_some());
    core.sink.result(CaptureResult {
        frame_number,
        settings: Some(settings),
        output_buffers: ready,
        input_buffer: request.input_buffer,
    });

    let Some(job) = jpeg_job else {
        return;
    };
    // The previous frame's JPEG may still be encoding
    let timeout = core.pipeline.admission_timeout();
    if !core.compressor.wait_for_done(timeout) {
        error!("Frame {}: compressor still busy after {:?}", frame_number, timeout);
        fail_jpeg(&core.sink, frame_number, job);
        return;
    }
    let listener = Arc::new(JpegResultSender {
        sink: core.sink.clone(),
    });
    if let Err((buffers, e)) = core
        .compressor
        .start(frame_number, job, request.jpeg_quality, listener)
    {
        error!("Frame {}: failed to start compression: {}", frame_number, e);
        fail_jpeg(&core.sink, frame_number, buffers);
    }
}

/// Return the BLOB buffer of a compression that never ran
fn fail_jpeg(sink: &MessageSink, frame_number: u32, buffers: Vec<LockedBuffer>) {
    for buffer in buffers.into_iter().filter(|b| b.stream_id() > 0) {
        let buffer = error_buffer(sink, frame_number, buffer);
        sink.result(late_result(frame_number, buffer));
    }
}

/// Finish a rendered buffer, flagging it if its render failed
fn finish_buffer(sink: &MessageSink, frame_number: u32, buffer: LockedBuffer, failed: &[i32]) -> StreamBuffer {
    if failed.contains(&buffer.stream_id()) {
        error_buffer(sink, frame_number, buffer)
    } else {
        buffer.unlock(BufferStatus::Ok)
    }
}

fn error_buffer(sink: &MessageSink, frame_number: u32, buffer: LockedBuffer) -> StreamBuffer {
    sink.notify(Notify::Error {
        frame_number,
        code: ErrorCode::Buffer,
        stream_id: Some(buffer.stream_id()),
    });
    buffer.unlock(BufferStatus::Error)
}

fn late_result(frame_number: u32, buffer: StreamBuffer) -> CaptureResult {
    CaptureResult {
        frame_number,
        settings: None,
        output_buffers: vec![buffer],
        input_buffer: None,
    }
}

/// Add the per-frame fields the sensor side knows about
fn augment(core: &Core, settings: &mut Metadata, capture_time_ns: i64, jpeg_pending: bool) {
    if core.backward_compatible {
        settings.set_enum(Tag::StatisticsSceneFlicker, SceneFlicker::None);
        settings.set_enum(Tag::FlashState, FlashState::Unavailable);
        let rows = core.sensor.resolution().height.saturating_sub(1) as u64;
        settings.set(
            Tag::SensorRollingShutterSkew,
            (core.sensor.row_readout_ns() * rows) as i64,
        );
        settings.set(Tag::LensFocusRange, vec![FOCUS_RANGE_NEAR, 0.0]);
    }
    settings.set(Tag::SensorTimestamp, capture_time_ns);

    let depth = if jpeg_pending {
        MAX_PIPELINE_DEPTH
    } else {
        MAX_PIPELINE_DEPTH - 1
    };
    settings.set(Tag::RequestPipelineDepth, depth);
}

/// Sends a finished compressed buffer as its own result
struct JpegResultSender {
    sink: MessageSink,
}

impl JpegListener for JpegResultSender {
    fn on_jpeg_done(&self, frame_number: u32, buffer: StreamBuffer, success: bool) {
        if !success {
            self.sink.notify(Notify::Error {
                frame_number,
                code: ErrorCode::Buffer,
                stream_id: Some(buffer.stream_id),
            });
        }
        self.sink.result(late_result(frame_number, buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, SensorConfig};
    use crate::events::EventBus;
    use crate::jpeg::JpegCompressor;
    use crate::pipeline::CameraMessage;
    use crate::sensor::Sensor;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_failed_render_is_flagged() {
        let (sink, mut rx) = MessageSink::channel();
        let locked = StreamBuffer::new(3, PixelFormat::Yv12, 8, 8)
            .lock(Duration::ZERO)
            .unwrap();

        let buffer = finish_buffer(&sink, 9, locked, &[3]);
        assert_eq!(buffer.status, BufferStatus::Error);
        match rx.try_recv() {
            Ok(CameraMessage::Notify(Notify::Error {
                frame_number,
                code,
                stream_id,
            })) => {
                assert_eq!(frame_number, 9);
                assert_eq!(code, ErrorCode::Buffer);
                assert_eq!(stream_id, Some(3));
            }
            other => panic!("expected a buffer error, got {:?}", other),
        }

        let ok = StreamBuffer::new(4, PixelFormat::Rgb888, 8, 8)
            .lock(Duration::ZERO)
            .unwrap();
        assert_eq!(finish_buffer(&sink, 9, ok, &[3]).status, BufferStatus::Ok);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_jpeg_listener_sends_partial_result() {
        let (sink, mut rx) = MessageSink::channel();
        let listener = JpegResultSender { sink };
        let mut blob = StreamBuffer::new(2, PixelFormat::Blob, 8, 8);
        blob.status = BufferStatus::Error;
        listener.on_jpeg_done(5, blob, false);

        assert!(matches!(
            rx.try_recv(),
            Ok(CameraMessage::Notify(Notify::Error {
                code: ErrorCode::Buffer,
                ..
            }))
        ));
        match rx.try_recv() {
            Ok(CameraMessage::Result(result)) => {
                assert!(result.is_partial());
                assert_eq!(result.frame_number, 5);
                assert_eq!(result.buffer(2).map(|b| b.status), Some(BufferStatus::Error));
            }
            other => panic!("expected a late result, got {:?}", other),
        }
    }

    struct GatedListener {
        gate: Arc<Barrier>,
    }

    impl JpegListener for GatedListener {
        fn on_jpeg_done(&self, _frame_number: u32, _buffer: StreamBuffer, _success: bool) {
            self.gate.wait();
        }
    }

    fn test_core() -> (Core, tokio::sync::mpsc::UnboundedReceiver<CameraMessage>) {
        let (sink, rx) = MessageSink::channel();
        let sensor = Sensor::new(&SensorConfig {
            width: 64,
            height: 48,
            hour: 12,
            noise_seed: Some(1),
        });
        let core = Core::new(
            Arc::new(sensor),
            Arc::new(JpegCompressor::default()),
            sink,
            EventBus::new(),
            PipelineConfig::default(),
            true,
        );
        (core, rx)
    }

    fn jpeg_buffers() -> Vec<LockedBuffer> {
        let blob = StreamBuffer::new(2, PixelFormat::Blob, 64, 48)
            .lock(Duration::ZERO)
            .unwrap();
        vec![blob, LockedBuffer::scratch_rgb(64, 48)]
    }

    #[test]
    fn test_busy_compressor_delays_jpeg() {
        let (core, mut rx) = test_core();
        let gate = Arc::new(Barrier::new(2));
        core.compressor
            .start(1, jpeg_buffers(), 80, Arc::new(GatedListener { gate: gate.clone() }))
            .unwrap();

        // Frame 1's listener holds the compressor until the gate opens
        let opener = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.wait();
            })
        };
        let request = InFlightRequest {
            frame_number: 2,
            settings: Metadata::new(),
            input_buffer: None,
            jpeg_quality: 80,
        };
        let frame = CapturedFrame {
            frame_number: 2,
            capture_time_ns: 1_000,
            buffers: jpeg_buffers(),
            failed_streams: Vec::new(),
        };
        deliver(&core, request, frame);
        opener.join().unwrap();
        assert!(core.compressor.wait_for_done(Duration::from_secs(5)));

        let messages: Vec<CameraMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(messages.len(), 2, "unexpected messages {:?}", messages);
        match &messages[0] {
            CameraMessage::Result(main) => {
                assert!(!main.is_partial());
                assert!(main.output_buffers.is_empty());
                assert_eq!(
                    main.settings.as_ref().and_then(|m| m.byte(Tag::RequestPipelineDepth)),
                    Some(MAX_PIPELINE_DEPTH)
                );
            }
            other => panic!("expected the main result, got {:?}", other),
        }
        match &messages[1] {
            CameraMessage::Result(late) => {
                assert!(late.is_partial());
                assert_eq!(late.frame_number, 2);
                let jpeg = late.buffer(2).expect("compressed buffer");
                assert_eq!(jpeg.status, BufferStatus::Ok);
                assert_eq!(&jpeg.data()[..2], &[0xFF, 0xD8]);
            }
            other => panic!("expected the late JPEG result, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_frame_buffers_come_back() {
        let (core, mut rx) = test_core();
        let raw = StreamBuffer::new(1, PixelFormat::Raw16, 64, 48)
            .lock(Duration::ZERO)
            .unwrap();
        let mut buffers = jpeg_buffers();
        buffers.insert(0, raw);
        core.return_stale(CapturedFrame {
            frame_number: 4,
            capture_time_ns: 0,
            buffers,
            failed_streams: Vec::new(),
        });

        match rx.try_recv() {
            Ok(CameraMessage::Result(result)) => {
                assert_eq!(result.frame_number, 4);
                assert!(result.is_partial());
                // The compression scratch is never handed out
                let ids: Vec<i32> = result.output_buffers.iter().map(|b| b.stream_id).collect();
                assert_eq!(ids, vec![1, 2]);
                assert!(result.output_buffers.iter().all(|b| b.status == BufferStatus::Error));
            }
            other => panic!("expected returned buffers, got {:?}", other),
        }
    }
}

//! Free-running sensor capture engine
//!
//! The sensor runs one cycle per frame duration on its own thread. Each
//! cycle it snapshots the latched controls (the vsync point), hands the
//! frame rendered in the previous cycle to the readout side, then exposes
//! and renders into whatever buffers were latched for this cycle. A frame
//! therefore becomes readable one cycle after its controls were set.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::buffer::LockedBuffer;
use super::encode;
use super::format::{PixelFormat, Resolution};
use super::scene::Scene;
use super::{SensorControls, ELECTRONS_PER_LUX_SECOND, FRAME_DURATION_RANGE, MIN_VERTICAL_BLANK};
use crate::config::SensorConfig;
use crate::error::{CameraError, Result};
use crate::utils::{block_on_timeout, BoundedQueue, LogThrottler};
use crate::warn_throttled;

/// Work finishing closer than this to the frame end is not paced
const FRAME_TIMING_ACCURACY: Duration = Duration::from_millis(2);
/// Poll interval while the readout side has not taken the last frame
const HANDOFF_POLL: Duration = Duration::from_millis(10);

/// Sensor-side events delivered to a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorEvent {
    /// Exposure of a frame began; carries the frame's capture timestamp
    ExposureStart,
}

/// Receives sensor events. Called on the sensor thread with no sensor
/// locks held.
pub trait SensorListener: Send + Sync {
    fn on_sensor_event(&self, frame_number: u32, event: SensorEvent, timestamp_ns: i64);
}

/// Coarse phase of the capture cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorPhase {
    /// Thread not running
    Stopped,
    /// Latching controls for the next cycle
    Configuring,
    /// Handing the previous frame to the readout side
    ReadingOut,
    /// Exposing and rendering the current frame
    Capturing,
    /// Waiting for the frame duration to elapse
    Idle,
}

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorStats {
    /// Cycles that rendered at least one buffer
    pub frames_captured: u64,
    /// Frames taken by the readout side
    pub frames_delivered: u64,
    /// Cycles whose work ran past the frame duration
    pub overruns: u64,
    /// Handoff polls spent waiting for the readout side
    pub handoff_waits: u64,
}

/// A rendered frame waiting to be read out
pub struct CapturedFrame {
    pub frame_number: u32,
    /// Nanoseconds since the sensor was created
    pub capture_time_ns: i64,
    /// Destination buffers in submission order, followed by the RGB
    /// compression input when a BLOB buffer was present
    pub buffers: Vec<LockedBuffer>,
    /// Streams whose render failed; their buffers carry no valid pixels
    pub failed_streams: Vec<i32>,
}

impl CapturedFrame {
    pub fn has_failed(&self, stream_id: i32) -> bool {
        self.failed_streams.contains(&stream_id)
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("frame_number", &self.frame_number)
            .field("capture_time_ns", &self.capture_time_ns)
            .field("buffers", &self.buffers.len())
            .field("failed_streams", &self.failed_streams)
            .finish()
    }
}

/// Controls latched for the next cycle
struct ControlState {
    controls: SensorControls,
    next_buffers: Option<Vec<LockedBuffer>>,
    listener: Option<Arc<dyn SensorListener>>,
}

/// Scene and noise source, only touched by the capture thread and tests
struct RenderState {
    scene: Scene,
    noise: StdRng,
}

struct Shared {
    control: Mutex<ControlState>,
    /// Vsync counter, bumped once per cycle after the controls are latched
    vsync: watch::Sender<u64>,
    render: Mutex<RenderState>,
    captured: BoundedQueue<CapturedFrame>,
    /// Frames rendered or latched but never read out before a stop
    unread: Mutex<Vec<CapturedFrame>>,
    stop_flag: AtomicBool,
    phase: watch::Sender<SensorPhase>,
    stats: Mutex<SensorStats>,
    throttler: LogThrottler,
    epoch: Instant,
    row_readout_ns: u64,
}

impl Shared {
    fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    fn set_phase(&self, phase: SensorPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }
}

/// The simulated sensor
pub struct Sensor {
    resolution: Resolution,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sensor {
    pub fn new(config: &SensorConfig) -> Self {
        let resolution = config.resolution();
        let mut scene = Scene::new(resolution.width, resolution.height, ELECTRONS_PER_LUX_SECOND);
        scene.set_hour(config.hour);
        let noise = match config.noise_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (phase, _) = watch::channel(SensorPhase::Stopped);

        Self {
            resolution,
            shared: Arc::new(Shared {
                control: Mutex::new(ControlState {
                    controls: SensorControls::default(),
                    next_buffers: None,
                    listener: None,
                }),
                vsync: watch::Sender::new(0),
                render: Mutex::new(RenderState { scene, noise }),
                captured: BoundedQueue::new(1),
                unread: Mutex::new(Vec::new()),
                stop_flag: AtomicBool::new(false),
                phase,
                stats: Mutex::new(SensorStats::default()),
                throttler: LogThrottler::default(),
                epoch: Instant::now(),
                row_readout_ns: FRAME_DURATION_RANGE.0 / resolution.height.max(1) as u64,
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Time to read out one sensor row
    pub fn row_readout_ns(&self) -> u64 {
        self.shared.row_readout_ns
    }

    /// Nanoseconds since the sensor was created, the timebase of capture timestamps
    pub fn now_ns(&self) -> i64 {
        self.shared.now_ns()
    }

    /// Start the capture thread. Starting a running sensor is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        info!("Starting sensor at {}", self.resolution);
        self.shared.stop_flag.store(false, Ordering::SeqCst);
        self.shared.captured.reopen();

        let shared = self.shared.clone();
        let thread = std::thread::Builder::new()
            .name("sensor-capture".into())
            .spawn(move || capture_loop(shared))
            .map_err(|e| CameraError::Internal(format!("failed to spawn sensor thread: {}", e)))?;
        *handle = Some(thread);
        Ok(())
    }

    /// Stop the capture thread. Stopping a stopped sensor is a no-op.
    ///
    /// Frames not yet read out, and buffers latched for a cycle that never
    /// ran, are kept for [`Sensor::reclaim`] and [`Sensor::take_unread`].
    /// Latched buffers come back as a frame with every stream failed.
    pub fn stop(&self) {
        let Some(thread) = self.handle.lock().take() else {
            return;
        };

        info!("Stopping sensor");
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        self.shared.captured.close();
        self.shared.vsync.send_modify(|_| {});
        let _ = thread.join();

        let unread = self.collect_unread();
        if !unread.is_empty() {
            debug!("Sensor stopped with {} unread frame(s)", unread.len());
        }
        drop(unread);
        self.shared.set_phase(SensorPhase::Stopped);
    }

    /// Gather frames still queued for readout and buffers latched for a
    /// cycle that never ran, once the capture thread is gone
    fn collect_unread(&self) -> parking_lot::MutexGuard<'_, Vec<CapturedFrame>> {
        let mut unread = self.shared.unread.lock();
        if self.is_running() {
            return unread;
        }
        unread.extend(self.shared.captured.drain());
        let latched = {
            let mut state = self.shared.control.lock();
            let frame_number = state.controls.frame_number;
            state.next_buffers.take().map(|buffers| (frame_number, buffers))
        };
        if let Some((frame_number, buffers)) = latched {
            unread.push(CapturedFrame {
                frame_number,
                capture_time_ns: 0,
                failed_streams: buffers.iter().map(|b| b.stream_id()).collect(),
                buffers,
            });
        }
        unread
    }

    /// Take back the unread frame of `frame_number` after a stop
    pub fn reclaim(&self, frame_number: u32) -> Option<CapturedFrame> {
        let mut unread = self.collect_unread();
        let index = unread.iter().position(|frame| frame.frame_number == frame_number)?;
        Some(unread.remove(index))
    }

    /// Take every frame left unread by the last stop
    pub fn take_unread(&self) -> Vec<CapturedFrame> {
        std::mem::take(&mut *self.collect_unread())
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Latch controls and destination buffers for the next cycle.
    ///
    /// Controls are clamped so the frame always covers the exposure plus the
    /// minimum vertical blank.
    pub fn configure(&self, controls: SensorControls, buffers: Vec<LockedBuffer>) {
        let mut state = self.shared.control.lock();
        state.controls = controls.clamped();
        state.next_buffers = Some(buffers);
    }

    pub fn set_exposure_time(&self, ns: u64) {
        let mut state = self.shared.control.lock();
        state.controls = SensorControls { exposure_ns: ns, ..state.controls }.clamped();
    }

    pub fn set_frame_duration(&self, ns: u64) {
        let mut state = self.shared.control.lock();
        state.controls = SensorControls { frame_duration_ns: ns, ..state.controls }.clamped();
    }

    pub fn set_sensitivity(&self, gain: u32) {
        let mut state = self.shared.control.lock();
        state.controls = SensorControls { sensitivity: gain, ..state.controls }.clamped();
    }

    pub fn set_frame_number(&self, frame_number: u32) {
        self.shared.control.lock().controls.frame_number = frame_number;
    }

    pub fn set_destination_buffers(&self, buffers: Vec<LockedBuffer>) {
        self.shared.control.lock().next_buffers = Some(buffers);
    }

    /// Controls that will be latched at the next vsync
    pub fn controls(&self) -> SensorControls {
        self.shared.control.lock().controls
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn SensorListener>>) {
        self.shared.control.lock().listener = listener;
    }

    /// Run `f` against the scene, e.g. to change the hour or color filter
    pub fn with_scene<R>(&self, f: impl FnOnce(&mut Scene) -> R) -> R {
        f(&mut self.shared.render.lock().scene)
    }

    /// Wait for the next vsync. Returns `false` on timeout or when stopped.
    ///
    /// Buffers configured after this returns are latched by the next cycle.
    pub fn wait_for_vsync(&self, timeout: Duration) -> bool {
        let mut vsync = self.shared.vsync.subscribe();
        if self.shared.stopping() {
            return false;
        }
        let ticked = block_on_timeout(timeout, vsync.changed()).is_some_and(|r| r.is_ok());
        ticked && !self.shared.stopping()
    }

    /// Take the frame rendered by the previous cycle, waiting up to `timeout`
    pub fn wait_for_new_frame(&self, timeout: Duration) -> Option<CapturedFrame> {
        let frame = self.shared.captured.pop_timeout(timeout)?;
        self.shared.stats.lock().frames_delivered += 1;
        Some(frame)
    }

    pub fn phase(&self) -> SensorPhase {
        *self.shared.phase.borrow()
    }

    /// Subscribe to phase changes
    pub fn phase_watch(&self) -> watch::Receiver<SensorPhase> {
        self.shared.phase.subscribe()
    }

    pub fn stats(&self) -> SensorStats {
        self.shared.stats.lock().clone()
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(shared: Arc<Shared>) {
    let mut pending: Option<CapturedFrame> = None;

    while !shared.stopping() {
        shared.set_phase(SensorPhase::Configuring);
        let cycle_start = Instant::now();

        let (controls, buffers, listener) = {
            let mut state = shared.control.lock();
            (state.controls, state.next_buffers.take(), state.listener.clone())
        };
        shared.vsync.send_modify(|tick| *tick = tick.wrapping_add(1));
        let frame_end = cycle_start + Duration::from_nanos(controls.frame_duration_ns);

        if let Some(frame) = pending.take() {
            shared.set_phase(SensorPhase::ReadingOut);
            if let Some(frame) = hand_off(&shared, frame) {
                shared.unread.lock().push(frame);
            }
        }

        if let Some(buffers) = buffers {
            shared.set_phase(SensorPhase::Capturing);
            let capture_time = shared.now_ns() + (shared.row_readout_ns + MIN_VERTICAL_BLANK) as i64;
            if let Some(listener) = &listener {
                listener.on_sensor_event(controls.frame_number, SensorEvent::ExposureStart, capture_time);
            }

            trace!("Sensor capturing frame {}", controls.frame_number);
            pending = Some(render_frame(&shared, &controls, buffers, capture_time));
            shared.stats.lock().frames_captured += 1;
        }

        shared.set_phase(SensorPhase::Idle);
        let now = Instant::now();
        if now + FRAME_TIMING_ACCURACY < frame_end {
            std::thread::sleep(frame_end - now);
        } else if now > frame_end {
            shared.stats.lock().overruns += 1;
            warn_throttled!(
                shared.throttler,
                "sensor_overrun",
                "Sensor cycle overran frame duration by {:?}",
                now - frame_end
            );
        }
    }

    if let Some(frame) = pending {
        debug!("Keeping frame {} rendered before stop", frame.frame_number);
        shared.unread.lock().push(frame);
    }
    shared.set_phase(SensorPhase::Stopped);
}

/// Block until the readout side has room for the frame. Hands the frame
/// back if the sensor stops first.
fn hand_off(shared: &Shared, mut frame: CapturedFrame) -> Option<CapturedFrame> {
    loop {
        match shared.captured.push_timeout(frame, HANDOFF_POLL) {
            Ok(()) => return None,
            Err(back) => {
                if shared.stopping() || shared.captured.is_closed() {
                    return Some(back);
                }
                shared.stats.lock().handoff_waits += 1;
                frame = back;
            }
        }
    }
}

fn render_frame(
    shared: &Shared,
    controls: &SensorControls,
    buffers: Vec<LockedBuffer>,
    capture_time: i64,
) -> CapturedFrame {
    let mut guard = shared.render.lock();
    let RenderState { scene, noise } = &mut *guard;
    scene.set_exposure_duration(controls.exposure_ns as f32 / 1e9);
    scene.calculate_scene(capture_time);

    let mut rendered = Vec::with_capacity(buffers.len() + 1);
    let mut failed_streams = Vec::new();
    let mut compress_input = None;

    for mut buffer in buffers {
        let result = if buffer.format() == PixelFormat::Blob {
            // The compressor reads from an RGB copy of the frame
            let mut scratch = LockedBuffer::scratch_rgb(buffer.width(), buffer.height());
            let result = encode::render(&mut scratch, scene, controls.sensitivity, noise);
            compress_input = Some(scratch);
            result
        } else {
            encode::render(&mut buffer, scene, controls.sensitivity, noise)
        };

        if let Err(e) = result {
            warn_throttled!(
                shared.throttler,
                &format!("render_{}", buffer.stream_id()),
                "Frame {}: failed to render stream {}: {}",
                controls.frame_number,
                buffer.stream_id(),
                e
            );
            failed_streams.push(buffer.stream_id());
        }
        rendered.push(buffer);
    }
    rendered.extend(compress_input);

    CapturedFrame {
        frame_number: controls.frame_number,
        capture_time_ns: capture_time,
        buffers: rendered,
        failed_streams,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::buffer::StreamBuffer;
    use std::sync::atomic::AtomicU32;

    fn test_config() -> SensorConfig {
        SensorConfig {
            width: 64,
            height: 48,
            hour: 12,
            noise_seed: Some(1),
        }
    }

    fn locked(stream_id: i32, format: PixelFormat) -> LockedBuffer {
        StreamBuffer::new(stream_id, format, 64, 48)
            .lock(Duration::ZERO)
            .unwrap()
    }

    struct CountingListener {
        exposures: AtomicU32,
    }

    impl SensorListener for CountingListener {
        fn on_sensor_event(&self, _frame_number: u32, event: SensorEvent, _timestamp_ns: i64) {
            assert_eq!(event, SensorEvent::ExposureStart);
            self.exposures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_start_stop_idempotent() {
        let sensor = Sensor::new(&test_config());
        sensor.stop();
        sensor.start().unwrap();
        sensor.start().unwrap();
        assert!(sensor.is_running());
        sensor.stop();
        sensor.stop();
        assert!(!sensor.is_running());
        assert_eq!(sensor.phase(), SensorPhase::Stopped);
    }

    #[test]
    fn test_vsync_ticks() {
        let sensor = Sensor::new(&test_config());
        assert!(!sensor.wait_for_vsync(Duration::from_millis(20)));
        sensor.start().unwrap();
        assert!(sensor.wait_for_vsync(Duration::from_secs(1)));
        assert!(sensor.wait_for_vsync(Duration::from_secs(1)));
        sensor.stop();
    }

    #[test]
    fn test_frame_arrives_one_cycle_later() {
        let sensor = Sensor::new(&test_config());
        let listener = Arc::new(CountingListener {
            exposures: AtomicU32::new(0),
        });
        sensor.set_listener(Some(listener.clone()));
        sensor.start().unwrap();

        assert!(sensor.wait_for_vsync(Duration::from_secs(1)));
        let before = sensor.now_ns();
        sensor.configure(
            SensorControls::new(10_000_000, 33_333_333, 100, 7),
            vec![locked(1, PixelFormat::Rgb888), locked(2, PixelFormat::Blob)],
        );

        let frame = sensor
            .wait_for_new_frame(Duration::from_secs(1))
            .expect("frame");
        sensor.stop();

        assert_eq!(frame.frame_number, 7);
        assert!(frame.capture_time_ns > before);
        assert!(frame.failed_streams.is_empty());
        // RGB, BLOB, then the RGB compression input
        let ids: Vec<i32> = frame.buffers.iter().map(|b| b.stream_id()).collect();
        assert_eq!(ids, vec![1, 2, 0]);
        assert!(frame.buffers[0].pixels().iter().any(|&p| p != 0));
        assert_eq!(listener.exposures.load(Ordering::SeqCst), 1);
        assert!(sensor.stats().frames_captured >= 1);
    }

    #[test]
    fn test_unsupported_format_is_reported() {
        let sensor = Sensor::new(&test_config());
        sensor.start().unwrap();
        sensor.configure(SensorControls::default(), vec![locked(3, PixelFormat::Yv12)]);
        let frame = sensor
            .wait_for_new_frame(Duration::from_secs(1))
            .expect("frame");
        sensor.stop();
        assert!(frame.has_failed(3));
    }

    #[test]
    fn test_stop_keeps_unread_frames() {
        let sensor = Sensor::new(&test_config());
        sensor.configure(
            SensorControls::new(10_000_000, 33_333_333, 100, 7),
            vec![locked(1, PixelFormat::Raw16)],
        );
        sensor.start().unwrap();
        sensor.stop();

        // Either rendered and never read, or latched and never exposed
        let unread = sensor.take_unread();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].frame_number, 7);
        assert_eq!(unread[0].buffers.len(), 1);
        assert!(sensor.take_unread().is_empty());
    }

    #[test]
    fn test_reclaim_by_frame_number() {
        let sensor = Sensor::new(&test_config());
        sensor.start().unwrap();
        assert!(sensor.wait_for_vsync(Duration::from_secs(1)));
        sensor.configure(
            SensorControls::new(10_000_000, 33_333_333, 100, 3),
            vec![locked(1, PixelFormat::Raw16)],
        );
        sensor.stop();

        assert!(sensor.reclaim(2).is_none());
        let frame = sensor.reclaim(3).expect("frame 3");
        assert_eq!(frame.buffers[0].stream_id(), 1);
        assert!(sensor.reclaim(3).is_none());
    }

    #[test]
    fn test_stop_wakes_vsync_waiter() {
        let sensor = Arc::new(Sensor::new(&test_config()));
        sensor.set_frame_duration(FRAME_DURATION_RANGE.1);
        sensor.start().unwrap();
        assert!(sensor.wait_for_vsync(Duration::from_secs(2)));

        let waiter = {
            let sensor = sensor.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                (sensor.wait_for_vsync(Duration::from_secs(30)), started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        sensor.stop();
        let (ticked, waited) = waiter.join().unwrap();
        assert!(!ticked);
        assert!(waited < Duration::from_secs(30));
    }

    #[test]
    fn test_controls_are_clamped() {
        let sensor = Sensor::new(&test_config());
        sensor.set_exposure_time(200_000_000);
        sensor.set_sensitivity(10);
        let controls = sensor.controls();
        assert_eq!(controls.sensitivity, 100);
        assert!(controls.frame_duration_ns >= 200_000_000 + MIN_VERTICAL_BLANK);
    }

    #[test]
    fn test_phase_watch() {
        let sensor = Sensor::new(&test_config());
        let rx = sensor.phase_watch();
        assert_eq!(*rx.borrow(), SensorPhase::Stopped);
        sensor.start().unwrap();
        assert!(sensor.wait_for_vsync(Duration::from_secs(1)));
        assert_ne!(sensor.phase(), SensorPhase::Stopped);
        sensor.stop();
        assert_eq!(*rx.borrow(), SensorPhase::Stopped);
    }
}

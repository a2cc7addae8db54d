//! Single-job JPEG compressor
//!
//! Encodes the RGB compression input of a frame into its BLOB buffer with
//! turbojpeg, either on a worker thread ([`JpegCompressor::start`]) or on
//! the caller's thread ([`JpegCompressor::compress_synchronous`]). Only one
//! job may be active at a time.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{CameraError, Result};
use crate::sensor::{BufferStatus, LockedBuffer, PixelFormat, StreamBuffer};
use crate::utils::block_on_timeout;

/// Buffers handed back when a job is rejected or fails
pub type Rejected = (Vec<LockedBuffer>, CameraError);

/// Receives the outcome of an asynchronous job
pub trait JpegListener: Send + Sync {
    /// Called exactly once per started job, with the BLOB buffer unlocked
    fn on_jpeg_done(&self, frame_number: u32, buffer: StreamBuffer, success: bool);
}

struct ActiveJob {
    frame_number: u32,
    streams: Vec<i32>,
}

struct Inner {
    /// The active job; `None` while idle
    busy: watch::Sender<Option<ActiveJob>>,
    cancel: AtomicBool,
    max_size: usize,
}

impl Inner {
    fn finish(&self) {
        self.busy.send_replace(None);
    }
}

/// Outcome of one compression pass
struct Outcome {
    blob: LockedBuffer,
    result: Result<usize>,
}

/// JPEG compressor worker
pub struct JpegCompressor {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JpegCompressor {
    /// Create a compressor whose output never exceeds `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                busy: watch::Sender::new(None),
                cancel: AtomicBool::new(false),
                max_size,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Mark the compressor busy, or hand the buffers back if it already is
    fn claim(&self, frame_number: u32, buffers: Vec<LockedBuffer>) -> std::result::Result<Vec<LockedBuffer>, Rejected> {
        let mut running = None;
        self.inner.busy.send_if_modified(|busy| {
            if let Some(job) = busy.as_ref() {
                running = Some(job.frame_number);
                return false;
            }
            *busy = Some(ActiveJob {
                frame_number,
                streams: buffers.iter().map(|b| b.stream_id()).collect(),
            });
            true
        });
        if let Some(running) = running {
            let err = CameraError::Busy(format!("compressor is still working on frame {}", running));
            return Err((buffers, err));
        }
        self.inner.cancel.store(false, Ordering::SeqCst);
        Ok(buffers)
    }

    /// Start compressing on a worker thread.
    ///
    /// `buffers` must contain one BLOB buffer and the RGB compression
    /// scratch (stream id zero). The listener fires exactly once if this
    /// returns `Ok`; on error the buffers are handed back untouched.
    pub fn start(
        &self,
        frame_number: u32,
        buffers: Vec<LockedBuffer>,
        quality: u8,
        listener: Arc<dyn JpegListener>,
    ) -> std::result::Result<(), Rejected> {
        let (blob, input) = split_job(buffers)?;
        let mut claimed = self.claim(frame_number, vec![blob, input])?;
        let input = claimed.pop();
        let blob = claimed.pop();
        let (Some(blob), Some(input)) = (blob, input) else {
            self.inner.finish();
            return Err((Vec::new(), CameraError::Internal("lost compression buffers".into())));
        };

        let mut handle = self.handle.lock();
        if let Some(previous) = handle.take() {
            let _ = previous.join();
        }

        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("jpeg-compressor".into())
            .spawn(move || {
                let outcome = compress(&inner, blob, input, quality);
                deliver(&inner, frame_number, outcome, listener.as_ref());
            });

        match spawned {
            Ok(thread) => {
                *handle = Some(thread);
                Ok(())
            }
            Err(e) => {
                // The closure and its buffers were dropped by the failed spawn
                self.inner.finish();
                Err((
                    Vec::new(),
                    CameraError::Internal(format!("failed to spawn compressor thread: {}", e)),
                ))
            }
        }
    }

    /// Compress on the caller's thread and return the filled BLOB buffer.
    /// On failure the BLOB buffer is handed back with the error.
    pub fn compress_synchronous(
        &self,
        frame_number: u32,
        buffers: Vec<LockedBuffer>,
        quality: u8,
    ) -> std::result::Result<LockedBuffer, Rejected> {
        let (blob, input) = split_job(buffers)?;
        let mut claimed = self.claim(frame_number, vec![blob, input])?;
        let (Some(input), Some(blob)) = (claimed.pop(), claimed.pop()) else {
            self.inner.finish();
            return Err((Vec::new(), CameraError::Internal("lost compression buffers".into())));
        };

        let Outcome { blob, result } = compress(&self.inner, blob, input, quality);
        self.inner.finish();

        match result {
            Ok(_) => Ok(blob),
            Err(e) => Err((vec![blob], e)),
        }
    }

    /// Ask the running job to stop and wait for its thread to exit.
    ///
    /// A job past its last cancellation point completes normally; either way
    /// its listener has fired when this returns.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
        if let Some(thread) = self.handle.lock().take() {
            let _ = thread.join();
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.borrow().is_some()
    }

    /// Whether the active job holds a buffer of `stream_id`
    pub fn is_stream_in_use(&self, stream_id: i32) -> bool {
        self.inner
            .busy
            .borrow()
            .as_ref()
            .is_some_and(|job| job.streams.contains(&stream_id))
    }

    /// Wait until no job is active. Returns `false` on timeout.
    pub fn wait_for_done(&self, timeout: Duration) -> bool {
        let mut busy = self.inner.busy.subscribe();
        block_on_timeout(timeout, busy.wait_for(|job| job.is_none())).is_some_and(|r| r.is_ok())
    }
}

impl Default for JpegCompressor {
    fn default() -> Self {
        Self::new(crate::sensor::buffer::DEFAULT_MAX_JPEG_SIZE)
    }
}

impl Drop for JpegCompressor {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Pick the BLOB destination and the RGB source out of a buffer set
fn split_job(buffers: Vec<LockedBuffer>) -> std::result::Result<(LockedBuffer, LockedBuffer), Rejected> {
    let mut blob = None;
    let mut input = None;
    let mut rest = Vec::new();

    for buffer in buffers {
        if buffer.format() == PixelFormat::Blob && blob.is_none() {
            blob = Some(buffer);
        } else if buffer.stream_id() == 0 && input.is_none() {
            input = Some(buffer);
        } else {
            rest.push(buffer);
        }
    }

    match (blob, input) {
        (Some(blob), Some(input)) if rest.is_empty() => Ok((blob, input)),
        (blob, input) => {
            rest.extend(blob);
            rest.extend(input);
            Err((
                rest,
                CameraError::Config("compression needs exactly one BLOB and one RGB input buffer".into()),
            ))
        }
    }
}

fn compress(inner: &Inner, mut blob: LockedBuffer, input: LockedBuffer, quality: u8) -> Outcome {
    let result = encode_into(inner, &mut blob, &input, quality);
    Outcome { blob, result }
}

fn encode_into(inner: &Inner, blob: &mut LockedBuffer, input: &LockedBuffer, quality: u8) -> Result<usize> {
    if inner.cancel.load(Ordering::SeqCst) {
        return Err(CameraError::Cancelled("compression cancelled before start".into()));
    }
    if input.format() != PixelFormat::Rgb888 {
        return Err(CameraError::UnsupportedFormat {
            stream_id: input.stream_id(),
            format: input.format().to_string(),
        });
    }

    let width = input.width() as usize;
    let height = input.height() as usize;
    let pitch = input.stride() as usize * 3;
    input.ensure_len(pitch * height)?;

    let mut compressor = turbojpeg::Compressor::new()
        .map_err(|e| CameraError::Compression(format!("Failed to create turbojpeg compressor: {}", e)))?;
    compressor
        .set_quality(quality.clamp(1, 100) as i32)
        .map_err(|e| CameraError::Compression(format!("Failed to set JPEG quality: {}", e)))?;

    let image = turbojpeg::Image {
        pixels: input.pixels(),
        width,
        pitch,
        height,
        format: turbojpeg::PixelFormat::RGB,
    };
    let jpeg = compressor
        .compress_to_vec(image)
        .map_err(|e| CameraError::Compression(format!("JPEG compression failed: {}", e)))?;

    if inner.cancel.load(Ordering::SeqCst) {
        return Err(CameraError::Cancelled("compression cancelled".into()));
    }

    let limit = inner.max_size.min(blob.pixels().len());
    if jpeg.len() > limit {
        return Err(CameraError::Compression(format!(
            "encoded image is {} bytes, BLOB buffer of stream {} takes {}",
            jpeg.len(),
            blob.stream_id(),
            limit
        )));
    }
    blob.pixels_mut()[..jpeg.len()].copy_from_slice(&jpeg);
    blob.set_bytes_used(jpeg.len());
    Ok(jpeg.len())
}

/// Report an asynchronous outcome, then release the busy flag
fn deliver(inner: &Inner, frame_number: u32, outcome: Outcome, listener: &dyn JpegListener) {
    let Outcome { blob, result } = outcome;
    let success = match &result {
        Ok(size) => {
            debug!("Frame {}: compressed {} bytes", frame_number, size);
            true
        }
        Err(CameraError::Cancelled(reason)) => {
            warn!("Frame {}: {}", frame_number, reason);
            false
        }
        Err(e) => {
            error!("Frame {}: JPEG compression failed: {}", frame_number, e);
            false
        }
    };

    let status = if success { BufferStatus::Ok } else { BufferStatus::Error };
    listener.on_jpeg_done(frame_number, blob.unlock(status), success);
    inner.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::StreamBuffer;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Barrier};

    struct ChannelListener {
        tx: Mutex<mpsc::Sender<(u32, StreamBuffer, bool)>>,
    }

    impl JpegListener for ChannelListener {
        fn on_jpeg_done(&self, frame_number: u32, buffer: StreamBuffer, success: bool) {
            let _ = self.tx.lock().send((frame_number, buffer, success));
        }
    }

    fn listener() -> (Arc<ChannelListener>, mpsc::Receiver<(u32, StreamBuffer, bool)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelListener { tx: Mutex::new(tx) }), rx)
    }

    fn job(width: u32, height: u32) -> Vec<LockedBuffer> {
        let blob = StreamBuffer::new(4, PixelFormat::Blob, width, height)
            .lock(Duration::ZERO)
            .unwrap();
        let mut input = LockedBuffer::scratch_rgb(width, height);
        for (i, px) in input.pixels_mut().iter_mut().enumerate() {
            *px = (i % 251) as u8;
        }
        vec![blob, input]
    }

    #[test]
    fn test_synchronous_compress() {
        let compressor = JpegCompressor::default();
        let blob = compressor.compress_synchronous(1, job(64, 48), 80).unwrap();

        assert_eq!(blob.stream_id(), 4);
        // JPEG start-of-image marker
        assert_eq!(&blob.pixels()[..2], &[0xFF, 0xD8]);
        assert!(!compressor.is_busy());
    }

    #[test]
    fn test_missing_input_is_rejected() {
        let compressor = JpegCompressor::default();
        let blob = StreamBuffer::new(4, PixelFormat::Blob, 8, 8)
            .lock(Duration::ZERO)
            .unwrap();
        let (returned, err) = compressor.compress_synchronous(1, vec![blob], 80).unwrap_err();
        assert_eq!(err.code(), "configuration");
        assert_eq!(returned.len(), 1);
        assert!(!compressor.is_busy());
    }

    /// Holds the compressor busy inside the listener until the gate opens
    struct GatedListener {
        gate: Barrier,
        fired: AtomicUsize,
    }

    impl JpegListener for GatedListener {
        fn on_jpeg_done(&self, frame_number: u32, buffer: StreamBuffer, success: bool) {
            assert_eq!(frame_number, 1);
            assert!(success);
            assert!(buffer.bytes_used() > 0);
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.gate.wait();
        }
    }

    #[test]
    fn test_second_start_is_busy() {
        let compressor = JpegCompressor::default();
        let gated = Arc::new(GatedListener {
            gate: Barrier::new(2),
            fired: AtomicUsize::new(0),
        });
        let (other, rx) = listener();

        compressor.start(1, job(640, 480), 90, gated.clone()).unwrap();
        assert!(compressor.is_busy());

        let (returned, err) = compressor.start(2, job(64, 48), 90, other).unwrap_err();
        assert_eq!(err.code(), "busy");
        assert_eq!(returned.len(), 2);
        assert!(compressor.is_stream_in_use(4));

        gated.gate.wait();
        assert!(compressor.wait_for_done(Duration::from_secs(5)));
        compressor.cancel();
        assert_eq!(gated.fired.load(Ordering::SeqCst), 1);
        // The refused job never reaches a listener
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_output_bounded_by_max_size() {
        let compressor = JpegCompressor::new(16);
        let (returned, err) = compressor.compress_synchronous(1, job(64, 48), 80).unwrap_err();
        assert_eq!(err.code(), "internal");
        assert_eq!(returned.len(), 1);
        assert!(!compressor.is_busy());
    }

    #[test]
    fn test_stream_in_use_only_while_busy() {
        let compressor = JpegCompressor::default();
        assert!(!compressor.is_stream_in_use(4));
        assert!(compressor.wait_for_done(Duration::from_millis(1)));
    }
}

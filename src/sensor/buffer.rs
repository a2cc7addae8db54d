//! Stream buffers with explicit acquire and release phases
//!
//! A [`StreamBuffer`] is owned by whoever holds it. The pipeline may only
//! write pixels through a [`LockedBuffer`], which is obtained by waiting on
//! the buffer's acquire fence and is turned back into a `StreamBuffer` by
//! [`LockedBuffer::unlock`], consuming the lock.

use bytes::BytesMut;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::format::PixelFormat;
use crate::error::{CameraError, Result};
use crate::utils::block_on_timeout;

/// Default capacity of a compressed-image buffer
pub const DEFAULT_MAX_JPEG_SIZE: usize = 300_000;

/// One-shot signal between a buffer producer and consumer
#[derive(Clone)]
pub struct Fence {
    state: Arc<watch::Sender<bool>>,
}

impl Fence {
    /// An unsignaled fence
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(false)),
        }
    }

    /// A fence that is already signaled
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        self.state.send_replace(true);
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.borrow()
    }

    /// Returns `false` if the fence was not signaled within `timeout`.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        block_on_timeout(timeout, state.wait_for(|signaled| *signaled)).is_some_and(|r| r.is_ok())
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Per-buffer outcome reported back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStatus {
    Ok,
    Error,
}

/// A destination (or reprocess source) buffer of one stream.
///
/// Positive stream ids are caller streams; zero marks a pipeline-owned
/// scratch buffer and negative ids mark reprocess inputs.
pub struct StreamBuffer {
    pub stream_id: i32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Row pitch in pixels
    pub stride: u32,
    pub status: BufferStatus,
    data: BytesMut,
    bytes_used: usize,
    acquire_fence: Option<Fence>,
    release_fence: Option<Fence>,
}

impl StreamBuffer {
    /// Allocate a zeroed buffer with a stride equal to its width
    pub fn new(stream_id: i32, format: PixelFormat, width: u32, height: u32) -> Self {
        Self::with_stride(stream_id, format, width, height, width)
    }

    pub fn with_stride(stream_id: i32, format: PixelFormat, width: u32, height: u32, stride: u32) -> Self {
        let size = format.buffer_size(stride, height, DEFAULT_MAX_JPEG_SIZE);
        Self {
            stream_id,
            format,
            width,
            height,
            stride,
            status: BufferStatus::Ok,
            data: BytesMut::zeroed(size),
            bytes_used: 0,
            acquire_fence: None,
            release_fence: None,
        }
    }

    /// The pipeline must not write until `fence` is signaled
    pub fn with_acquire_fence(mut self, fence: Fence) -> Self {
        self.acquire_fence = Some(fence);
        self
    }

    /// Signaled once the pipeline has finished writing
    pub fn with_release_fence(mut self, fence: Fence) -> Self {
        self.release_fence = Some(fence);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes written by the last render (the encoded size for compressed buffers)
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Wait on the acquire fence and take the buffer for writing.
    ///
    /// On timeout the buffer is handed back with its status set to error.
    pub fn lock(mut self, timeout: Duration) -> std::result::Result<LockedBuffer, (StreamBuffer, CameraError)> {
        if let Some(fence) = self.acquire_fence.take() {
            if !fence.wait(timeout) {
                let err = CameraError::Timeout(format!("acquire fence of stream {}", self.stream_id));
                self.acquire_fence = Some(fence);
                self.status = BufferStatus::Error;
                return Err((self, err));
            }
        }
        Ok(LockedBuffer { buffer: self })
    }
}

impl fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("stream_id", &self.stream_id)
            .field("format", &self.format)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("stride", &self.stride)
            .field("status", &self.status)
            .field("bytes_used", &self.bytes_used)
            .finish()
    }
}

/// A buffer the pipeline is allowed to write into
pub struct LockedBuffer {
    buffer: StreamBuffer,
}

impl LockedBuffer {
    /// Pipeline-owned RGB scratch buffer used as compression input
    pub fn scratch_rgb(width: u32, height: u32) -> Self {
        Self {
            buffer: StreamBuffer::new(0, PixelFormat::Rgb888, width, height),
        }
    }

    pub fn stream_id(&self) -> i32 {
        self.buffer.stream_id
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.format
    }

    pub fn width(&self) -> u32 {
        self.buffer.width
    }

    pub fn height(&self) -> u32 {
        self.buffer.height
    }

    pub fn stride(&self) -> u32 {
        self.buffer.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.buffer.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.data
    }

    pub fn set_bytes_used(&mut self, n: usize) {
        self.buffer.bytes_used = n.min(self.buffer.data.len());
    }

    /// Finish writing: record the outcome and signal the release fence.
    pub fn unlock(self, status: BufferStatus) -> StreamBuffer {
        let mut buffer = self.buffer;
        buffer.status = status;
        if let Some(fence) = &buffer.release_fence {
            fence.signal();
        }
        buffer
    }

    /// Check the buffer can hold `needed` bytes
    pub fn ensure_len(&self, needed: usize) -> Result<()> {
        if self.buffer.data.len() < needed {
            return Err(CameraError::Render {
                stream_id: self.buffer.stream_id,
                reason: format!("buffer holds {} bytes, {} needed", self.buffer.data.len(), needed),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedBuffer").field(&self.buffer).finish()
    }
}

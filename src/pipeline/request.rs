//! Capture request, result and notification types

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::CameraError;
use crate::metadata::Metadata;
use crate::sensor::StreamBuffer;

/// One capture request from the caller
#[derive(Debug)]
pub struct CaptureRequest {
    pub frame_number: u32,
    /// `None` reuses the settings of the previous request
    pub settings: Option<Metadata>,
    pub output_buffers: Vec<StreamBuffer>,
    /// Reprocess source, from the configured input stream
    pub input_buffer: Option<StreamBuffer>,
}

impl CaptureRequest {
    pub fn new(frame_number: u32, settings: Option<Metadata>, output_buffers: Vec<StreamBuffer>) -> Self {
        Self {
            frame_number,
            settings,
            output_buffers,
            input_buffer: None,
        }
    }

    pub fn with_input(mut self, buffer: StreamBuffer) -> Self {
        self.input_buffer = Some(buffer);
        self
    }

    /// The request carries a compressed-image destination
    pub fn has_blob(&self) -> bool {
        self.output_buffers.iter().any(|b| b.format.is_compressed())
    }
}

/// A request handed back unprocessed, with the reason it was refused
#[derive(Debug, Error)]
#[error("request {frame} rejected: {error}", frame = .request.frame_number)]
pub struct RequestRejected {
    pub request: CaptureRequest,
    #[source]
    pub error: CameraError,
}

impl RequestRejected {
    pub fn new(request: CaptureRequest, error: CameraError) -> Self {
        Self { request, error }
    }

    /// Stable reason code of the underlying error
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

/// Result of one request.
///
/// Every request gets one result with metadata. A frame with a compressed
/// output gets a second, metadata-less result carrying only that buffer.
#[derive(Debug)]
pub struct CaptureResult {
    pub frame_number: u32,
    pub settings: Option<Metadata>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
}

impl CaptureResult {
    /// The late result of a compressed buffer
    pub fn is_partial(&self) -> bool {
        self.settings.is_none()
    }

    pub fn buffer(&self, stream_id: i32) -> Option<&StreamBuffer> {
        self.output_buffers.iter().find(|b| b.stream_id == stream_id)
    }
}

/// What went wrong for a failed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The whole request was lost; no result with metadata follows
    Request,
    /// One buffer could not be filled; the rest of the frame is valid
    Buffer,
    /// The pipeline shut down with the request pending
    Device,
}

/// Asynchronous notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notify {
    /// Exposure of a frame began
    ShutterOpened { frame_number: u32, timestamp_ns: i64 },
    Error {
        frame_number: u32,
        code: ErrorCode,
        stream_id: Option<i32>,
    },
}

/// Everything the pipeline sends back to the caller, in order
#[derive(Debug)]
pub enum CameraMessage {
    Notify(Notify),
    Result(CaptureResult),
}

impl CameraMessage {
    pub fn frame_number(&self) -> u32 {
        match self {
            CameraMessage::Notify(Notify::ShutterOpened { frame_number, .. })
            | CameraMessage::Notify(Notify::Error { frame_number, .. }) => *frame_number,
            CameraMessage::Result(result) => result.frame_number,
        }
    }
}

/// Sending half of the caller's message channel. Sends never block and
/// are dropped once the caller hangs up.
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::UnboundedSender<CameraMessage>,
}

impl MessageSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CameraMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, notify: Notify) {
        trace!("Notify {:?}", notify);
        let _ = self.tx.send(CameraMessage::Notify(notify));
    }

    pub fn result(&self, result: CaptureResult) {
        trace!(
            "Result for frame {} with {} buffer(s)",
            result.frame_number,
            result.output_buffers.len()
        );
        let _ = self.tx.send(CameraMessage::Result(result));
    }

    /// Fail a whole request
    pub fn request_error(&self, frame_number: u32, code: ErrorCode) {
        self.notify(Notify::Error {
            frame_number,
            code,
            stream_id: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::PixelFormat;

    #[test]
    fn test_rejection_keeps_request() {
        let request = CaptureRequest::new(
            4,
            None,
            vec![StreamBuffer::new(1, PixelFormat::Blob, 64, 48)],
        );
        assert!(request.has_blob());

        let rejected = RequestRejected::new(request, CameraError::Timeout("vsync".into()));
        assert_eq!(rejected.code(), "timeout");
        assert_eq!(rejected.request.output_buffers.len(), 1);
        assert!(rejected.to_string().contains("request 4"));
    }

    #[tokio::test]
    async fn test_sink_preserves_order() {
        let (sink, mut rx) = MessageSink::channel();
        sink.notify(Notify::ShutterOpened {
            frame_number: 1,
            timestamp_ns: 10,
        });
        sink.result(CaptureResult {
            frame_number: 1,
            settings: Some(Metadata::new()),
            output_buffers: Vec::new(),
            input_buffer: None,
        });
        sink.request_error(2, ErrorCode::Request);

        assert!(matches!(rx.recv().await, Some(CameraMessage::Notify(Notify::ShutterOpened { .. }))));
        let result = match rx.recv().await {
            Some(CameraMessage::Result(result)) => result,
            other => panic!("expected a result, got {:?}", other),
        };
        assert!(!result.is_partial());
        assert_eq!(rx.recv().await.map(|m| m.frame_number()), Some(2));
    }
}

use serde::Serialize;
use thiserror::Error;

/// Camera-wide error type
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid settings for frame {frame}: {reason}")]
    InvalidSettings { frame: u32, reason: String },

    #[error("Unsupported format {format} on stream {stream_id}")]
    UnsupportedFormat { stream_id: i32, format: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Render error [stream {stream_id}]: {reason}")]
    Render { stream_id: i32, reason: String },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable failure category, independent of message text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rejected synchronously; the request never entered the engine
    Configuration,
    /// A bounded wait ran out
    Timeout,
    /// A single-job resource was already in use
    Busy,
    /// Pixel encoding failed for one buffer
    Render,
    /// Anything else, including compression and cancellation
    Internal,
}

impl ErrorCategory {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Busy => "busy",
            ErrorCategory::Render => "render",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl CameraError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CameraError::Config(_)
            | CameraError::InvalidSettings { .. }
            | CameraError::UnsupportedFormat { .. }
            | CameraError::InvalidState(_)
            | CameraError::Serialization(_) => ErrorCategory::Configuration,
            CameraError::Timeout(_) => ErrorCategory::Timeout,
            CameraError::Busy(_) | CameraError::QueueFull { .. } => ErrorCategory::Busy,
            CameraError::Render { .. } => ErrorCategory::Render,
            CameraError::Compression(_)
            | CameraError::Cancelled(_)
            | CameraError::Internal(_)
            | CameraError::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Stable reason code for callers and tests
    pub fn code(&self) -> &'static str {
        self.category().code()
    }

    pub(crate) fn invalid(frame: u32, reason: impl Into<String>) -> Self {
        CameraError::InvalidSettings {
            frame,
            reason: reason.into(),
        }
    }
}

/// Result type alias for camera operations
pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_are_stable() {
        assert_eq!(CameraError::invalid(3, "no settings").code(), "configuration");
        assert_eq!(CameraError::Timeout("vsync".into()).code(), "timeout");
        assert_eq!(CameraError::QueueFull { capacity: 2 }.code(), "busy");
        assert_eq!(
            CameraError::Render {
                stream_id: 1,
                reason: "short buffer".into()
            }
            .category(),
            ErrorCategory::Render
        );
        assert_eq!(CameraError::Cancelled("jpeg".into()).code(), "internal");
    }
}

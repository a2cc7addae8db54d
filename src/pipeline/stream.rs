//! Stream configuration
//!
//! Streams are declared up front. Requests may only reference buffers of
//! streams from the latest configuration; streams dropped by a
//! reconfiguration stay known but dead, so stale buffers are rejected with
//! a clear reason instead of as unknown.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::CapabilitySet;
use crate::error::{CameraError, Result};
use crate::sensor::{PixelFormat, Resolution, StreamBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    Output,
    Input,
    Bidirectional,
}

impl StreamDirection {
    pub fn is_input(&self) -> bool {
        matches!(self, StreamDirection::Input | StreamDirection::Bidirectional)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, StreamDirection::Output | StreamDirection::Bidirectional)
    }
}

/// One stream descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Caller-chosen id, must be positive
    pub id: i32,
    pub direction: StreamDirection,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl StreamConfig {
    pub fn output(id: i32, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            id,
            direction: StreamDirection::Output,
            format,
            width,
            height,
        }
    }

    pub fn input(id: i32, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            id,
            direction: StreamDirection::Input,
            format,
            width,
            height,
        }
    }

    /// Allocate a buffer for this stream
    pub fn buffer(&self) -> StreamBuffer {
        StreamBuffer::new(self.id, self.format, self.width, self.height)
    }
}

#[derive(Debug, Clone)]
struct StreamInfo {
    config: StreamConfig,
    alive: bool,
}

/// The configured streams of one camera
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<i32, StreamInfo>,
    input: Option<i32>,
    configured: bool,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Id of the live input stream, if any
    pub fn input_stream(&self) -> Option<i32> {
        self.input
    }

    pub fn get(&self, id: i32) -> Option<&StreamConfig> {
        self.streams.get(&id).filter(|s| s.alive).map(|s| &s.config)
    }

    /// Live streams, ordered by id
    pub fn live(&self) -> Vec<StreamConfig> {
        let mut live: Vec<StreamConfig> = self
            .streams
            .values()
            .filter(|s| s.alive)
            .map(|s| s.config)
            .collect();
        live.sort_by_key(|s| s.id);
        live
    }

    /// Replace the stream set.
    ///
    /// The whole list is checked before anything changes. No stream may be
    /// larger than the sensor's `max` resolution. Streams missing from
    /// `streams` are kept as dead.
    pub fn configure(&mut self, streams: &[StreamConfig], caps: &CapabilitySet, max: Resolution) -> Result<()> {
        if streams.is_empty() {
            return Err(CameraError::Config("no streams to configure".into()));
        }

        let mut input = None;
        let mut seen = Vec::with_capacity(streams.len());
        for stream in streams {
            if stream.id <= 0 {
                return Err(CameraError::Config(format!(
                    "stream id {} is reserved, ids must be positive",
                    stream.id
                )));
            }
            if seen.contains(&stream.id) {
                return Err(CameraError::Config(format!("stream {} configured twice", stream.id)));
            }
            seen.push(stream.id);

            if stream.width == 0 || stream.height == 0 {
                return Err(CameraError::Config(format!(
                    "stream {} has an empty size {}x{}",
                    stream.id, stream.width, stream.height
                )));
            }
            if stream.width > max.width || stream.height > max.height {
                return Err(CameraError::Config(format!(
                    "stream {} size {}x{} exceeds the sensor's {}",
                    stream.id, stream.width, stream.height, max
                )));
            }
            if !caps.allows_format(stream.format) {
                return Err(CameraError::UnsupportedFormat {
                    stream_id: stream.id,
                    format: stream.format.to_string(),
                });
            }
            if stream.direction.is_input() {
                if input.is_some() {
                    return Err(CameraError::Config("only one input stream is supported".into()));
                }
                input = Some(stream.id);
            }
        }

        for info in self.streams.values_mut() {
            info.alive = false;
        }
        for stream in streams {
            debug!(
                "Stream {}: {:?} {} {}x{}",
                stream.id, stream.direction, stream.format, stream.width, stream.height
            );
            self.streams.insert(
                stream.id,
                StreamInfo {
                    config: *stream,
                    alive: true,
                },
            );
        }
        self.input = input;
        self.configured = true;
        info!("Configured {} stream(s)", streams.len());
        Ok(())
    }

    /// Check that a request buffer belongs to a live stream it can be used
    /// with, and has that stream's format and size
    pub fn check_buffer(&self, frame_number: u32, buffer: &StreamBuffer, as_input: bool) -> Result<()> {
        let info = self.streams.get(&buffer.stream_id).ok_or_else(|| {
            CameraError::invalid(frame_number, format!("buffer of unconfigured stream {}", buffer.stream_id))
        })?;
        if !info.alive {
            return Err(CameraError::invalid(
                frame_number,
                format!("buffer of dead stream {}", buffer.stream_id),
            ));
        }

        let direction_ok = if as_input {
            info.config.direction.is_input()
        } else {
            info.config.direction.is_output()
        };
        if !direction_ok {
            return Err(CameraError::invalid(
                frame_number,
                format!("stream {} is not an {} stream", buffer.stream_id, if as_input { "input" } else { "output" }),
            ));
        }
        if buffer.format != info.config.format {
            return Err(CameraError::invalid(
                frame_number,
                format!(
                    "buffer format {} does not match stream {} format {}",
                    buffer.format, buffer.stream_id, info.config.format
                ),
            ));
        }
        if buffer.width != info.config.width || buffer.height != info.config.height {
            return Err(CameraError::invalid(
                frame_number,
                format!(
                    "buffer size {}x{} does not match stream {} size {}x{}",
                    buffer.width, buffer.height, buffer.stream_id, info.config.width, info.config.height
                ),
            ));
        }
        if buffer.stride < buffer.width {
            return Err(CameraError::invalid(
                frame_number,
                format!(
                    "buffer of stream {} has stride {} below its width {}",
                    buffer.stream_id, buffer.stride, buffer.width
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraProfile;

    fn full() -> CapabilitySet {
        CameraProfile::Full.capabilities()
    }

    #[test]
    fn test_configure_and_lookup() {
        let mut registry = StreamRegistry::new();
        assert!(!registry.is_configured());
        registry
            .configure(
                &[
                    StreamConfig::output(1, PixelFormat::Rgb888, 320, 240),
                    StreamConfig::output(2, PixelFormat::Blob, 640, 480),
                ],
                &full(),
                Resolution::VGA,
            )
            .unwrap();

        assert!(registry.is_configured());
        assert_eq!(registry.get(2).map(|s| s.format), Some(PixelFormat::Blob));
        assert_eq!(registry.live().len(), 2);
        assert!(registry.input_stream().is_none());
    }

    #[test]
    fn test_reconfigure_marks_dead() {
        let mut registry = StreamRegistry::new();
        registry
            .configure(&[StreamConfig::output(1, PixelFormat::Rgb888, 320, 240)], &full(), Resolution::VGA)
            .unwrap();
        registry
            .configure(&[StreamConfig::output(2, PixelFormat::Nv21, 320, 240)], &full(), Resolution::VGA)
            .unwrap();

        let stale = StreamBuffer::new(1, PixelFormat::Rgb888, 320, 240);
        let err = registry.check_buffer(5, &stale, false).unwrap_err();
        assert_eq!(err.code(), "configuration");
        assert!(err.to_string().contains("dead"));

        let unknown = StreamBuffer::new(9, PixelFormat::Rgb888, 320, 240);
        assert!(registry.check_buffer(5, &unknown, false).unwrap_err().to_string().contains("unconfigured"));
    }

    #[test]
    fn test_rejects_bad_lists() {
        let mut registry = StreamRegistry::new();
        assert!(registry.configure(&[], &full(), Resolution::VGA).is_err());
        assert!(registry
            .configure(&[StreamConfig::output(0, PixelFormat::Rgb888, 320, 240)], &full(), Resolution::VGA)
            .is_err());

        let two_inputs = [
            StreamConfig::input(1, PixelFormat::Rgb888, 320, 240),
            StreamConfig::input(2, PixelFormat::Rgb888, 320, 240),
        ];
        assert!(registry.configure(&two_inputs, &full(), Resolution::VGA).is_err());

        // Depth output needs the depth capability
        let depth = [StreamConfig::output(1, PixelFormat::Depth16, 320, 240)];
        let err = registry.configure(&depth, &full(), Resolution::VGA).unwrap_err();
        assert_eq!(err.code(), "configuration");
        assert!(!registry.is_configured());
    }

    #[test]
    fn test_input_stream_direction() {
        let mut registry = StreamRegistry::new();
        registry
            .configure(
                &[
                    StreamConfig::input(3, PixelFormat::Rgb888, 320, 240),
                    StreamConfig::output(4, PixelFormat::Blob, 320, 240),
                ],
                &full(),
                Resolution::VGA,
            )
            .unwrap();
        assert_eq!(registry.input_stream(), Some(3));

        let input = StreamBuffer::new(3, PixelFormat::Rgb888, 320, 240);
        assert!(registry.check_buffer(1, &input, true).is_ok());
        assert!(registry.check_buffer(1, &input, false).is_err());
    }

    #[test]
    fn test_streams_bounded_by_sensor() {
        let mut registry = StreamRegistry::new();
        let too_wide = [StreamConfig::output(1, PixelFormat::Rgb888, 1280, 480)];
        let err = registry.configure(&too_wide, &full(), Resolution::VGA).unwrap_err();
        assert_eq!(err.code(), "configuration");
        assert!(err.to_string().contains("exceeds"));

        let too_tall = [StreamConfig::output(1, PixelFormat::Raw16, 640, 481)];
        assert!(registry.configure(&too_tall, &full(), Resolution::VGA).is_err());
        assert!(!registry.is_configured());

        let full_size = [StreamConfig::output(1, PixelFormat::Raw16, 640, 480)];
        assert!(registry.configure(&full_size, &full(), Resolution::VGA).is_ok());
    }

    #[test]
    fn test_buffer_must_match_stream_size() {
        let mut registry = StreamRegistry::new();
        registry
            .configure(&[StreamConfig::output(1, PixelFormat::Rgb888, 320, 240)], &full(), Resolution::VGA)
            .unwrap();

        let matching = StreamBuffer::new(1, PixelFormat::Rgb888, 320, 240);
        assert!(registry.check_buffer(1, &matching, false).is_ok());
        let padded = StreamBuffer::with_stride(1, PixelFormat::Rgb888, 320, 240, 384);
        assert!(registry.check_buffer(1, &padded, false).is_ok());

        let larger = StreamBuffer::new(1, PixelFormat::Rgb888, 640, 480);
        let err = registry.check_buffer(2, &larger, false).unwrap_err();
        assert_eq!(err.code(), "configuration");
        assert!(err.to_string().contains("640x480"));

        let smaller = StreamBuffer::new(1, PixelFormat::Rgb888, 320, 120);
        assert!(registry.check_buffer(3, &smaller, false).is_err());

        let mut narrow = StreamBuffer::new(1, PixelFormat::Rgb888, 320, 240);
        narrow.stride = 100;
        assert!(registry
            .check_buffer(4, &narrow, false)
            .unwrap_err()
            .to_string()
            .contains("stride"));
    }
}

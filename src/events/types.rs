//! Camera event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::metadata::{AeState, AfState};
use crate::sensor::SensorPhase;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Constructed, no streams configured
    Open,
    /// Streams configured, nothing in flight
    Ready,
    /// At least one request in flight
    Active,
    /// Closed; no further requests accepted
    Closed,
}

/// Camera event enumeration
///
/// Serialized as `{ "event": "3a.ae_state_changed", "data": { ... } }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CameraEvent {
    /// AE discrete state changed while processing a request
    #[serde(rename = "3a.ae_state_changed")]
    AeStateChanged {
        frame_number: u32,
        from: AeState,
        to: AeState,
        /// Precapture trigger id carried by the request, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger_id: Option<i32>,
    },

    /// AF discrete state changed while processing a request
    #[serde(rename = "3a.af_state_changed")]
    AfStateChanged {
        frame_number: u32,
        from: AfState,
        to: AfState,
        /// AF trigger id carried by the request, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger_id: Option<i32>,
    },

    #[serde(rename = "pipeline.state_changed")]
    PipelineStateChanged { state: PipelineState },

    #[serde(rename = "sensor.phase_changed")]
    SensorPhaseChanged { phase: SensorPhase },

    /// A request failed after it entered the engine
    #[serde(rename = "error")]
    Error {
        frame_number: Option<u32>,
        code: String,
        message: String,
    },
}

impl CameraEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::AeStateChanged { .. } => "3a.ae_state_changed",
            Self::AfStateChanged { .. } => "3a.af_state_changed",
            Self::PipelineStateChanged { .. } => "pipeline.state_changed",
            Self::SensorPhaseChanged { .. } => "sensor.phase_changed",
            Self::Error { .. } => "error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `3a.*` matches all 3A events
    /// - `3a.af_state_changed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let event = CameraEvent::AfStateChanged {
            frame_number: 3,
            from: AfState::Inactive,
            to: AfState::ActiveScan,
            trigger_id: Some(9),
        };
        assert_eq!(event.event_name(), "3a.af_state_changed");

        let event = CameraEvent::PipelineStateChanged {
            state: PipelineState::Ready,
        };
        assert_eq!(event.event_name(), "pipeline.state_changed");
    }

    #[test]
    fn test_matches_topic() {
        let event = CameraEvent::AeStateChanged {
            frame_number: 1,
            from: AeState::Inactive,
            to: AeState::Precapture,
            trigger_id: None,
        };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("3a.*"));
        assert!(event.matches_topic("3a.ae_state_changed"));
        assert!(!event.matches_topic("sensor.*"));
        assert!(!event.matches_topic("3a.af_state_changed"));
    }

    #[test]
    fn test_serialization() {
        let event = CameraEvent::SensorPhaseChanged {
            phase: SensorPhase::ReadingOut,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("sensor.phase_changed"));
        assert!(json.contains("reading_out"));

        let deserialized: CameraEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            deserialized,
            CameraEvent::SensorPhaseChanged {
                phase: SensorPhase::ReadingOut
            }
        ));
    }
}

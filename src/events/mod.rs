//! Camera events
//!
//! 3A transitions, pipeline state, sensor phases and request failures fan
//! out to any number of observers. Results and shutter notifications stay
//! on the ordered per-camera message channel instead.

pub mod types;

pub use types::{CameraEvent, PipelineState};

use tokio::sync::broadcast;

/// Events a slow subscriber may fall behind by before it sees `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CameraEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to every current subscriber; dropped if there are none
    pub fn publish(&self, event: CameraEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish 3A transitions of one frame in order
    pub fn publish_all(&self, events: impl IntoIterator<Item = CameraEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::AeState;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(CameraEvent::PipelineStateChanged {
            state: PipelineState::Active,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            CameraEvent::PipelineStateChanged {
                state: PipelineState::Active
            }
        ));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_keep_order() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish_all([
            CameraEvent::AeStateChanged {
                frame_number: 1,
                from: AeState::Inactive,
                to: AeState::Precapture,
                trigger_id: Some(4),
            },
            CameraEvent::Error {
                frame_number: Some(1),
                code: "timeout".to_string(),
                message: "test message".to_string(),
            },
        ]);

        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(rx.recv().await.unwrap(), CameraEvent::AeStateChanged { .. }));
            assert!(matches!(rx.recv().await.unwrap(), CameraEvent::Error { .. }));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        // Nobody listening yet
        bus.publish(CameraEvent::Error {
            frame_number: None,
            code: "internal".to_string(),
            message: "test".to_string(),
        });

        let mut rx = bus.subscribe();
        bus.publish(CameraEvent::PipelineStateChanged {
            state: PipelineState::Closed,
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            CameraEvent::PipelineStateChanged {
                state: PipelineState::Closed
            }
        ));
        assert!(rx.try_recv().is_err());
    }
}

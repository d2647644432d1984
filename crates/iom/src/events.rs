use chrono::Utc;
use tokio::sync::broadcast;

/// Vehicle lifecycle events emitted by the handlers, consumed by the
/// differential feed publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TechnicalVehicleLogOn,
    TechnicalVehicleLogOff,
    OperationalVehicleLogOn,
    OperationalVehicleLogOff,
    GnssPhysicalPositionUpdate,
}

#[derive(Debug, Clone)]
pub struct EventMessage {
    pub kind: EventKind,
    pub vehicle_ref: String,
    pub timestamp: i64,
}

impl EventMessage {
    pub fn new(kind: EventKind, vehicle_ref: impl Into<String>) -> Self {
        Self {
            kind,
            vehicle_ref: vehicle_ref.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Log-on/log-off transitions must reach subscribers promptly, they
    /// carry tombstones and feed resets.
    pub fn is_transition(&self) -> bool {
        self.kind != EventKind::GnssPhysicalPositionUpdate
    }
}

/// In-process fan-out of vehicle events.
#[derive(Debug, Clone)]
pub struct EventStream {
    sender: broadcast::Sender<EventMessage>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.sender.subscribe()
    }

    pub fn publish(&self, message: EventMessage) {
        // a send error only means there is no subscriber right now
        let _ = self.sender.send(message);
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let stream = EventStream::default();
        let mut first = stream.subscribe();
        let mut second = stream.subscribe();

        stream.publish(EventMessage::new(EventKind::TechnicalVehicleLogOn, "bus-1"));

        assert_eq!(first.recv().await.unwrap().vehicle_ref, "bus-1");
        assert_eq!(
            second.recv().await.unwrap().kind,
            EventKind::TechnicalVehicleLogOn
        );
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let stream = EventStream::default();
        stream.publish(EventMessage::new(EventKind::GnssPhysicalPositionUpdate, "bus-1"));
    }
}

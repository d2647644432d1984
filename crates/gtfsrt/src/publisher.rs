use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use iom::events::{EventMessage, EventStream};
use prost::Message;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tokio::sync::watch;

use crate::export::FeedAssembler;

/// minimum interval between differential emissions per vehicle; transitions
/// (log-on/log-off) bypass the gate so tombstones are never delayed.
const PUBLISH_MIN_INTERVAL_SECONDS: i64 = 5;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_template: String,
}

impl PublisherConfig {
    /// Returns `None` when no publisher host is configured; the
    /// differential publisher is an optional collaborator.
    pub fn from_env() -> Option<Self> {
        let host = env::var("A2G_PUBLISHER_MQTT_HOST").ok()?;
        let port = env::var("A2G_PUBLISHER_MQTT_PORT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(1883);

        Some(Self {
            host,
            port,
            username: env::var("A2G_PUBLISHER_MQTT_USERNAME").ok(),
            password: env::var("A2G_PUBLISHER_MQTT_PASSWORD").ok(),
            topic_template: env::var("A2G_PUBLISHER_TOPIC_TEMPLATE")
                .unwrap_or_else(|_| "gtfsrt/{dataType}/{vehicleId}".to_owned()),
        })
    }
}

/// Per-vehicle minimum-interval gate for event-driven publishing.
struct DebounceGate {
    min_interval_seconds: i64,
    last_emission: HashMap<String, i64>,
}

impl DebounceGate {
    fn new(min_interval_seconds: i64) -> Self {
        Self {
            min_interval_seconds,
            last_emission: HashMap::new(),
        }
    }

    fn should_emit(&mut self, event: &EventMessage) -> bool {
        if event.is_transition() {
            self.last_emission
                .insert(event.vehicle_ref.clone(), event.timestamp);
            return true;
        }

        match self.last_emission.get(&event.vehicle_ref) {
            Some(last) if event.timestamp - last < self.min_interval_seconds => false,
            _ => {
                self.last_emission
                    .insert(event.vehicle_ref.clone(), event.timestamp);
                true
            }
        }
    }
}

/// Publishes per-vehicle differential feeds to the outbound MQTT broker
/// whenever a vehicle event fires, debounced per vehicle.
pub struct FeedPublisher {
    assembler: Arc<FeedAssembler>,
    config: PublisherConfig,
}

impl FeedPublisher {
    pub fn new(assembler: Arc<FeedAssembler>, config: PublisherConfig) -> Self {
        Self { assembler, config }
    }

    fn topic(&self, data_type: &str, vehicle_id: &str) -> String {
        self.config
            .topic_template
            .replace("{dataType}", data_type)
            .replace("{vehicleId}", vehicle_id)
    }

    /// Consumes the event stream until the shutdown signal fires.
    pub async fn run(&self, events: EventStream, mut shutdown: watch::Receiver<bool>) {
        let mut options = MqttOptions::new(
            "avl2gtfsrt-publisher",
            &self.config.host,
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let connection = tokio::spawn(drive_connection(eventloop));

        let mut receiver = events.subscribe();
        let mut gate = DebounceGate::new(PUBLISH_MIN_INTERVAL_SECONDS);

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Ok(event) => {
                            if gate.should_emit(&event) {
                                self.publish_vehicle(&client, &event.vehicle_ref).await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("FeedPublisher: lagging behind, skipped {} events", skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("FeedPublisher: shutting down");
        let _ = client.disconnect().await;
        connection.abort();
    }

    async fn publish_vehicle(&self, client: &AsyncClient, vehicle_ref: &str) {
        let vehicle_positions = match self
            .assembler
            .differential_vehicle_positions(vehicle_ref)
            .await
        {
            Ok(feed) => feed,
            Err(why) => {
                log::error!("FeedPublisher: {}", why);
                return;
            }
        };
        let trip_updates = match self.assembler.differential_trip_updates(vehicle_ref).await {
            Ok(feed) => feed,
            Err(why) => {
                log::error!("FeedPublisher: {}", why);
                return;
            }
        };

        for (data_type, feed) in [
            ("vehicle-positions", vehicle_positions),
            ("trip-updates", trip_updates),
        ] {
            let topic = self.topic(data_type, vehicle_ref);
            if let Err(why) = client
                .publish(&topic, QoS::AtMostOnce, false, feed.encode_to_vec())
                .await
            {
                log::error!("FeedPublisher: failed to publish to {}: {}", topic, why);
            } else {
                log::debug!("FeedPublisher: published {} for vehicle {}", data_type, vehicle_ref);
            }
        }
    }
}

async fn drive_connection(mut eventloop: EventLoop) {
    loop {
        if let Err(why) = eventloop.poll().await {
            log::error!("FeedPublisher: MQTT connection error: {}, reconnecting", why);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iom::events::EventKind;

    fn event(kind: EventKind, vehicle_ref: &str, timestamp: i64) -> EventMessage {
        EventMessage {
            kind,
            vehicle_ref: vehicle_ref.to_owned(),
            timestamp,
        }
    }

    #[test]
    fn position_updates_are_debounced_per_vehicle() {
        let mut gate = DebounceGate::new(5);
        let update = EventKind::GnssPhysicalPositionUpdate;

        assert!(gate.should_emit(&event(update, "bus-1", 100)));
        assert!(!gate.should_emit(&event(update, "bus-1", 102)));
        assert!(gate.should_emit(&event(update, "bus-2", 102)));
        assert!(gate.should_emit(&event(update, "bus-1", 105)));
    }

    #[test]
    fn transitions_bypass_the_debounce_gate() {
        let mut gate = DebounceGate::new(5);

        assert!(gate.should_emit(&event(EventKind::GnssPhysicalPositionUpdate, "bus-1", 100)));
        assert!(gate.should_emit(&event(EventKind::TechnicalVehicleLogOff, "bus-1", 101)));
        assert!(gate.should_emit(&event(EventKind::OperationalVehicleLogOn, "bus-1", 101)));

        // the transition also re-arms the gate for position updates
        assert!(!gate.should_emit(&event(EventKind::GnssPhysicalPositionUpdate, "bus-1", 103)));
    }

    #[test]
    fn topic_template_is_resolved() {
        let config = PublisherConfig {
            host: "localhost".to_owned(),
            port: 1883,
            username: None,
            password: None,
            topic_template: "gtfsrt/{dataType}/{vehicleId}".to_owned(),
        };
        let publisher = FeedPublisher::new(
            Arc::new(FeedAssembler::new(
                Arc::new(storage::MemoryStore::new(storage::GnssWindow::default())),
                chrono_tz::Europe::Berlin,
            )),
            config,
        );

        assert_eq!(
            publisher.topic("trip-updates", "bus-1"),
            "gtfsrt/trip-updates/bus-1"
        );
    }
}

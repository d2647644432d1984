use std::sync::Arc;
use std::time::Duration;
use std::{env, fmt};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;

use crate::correlation::{CorrelationSlot, RequestError};
use crate::dispatcher::{InboundEvent, VehicleDispatcher, VehicleEventHandler};
use crate::handlers::{OutboundPublisher, PublishResult};
use crate::topics::{topic_value, TopicSet};
use crate::vdv435::{parse_message, IomMessage};

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Missing(name) => write!(f, "required environment variable {} is not set", name),
            Self::Invalid(name, value) => {
                write!(f, "environment variable {} has invalid value {}", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct IomConfig {
    pub instance_id: String,
    pub organisation_id: String,
    pub itcs_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl IomConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("A2G_MQTT_HOST").map_err(|_| ConfigError::Missing("A2G_MQTT_HOST"))?;
        let port = match env::var("A2G_MQTT_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid("A2G_MQTT_PORT", value))?,
            Err(_) => 1883,
        };

        Ok(Self {
            instance_id: env::var("A2G_INSTANCE_ID").unwrap_or_else(|_| "avl2gtfsrt".to_owned()),
            organisation_id: env::var("A2G_ORGANISATION_ID").unwrap_or_else(|_| "TEST".to_owned()),
            itcs_id: env::var("A2G_ITCS_ID").unwrap_or_else(|_| "1".to_owned()),
            host,
            port,
            username: env::var("A2G_MQTT_USERNAME").ok(),
            password: env::var("A2G_MQTT_PASSWORD").ok(),
        })
    }
}

fn to_qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Thin wrapper handing publishes to the shared MQTT client.
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl OutboundPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, qos: u8, retain: bool, payload: Vec<u8>) -> PublishResult {
        self.client
            .publish(topic, to_qos(qos), retain, payload)
            .await
            .map_err(|why| Box::new(why) as _)
    }
}

/// Classification of an inbound topic against the subscribed structures.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    ItcsInbox,
    PhysicalPosition,
    Unknown,
}

fn route(topics: &TopicSet, topic: &str) -> Route {
    if topics.sub_itcs_inbox.matches(topic) {
        Route::ItcsInbox
    } else if topics.sub_vehicle_physical_position.matches(topic) {
        Route::PhysicalPosition
    } else {
        Route::Unknown
    }
}

/// The ITCS-side client of the IoM bus: subscribes the inbox and position
/// topics, feeds inbound messages through the per-vehicle dispatcher and
/// correlates outbound requests with their responses.
pub struct IomClient {
    instance_id: String,
    pub topics: TopicSet,
    client: AsyncClient,
    correlation: Arc<CorrelationSlot>,
}

impl IomClient {
    pub fn connect(config: &IomConfig) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(
            format!("avl2gtfsrt-IoM-{}", config.organisation_id),
            &config.host,
            config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        options.set_max_packet_size(1024 * 1024, 1024 * 1024);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        let iom_client = Self {
            instance_id: config.instance_id.clone(),
            topics: TopicSet::new(&config.organisation_id, &config.itcs_id),
            client,
            correlation: Arc::new(CorrelationSlot::default()),
        };

        (iom_client, eventloop)
    }

    /// The outbound side shared with the handlers.
    pub fn publisher(&self) -> Arc<dyn OutboundPublisher> {
        Arc::new(MqttPublisher {
            client: self.client.clone(),
        })
    }

    /// Publishes a request on the ITCS request topic and blocks until the
    /// response with the generated correlation id arrives, or 30 s passed.
    pub async fn request(&self, payload: Vec<u8>) -> Result<Vec<u8>, RequestError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let topic = self
            .topics
            .pub_itcs_inbox
            .resolve(&[("correlation_id", correlation_id.as_str())]);

        if let Err(why) = self
            .client
            .publish(topic.pattern(), to_qos(topic.qos), false, payload)
            .await
        {
            log::error!("{}/IomClient: failed to publish request: {}", self.instance_id, why);
            return Err(RequestError::Cancelled);
        }

        self.correlation.wait_for(&correlation_id).await
    }

    async fn subscribe_all(&self) {
        for topic in self.topics.subscriptions() {
            log::info!(
                "{}/IomClient: subscribing to topic: {}",
                self.instance_id,
                topic.pattern()
            );
            if let Err(why) = self
                .client
                .subscribe(topic.pattern(), to_qos(topic.qos))
                .await
            {
                log::error!("{}/IomClient: failed to subscribe: {}", self.instance_id, why);
            }
        }
    }

    async fn process<H>(&self, dispatcher: &VehicleDispatcher<H>, topic: &str, payload: &[u8])
    where
        H: VehicleEventHandler,
    {
        log::info!(
            "{}/IomClient: received message in topic {}",
            self.instance_id,
            topic
        );

        match route(&self.topics, topic) {
            Route::ItcsInbox => {
                // while a request is in flight, a message on the own inbox
                // may be its response
                if let Some(correlation_id) = topic_value(topic, "CorrelationId") {
                    if topic.ends_with("/ResponseData")
                        && self
                            .correlation
                            .complete(correlation_id, payload.to_vec())
                            .await
                    {
                        return;
                    }
                }

                let message = match parse_message(payload) {
                    Ok(message) => message,
                    Err(why) => {
                        log::error!("{}/IomClient: {}", self.instance_id, why);
                        return;
                    }
                };

                if !message.is_request() {
                    log::error!(
                        "{}/IomClient: message in topic {} is not usable in request/response",
                        self.instance_id,
                        topic
                    );
                    return;
                }

                let vehicle_ref = match message.vehicle_ref() {
                    Some(vehicle_ref) => vehicle_ref.to_owned(),
                    None => {
                        log::error!(
                            "{}/IomClient: request without vehicle ref in topic {}",
                            self.instance_id,
                            topic
                        );
                        return;
                    }
                };

                let event = InboundEvent {
                    topic: topic.to_owned(),
                    data_version: topic_value(topic, "DataVersion").map(str::to_owned),
                    correlation_id: topic_value(topic, "CorrelationId").map(str::to_owned),
                    message,
                };

                dispatcher.dispatch(&vehicle_ref, event).await;
            }
            Route::PhysicalPosition => {
                let message = match parse_message(payload) {
                    Ok(message) => message,
                    Err(why) => {
                        log::error!("{}/IomClient: {}", self.instance_id, why);
                        return;
                    }
                };

                if !matches!(message, IomMessage::GnssPhysicalPositionData(_)) {
                    log::error!(
                        "{}/IomClient: message in topic {} is not usable in pub/sub",
                        self.instance_id,
                        topic
                    );
                    return;
                }

                let vehicle_ref = match topic_value(topic, "Vehicle") {
                    Some(vehicle_ref) => vehicle_ref.to_owned(),
                    None => {
                        log::error!(
                            "{}/IomClient: position update without vehicle level in topic {}",
                            self.instance_id,
                            topic
                        );
                        return;
                    }
                };

                let event = InboundEvent {
                    topic: topic.to_owned(),
                    data_version: topic_value(topic, "DataVersion").map(str::to_owned),
                    correlation_id: None,
                    message,
                };

                dispatcher.dispatch(&vehicle_ref, event).await;
            }
            Route::Unknown => {
                log::debug!(
                    "{}/IomClient: ignoring message in unmatched topic {}",
                    self.instance_id,
                    topic
                );
            }
        }
    }

    /// Drives the MQTT event loop until the shutdown signal fires. New
    /// events stop being accepted on shutdown, queued handlers drain before
    /// the method returns.
    pub async fn run<H>(
        &self,
        mut eventloop: EventLoop,
        dispatcher: VehicleDispatcher<H>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        H: VehicleEventHandler,
    {
        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            self.subscribe_all().await;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.process(&dispatcher, &publish.topic, &publish.payload).await;
                        }
                        Ok(_) => {}
                        Err(why) => {
                            log::error!(
                                "{}/IomClient: MQTT connection error: {}, reconnecting",
                                self.instance_id,
                                why
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("{}/IomClient: shutting down MQTT connection", self.instance_id);
        dispatcher.shutdown();
        dispatcher.drain().await;
        let _ = self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_topics_are_routed_by_structure() {
        let topics = TopicSet::new("VKG", "1");

        assert_eq!(
            route(
                &topics,
                "IoM/1.0/DataVersion/1.2/Inbox/ItcsInbox/Country/de/any/Organisation/VKG/any/ItcsId/1/CorrelationId/7/RequestData"
            ),
            Route::ItcsInbox
        );
        assert_eq!(
            route(
                &topics,
                "IoM/1.0/DataVersion/1.2/Country/de/any/Organisation/VKG/any/Vehicle/bus-1/any/PhysicalPosition/GnssPhysicalPositionData"
            ),
            Route::PhysicalPosition
        );
        assert_eq!(
            route(&topics, "gtfsrt/vehicle-positions/bus-1"),
            Route::Unknown
        );
    }
}

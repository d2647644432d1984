use std::collections::HashMap;
use std::sync::Arc;
use std::{env, error};

use async_trait::async_trait;
use matching::ShapeFilter;
use nominal::NominalClient;
use storage::ObjectStore;
use tokio::sync::Mutex;

use crate::dispatcher::{InboundEvent, VehicleEventHandler};
use crate::events::EventStream;
use crate::topics::TopicSet;
use crate::vdv435::IomMessage;

pub mod logonoff;
pub mod positioning;

/// GNSS samples older than this are discarded as stale.
pub const GNSS_MAX_AGE_SECONDS: i64 = 150;

/// minimum path length for the movement gate.
pub const MOVEMENT_MIN_DISTANCE_METERS: f64 = 50.0;

pub type PublishResult = Result<(), Box<dyn error::Error + Send + Sync>>;

/// Outbound side of the bus, shared between the handlers; publish calls are
/// safe to issue from any worker.
#[async_trait]
pub trait OutboundPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: Vec<u8>,
    ) -> PublishResult;
}

#[derive(Debug, Clone, Copy)]
pub struct MatchingConfig {
    pub max_interval_seconds: i64,
    pub max_failures: u32,
    pub shape_filter: ShapeFilter,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_interval_seconds: 5,
            max_failures: 5,
            shape_filter: ShapeFilter::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => {
            let value = value.to_lowercase();
            value == "true" || value == "1"
        }
        Err(_) => default,
    }
}

impl MatchingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_interval_seconds: env_parse(
                "A2G_MATCHING_MAX_INTERVAL",
                defaults.max_interval_seconds,
            ),
            max_failures: env_parse("A2G_MATCHING_MAX_FAILURES", defaults.max_failures),
            shape_filter: ShapeFilter {
                enabled: env_flag("A2G_SHAPE_FILTER_ENABLED", defaults.shape_filter.enabled),
                distance_meters: env_parse(
                    "A2G_SHAPE_FILTER_DISTANCE_METERS",
                    defaults.shape_filter.distance_meters,
                ),
            },
        }
    }
}

/// Per-vehicle throttle for the matching stage: matching runs only when the
/// newest sample is at least the configured interval newer than the sample
/// that triggered the previous run. Keeps sub-interval publishers from
/// burning CPU on every sample.
pub struct RateGate {
    interval_seconds: i64,
    last_considered: Mutex<HashMap<String, i64>>,
}

impl RateGate {
    pub fn new(interval_seconds: i64) -> Self {
        Self {
            interval_seconds,
            last_considered: Mutex::new(HashMap::new()),
        }
    }

    pub async fn should_run(&self, vehicle_ref: &str, newest_timestamp: i64) -> bool {
        let mut last_considered = self.last_considered.lock().await;
        match last_considered.get(vehicle_ref) {
            Some(last) if newest_timestamp - last < self.interval_seconds => false,
            _ => {
                last_considered.insert(vehicle_ref.to_owned(), newest_timestamp);
                true
            }
        }
    }

    pub async fn forget(&self, vehicle_ref: &str) {
        self.last_considered.lock().await.remove(vehicle_ref);
    }
}

/// Shared collaborators of all message handlers.
pub struct HandlerContext {
    pub storage: Arc<dyn ObjectStore>,
    pub nominal: Arc<NominalClient>,
    pub matching: MatchingConfig,
    pub events: EventStream,
    pub publisher: Arc<dyn OutboundPublisher>,
    pub topics: TopicSet,
}

/// The ITCS-side message processor: routes each inbound event to its
/// handler and publishes the reply for request/response messages.
pub struct IomHandler {
    context: HandlerContext,
    rate_gate: RateGate,
}

impl IomHandler {
    pub fn new(context: HandlerContext) -> Self {
        let rate_gate = RateGate::new(context.matching.max_interval_seconds);
        Self { context, rate_gate }
    }

    async fn respond(&self, event: &InboundEvent, vehicle_ref: &str, payload: String) {
        let correlation_id = match event.correlation_id.as_deref() {
            Some(correlation_id) => correlation_id,
            None => {
                log::error!(
                    "IomHandler: request without correlation id in topic {}, dropping reply",
                    event.topic
                );
                return;
            }
        };
        let data_version = event.data_version.as_deref().unwrap_or("any");

        let topic = self.context.topics.pub_vehicle_inbox.resolve(&[
            ("data_version", data_version),
            ("vehicle_id", vehicle_ref),
            ("correlation_id", correlation_id),
        ]);

        if let Err(why) = self
            .context
            .publisher
            .publish(topic.pattern(), topic.qos, false, payload.into_bytes())
            .await
        {
            log::error!("IomHandler: failed to publish response: {}", why);
        } else {
            log::info!("IomHandler: published response to topic {}", topic.pattern());
        }
    }
}

#[async_trait]
impl VehicleEventHandler for IomHandler {
    async fn handle(&self, vehicle_ref: &str, event: InboundEvent) {
        match &event.message {
            IomMessage::TechnicalVehicleLogOnRequest(_) => {
                match logonoff::handle_log_on(&self.context, vehicle_ref).await {
                    Ok(response) => self.respond(&event, vehicle_ref, response.xml()).await,
                    Err(why) => {
                        log::error!("IomHandler: log-on request for {} failed: {}", vehicle_ref, why)
                    }
                }
            }
            IomMessage::TechnicalVehicleLogOffRequest(_) => {
                match logonoff::handle_log_off(&self.context, vehicle_ref).await {
                    Ok(response) => self.respond(&event, vehicle_ref, response.xml()).await,
                    Err(why) => {
                        log::error!("IomHandler: log-off request for {} failed: {}", vehicle_ref, why)
                    }
                }
            }
            IomMessage::GnssPhysicalPositionData(data) => {
                positioning::handle_position(&self.context, &self.rate_gate, vehicle_ref, data)
                    .await;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_gate_throttles_per_vehicle() {
        let gate = RateGate::new(5);

        assert!(gate.should_run("bus-1", 100).await);
        assert!(!gate.should_run("bus-1", 103).await);
        assert!(gate.should_run("bus-2", 103).await);
        assert!(gate.should_run("bus-1", 105).await);

        gate.forget("bus-1").await;
        assert!(gate.should_run("bus-1", 106).await);
    }
}

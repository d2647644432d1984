pub mod client;
pub mod correlation;
pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod topics;
pub mod vdv435;

pub use client::{ConfigError, IomClient, IomConfig, MqttPublisher};
pub use correlation::{CorrelationSlot, RequestError};
pub use dispatcher::{InboundEvent, VehicleDispatcher, VehicleEventHandler};
pub use events::{EventKind, EventMessage, EventStream};
pub use handlers::{HandlerContext, IomHandler, MatchingConfig, OutboundPublisher};
pub use topics::{topic_value, TopicSet, TopicStructure};

pub mod export;
pub mod json;
pub mod publisher;

pub mod realtime {
    include!(concat!(env!("OUT_DIR"), "/gtfsrt/transit_realtime.rs"));
}

pub use export::FeedAssembler;
pub use publisher::{FeedPublisher, PublisherConfig};

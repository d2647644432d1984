use serde::{Deserialize, Serialize};

pub mod metrics;
pub mod stop;
pub mod trip;
pub mod vehicle;

pub use metrics::{CurrentStopStatus, TripMetrics};
pub use stop::Stop;
pub use trip::{StopTime, Trip, TripDescriptor};
pub use vehicle::{Vehicle, VehicleActivity, VehicleCache};

/// A single GNSS sample as received from the vehicle side.
/// Coordinates are WGS-84 degrees, the timestamp is epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GnssPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

impl GnssPosition {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
        }
    }
}

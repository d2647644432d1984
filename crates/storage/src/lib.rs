use std::{env, error, result};

use async_trait::async_trait;
use model::{Trip, Vehicle, VehicleActivity};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, StoreConnectionInfo};

#[derive(Debug)]
pub enum StoreError {
    IdMissing,
    Other(Box<dyn error::Error + Send + Sync>),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::IdMissing => write!(f, "entity has no id"),
            Self::Other(why) => write!(f, "storage error: {}", why),
        }
    }
}

impl error::Error for StoreError {}

pub type Result<T> = result::Result<T, StoreError>;

/// Durable storage of vehicles and trips. The store owns all persistent
/// entity instances, callers read snapshots and write back complete
/// documents; the vehicle pipeline guarantees there is only one writer per
/// vehicle at a time.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_vehicles(&self) -> Result<Vec<Vehicle>>;
    async fn get_vehicle(&self, vehicle_ref: &str) -> Result<Option<Vehicle>>;
    async fn update_vehicle(&self, vehicle: Vehicle) -> Result<()>;

    /// Removes the trip descriptor, metrics and matching state from the
    /// vehicle's activity. Runs after a differential feed has reported the
    /// trip as deleted.
    async fn cleanup_vehicle_trip_refs(&self, vehicle_ref: &str) -> Result<()>;

    async fn get_trips(&self) -> Result<Vec<Trip>>;
    async fn get_trip(&self, trip_id: &str) -> Result<Option<Trip>>;
    async fn update_trip(&self, trip: Trip) -> Result<()>;
    async fn delete_trip(&self, trip_id: &str) -> Result<()>;

    async fn close(&self);
}

/// Window parameters for the GNSS buffer, applied on every vehicle update.
#[derive(Debug, Clone, Copy)]
pub struct GnssWindow {
    pub data_review_seconds: i64,
    pub max_data_points: usize,
}

impl Default for GnssWindow {
    fn default() -> Self {
        Self {
            data_review_seconds: 120,
            max_data_points: 60,
        }
    }
}

impl GnssWindow {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_review_seconds: env::var("A2G_MATCHING_DATA_REVIEW_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.data_review_seconds),
            max_data_points: env::var("A2G_MATCHING_MAX_DATA_POINTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_data_points),
        }
    }

    /// Drops samples that fell out of the review window and truncates the
    /// buffer to the newest `max_data_points`, keeping the order intact.
    pub fn trim(&self, activity: &mut VehicleActivity, now: i64) {
        activity
            .gnss_positions
            .retain(|position| position.timestamp > now - self.data_review_seconds);

        let len = activity.gnss_positions.len();
        if len > self.max_data_points {
            activity.gnss_positions.drain(..len - self.max_data_points);
        }
    }
}

pub(crate) fn clear_trip_refs(vehicle: &mut Vehicle) {
    if let Some(activity) = vehicle.activity.as_mut() {
        activity.trip_descriptor = None;
        activity.trip_metrics = None;
        activity.trip_candidate_convergence = false;
        activity.trip_candidate_probabilities.clear();
        activity.trip_candidate_failures = 0;
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use model::{Trip, Vehicle};
use tokio::sync::RwLock;

use crate::{clear_trip_refs, GnssWindow, ObjectStore, Result, StoreError};

/// Hash-map-backed store, used by the tests and for broker-less local runs.
#[derive(Default)]
pub struct MemoryStore {
    window: GnssWindow,
    vehicles: RwLock<HashMap<String, Vehicle>>,
    trips: RwLock<HashMap<String, Trip>>,
}

impl MemoryStore {
    pub fn new(window: GnssWindow) -> Self {
        Self {
            window,
            vehicles: RwLock::new(HashMap::new()),
            trips: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_vehicles(&self) -> Result<Vec<Vehicle>> {
        let mut vehicles: Vec<Vehicle> =
            self.vehicles.read().await.values().cloned().collect();
        vehicles.sort_by(|a, b| a.vehicle_ref.cmp(&b.vehicle_ref));
        Ok(vehicles)
    }

    async fn get_vehicle(&self, vehicle_ref: &str) -> Result<Option<Vehicle>> {
        Ok(self.vehicles.read().await.get(vehicle_ref).cloned())
    }

    async fn update_vehicle(&self, mut vehicle: Vehicle) -> Result<()> {
        if let Some(activity) = vehicle.activity.as_mut() {
            self.window.trim(activity, Utc::now().timestamp());
        }
        self.vehicles
            .write()
            .await
            .insert(vehicle.vehicle_ref.clone(), vehicle);
        Ok(())
    }

    async fn cleanup_vehicle_trip_refs(&self, vehicle_ref: &str) -> Result<()> {
        if let Some(vehicle) = self.vehicles.write().await.get_mut(vehicle_ref) {
            clear_trip_refs(vehicle);
        }
        Ok(())
    }

    async fn get_trips(&self) -> Result<Vec<Trip>> {
        let mut trips: Vec<Trip> = self.trips.read().await.values().cloned().collect();
        trips.sort_by(|a, b| a.descriptor.trip_id.cmp(&b.descriptor.trip_id));
        Ok(trips)
    }

    async fn get_trip(&self, trip_id: &str) -> Result<Option<Trip>> {
        Ok(self.trips.read().await.get(trip_id).cloned())
    }

    async fn update_trip(&self, trip: Trip) -> Result<()> {
        let trip_id = trip
            .descriptor
            .trip_id
            .clone()
            .ok_or(StoreError::IdMissing)?;
        self.trips.write().await.insert(trip_id, trip);
        Ok(())
    }

    async fn delete_trip(&self, trip_id: &str) -> Result<()> {
        self.trips.write().await.remove(trip_id);
        Ok(())
    }

    async fn close(&self) {}
}

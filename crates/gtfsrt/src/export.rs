use std::env;
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use model::{CurrentStopStatus, Vehicle};
use storage::{ObjectStore, StoreError};

use crate::realtime::{
    feed_header::Incrementality, trip_update, vehicle_position::VehicleStopStatus, FeedEntity,
    FeedHeader, FeedMessage, Position, TripDescriptor, TripUpdate, VehicleDescriptor,
    VehiclePosition,
};

/// Drops the feed prefix from an id, `feed:trip-1` becomes `trip-1`.
fn strip_feed_id(id: &str) -> String {
    match id.split_once(':') {
        Some((_, rest)) => rest.to_owned(),
        None => id.to_owned(),
    }
}

/// Builds GTFS-Realtime feed messages from the stored vehicle and trip
/// state. Full snapshots serve the HTTP endpoints, differential snapshots
/// are filtered to a single vehicle and expose tombstones; only the
/// differential trip-update path runs the tombstone cleanup.
pub struct FeedAssembler {
    storage: Arc<dyn ObjectStore>,
    timezone: Tz,
}

impl FeedAssembler {
    pub fn new(storage: Arc<dyn ObjectStore>, timezone: Tz) -> Self {
        Self { storage, timezone }
    }

    pub fn from_env(storage: Arc<dyn ObjectStore>) -> Self {
        let timezone = env::var("A2G_SERVER_TIMEZONE")
            .unwrap_or_else(|_| "Europe/Berlin".to_owned())
            .parse()
            .unwrap_or(chrono_tz::Europe::Berlin);
        Self::new(storage, timezone)
    }

    pub async fn full_vehicle_positions(&self) -> Result<FeedMessage, StoreError> {
        let entities = self.extract_vehicle_positions(None).await?;
        Ok(self.create_feed_message(entities, false))
    }

    pub async fn differential_vehicle_positions(
        &self,
        vehicle_id: &str,
    ) -> Result<FeedMessage, StoreError> {
        let entities = self.extract_vehicle_positions(Some(vehicle_id)).await?;
        Ok(self.create_feed_message(entities, true))
    }

    pub async fn full_trip_updates(&self) -> Result<FeedMessage, StoreError> {
        let entities = self.extract_trip_updates(None).await?;
        Ok(self.create_feed_message(entities, false))
    }

    pub async fn differential_trip_updates(
        &self,
        vehicle_id: &str,
    ) -> Result<FeedMessage, StoreError> {
        let entities = self.extract_trip_updates(Some(vehicle_id)).await?;
        Ok(self.create_feed_message(entities, true))
    }

    async fn extract_vehicle_positions(
        &self,
        vehicle_id: Option<&str>,
    ) -> Result<Vec<FeedEntity>, StoreError> {
        let mut entities = Vec::new();

        for vehicle in self.storage.get_vehicles().await? {
            // differential exports bring up only the requested vehicle,
            // full exports skip tombstones and logged-off vehicles
            if let Some(vehicle_id) = vehicle_id {
                if vehicle.vehicle_ref != vehicle_id {
                    continue;
                }
            } else if vehicle.is_differential_deleted || !vehicle.is_technically_logged_on {
                continue;
            }

            let position = match vehicle
                .activity
                .as_ref()
                .and_then(|activity| activity.last_position())
            {
                Some(position) => position,
                None => continue,
            };

            let mut vehicle_position = VehiclePosition {
                timestamp: Some(position.timestamp as u64),
                vehicle: Some(vehicle_descriptor(&vehicle)),
                position: Some(Position {
                    latitude: position.latitude as f32,
                    longitude: position.longitude as f32,
                    ..Default::default()
                }),
                ..Default::default()
            };

            if vehicle.is_operationally_logged_on {
                let activity = vehicle.activity.as_ref();

                if let Some(descriptor) =
                    activity.and_then(|activity| activity.trip_descriptor.as_ref())
                {
                    vehicle_position.trip = Some(trip_descriptor(descriptor));
                }

                if let Some(metrics) =
                    activity.and_then(|activity| activity.trip_metrics.as_ref())
                {
                    vehicle_position.current_stop_sequence = metrics.next_stop_sequence;
                    vehicle_position.set_current_status(stop_status(metrics.current_stop_status));
                    vehicle_position.stop_id =
                        metrics.next_stop_id.as_deref().map(strip_feed_id);
                }
            }

            entities.push(FeedEntity {
                id: vehicle.vehicle_ref.clone(),
                is_deleted: Some(vehicle.is_differential_deleted),
                vehicle: Some(vehicle_position),
                trip_update: None,
            });
        }

        Ok(entities)
    }

    async fn extract_trip_updates(
        &self,
        vehicle_id: Option<&str>,
    ) -> Result<Vec<FeedEntity>, StoreError> {
        let mut entities = Vec::new();

        for vehicle in self.storage.get_vehicles().await? {
            if let Some(vehicle_id) = vehicle_id {
                if vehicle.vehicle_ref != vehicle_id {
                    continue;
                }
            } else if !vehicle.is_technically_logged_on
                || !vehicle.is_operationally_logged_on
                || vehicle
                    .activity
                    .as_ref()
                    .map_or(true, |activity| activity.trip_metrics.is_none())
            {
                continue;
            }

            let descriptor = match vehicle
                .activity
                .as_ref()
                .and_then(|activity| activity.trip_descriptor.as_ref())
            {
                Some(descriptor) => descriptor,
                None => continue,
            };
            let trip_id = match descriptor.trip_id.as_deref() {
                Some(trip_id) => trip_id,
                None => continue,
            };

            let trip = match self.storage.get_trip(trip_id).await? {
                Some(trip) => trip,
                None => continue,
            };

            let timestamp = vehicle
                .activity
                .as_ref()
                .and_then(|activity| activity.last_position())
                .map(|position| position.timestamp)
                .unwrap_or_else(|| Utc::now().timestamp());

            let mut trip_update = TripUpdate {
                trip: trip_descriptor(&trip.descriptor),
                vehicle: Some(vehicle_descriptor(&vehicle)),
                timestamp: Some(timestamp as u64),
                ..Default::default()
            };

            // tombstoned trips are reported bare, the deletion flag is all
            // the consumer needs
            if !trip.is_differential_deleted {
                let metrics = vehicle
                    .activity
                    .as_ref()
                    .and_then(|activity| activity.trip_metrics.as_ref());

                if let Some(metrics) = metrics {
                    let next_stop_sequence = metrics.next_stop_sequence.unwrap_or(0);
                    let mut current_delay = metrics.current_delay;

                    for stop_time in &trip.stop_times {
                        if stop_time.stop_sequence < next_stop_sequence {
                            continue;
                        }

                        let waiting_time = stop_time.waiting_time();
                        let (arrival_delay, departure_delay) =
                            propagate_delay(&mut current_delay, waiting_time);

                        trip_update.stop_time_update.push(trip_update::StopTimeUpdate {
                            stop_id: Some(strip_feed_id(&stop_time.stop.stop_id)),
                            arrival: Some(trip_update::StopTimeEvent {
                                time: Some(stop_time.arrival_timestamp + arrival_delay),
                                delay: Some(arrival_delay as i32),
                                ..Default::default()
                            }),
                            departure: Some(trip_update::StopTimeEvent {
                                time: Some(stop_time.departure_timestamp + departure_delay),
                                delay: Some(departure_delay as i32),
                                ..Default::default()
                            }),
                            ..Default::default()
                        });
                    }
                }
            }

            entities.push(FeedEntity {
                id: strip_feed_id(trip_id),
                is_deleted: Some(trip.is_differential_deleted),
                trip_update: Some(trip_update),
                vehicle: None,
            });

            // after reporting the deletion once, drop the trip and the
            // vehicle's references to it
            if vehicle_id.is_some() && trip.is_differential_deleted {
                self.storage
                    .cleanup_vehicle_trip_refs(&vehicle.vehicle_ref)
                    .await?;
                self.storage.delete_trip(trip_id).await?;
            }
        }

        Ok(entities)
    }

    fn create_feed_message(&self, entities: Vec<FeedEntity>, differential: bool) -> FeedMessage {
        let timestamp = Utc::now().with_timezone(&self.timezone).timestamp();

        let mut header = FeedHeader {
            gtfs_realtime_version: "2.0".to_owned(),
            timestamp: Some(timestamp as u64),
            ..Default::default()
        };
        header.set_incrementality(if differential {
            Incrementality::Differential
        } else {
            Incrementality::FullDataset
        });

        FeedMessage {
            header,
            entity: entities,
        }
    }
}

/// One step of the delay propagation along the upcoming stops. Scheduled
/// waiting time at a stop absorbs delay (a late vehicle shortens its dwell)
/// or earliness (an early vehicle waits for its scheduled departure).
fn propagate_delay(current_delay: &mut i64, waiting_time: i64) -> (i64, i64) {
    if *current_delay < 0 {
        let arrival_delay = *current_delay;
        let departure_delay = if waiting_time > 0 {
            *current_delay = 0;
            0
        } else {
            *current_delay
        };
        (arrival_delay, departure_delay)
    } else if *current_delay > 0 {
        let arrival_delay = *current_delay;
        let departure_delay =
            (*current_delay - waiting_time).clamp(0.min(*current_delay), *current_delay);
        *current_delay = departure_delay;
        (arrival_delay, departure_delay)
    } else {
        (0, 0)
    }
}

fn vehicle_descriptor(vehicle: &Vehicle) -> VehicleDescriptor {
    VehicleDescriptor {
        id: Some(vehicle.vehicle_ref.clone()),
        label: Some(vehicle.vehicle_ref.clone()),
        license_plate: Some(vehicle.vehicle_ref.clone()),
    }
}

fn trip_descriptor(descriptor: &model::TripDescriptor) -> TripDescriptor {
    TripDescriptor {
        trip_id: descriptor.trip_id.as_deref().map(strip_feed_id),
        route_id: descriptor.route_id.as_deref().map(strip_feed_id),
        start_time: descriptor.start_time.clone(),
        start_date: descriptor.start_date.clone(),
        ..Default::default()
    }
}

fn stop_status(status: CurrentStopStatus) -> VehicleStopStatus {
    match status {
        CurrentStopStatus::InTransitTo => VehicleStopStatus::InTransitTo,
        CurrentStopStatus::IncomingAt => VehicleStopStatus::IncomingAt,
        CurrentStopStatus::StoppedAt => VehicleStopStatus::StoppedAt,
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metrics::TripMetrics;
use crate::trip::{Trip, TripDescriptor};
use crate::GnssPosition;

/// A vehicle known to the converter. Created on the first technical log-on
/// and kept across log-offs, so the differential feed can report the
/// deletion before the record is reset by the next log-on.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub vehicle_ref: String,

    #[serde(default)]
    pub is_technically_logged_on: bool,

    #[serde(default)]
    pub is_operationally_logged_on: bool,

    /// tombstone flag, cleared again on the next technical log-on.
    #[serde(default)]
    pub is_differential_deleted: bool,

    pub activity: Option<VehicleActivity>,
    pub cache: Option<VehicleCache>,
}

impl Vehicle {
    pub fn new(vehicle_ref: impl Into<String>) -> Self {
        Self {
            vehicle_ref: vehicle_ref.into(),
            is_technically_logged_on: false,
            is_operationally_logged_on: false,
            is_differential_deleted: false,
            activity: None,
            cache: None,
        }
    }

    /// trip id the vehicle is currently operationally logged on to, if any.
    pub fn current_trip_id(&self) -> Option<&str> {
        self.activity
            .as_ref()
            .and_then(|activity| activity.trip_descriptor.as_ref())
            .and_then(|descriptor| descriptor.trip_id.as_deref())
    }
}

/// Live matching state of a technically logged-on vehicle. Reset on every
/// technical transition.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleActivity {
    /// windowed GNSS buffer, oldest first. the store trims this on every
    /// vehicle update.
    #[serde(default)]
    pub gnss_positions: Vec<GnssPosition>,

    #[serde(default)]
    pub trip_candidate_convergence: bool,

    /// posterior vectors per candidate trip id, appended on every matching
    /// round. BTreeMap keeps the key order deterministic for the pairing
    /// step of the Bayesian update.
    #[serde(default)]
    pub trip_candidate_probabilities: BTreeMap<String, Vec<f64>>,

    #[serde(default)]
    pub trip_candidate_failures: u32,

    pub trip_descriptor: Option<TripDescriptor>,
    pub trip_metrics: Option<TripMetrics>,
}

impl VehicleActivity {
    pub fn last_position(&self) -> Option<&GnssPosition> {
        self.gnss_positions.last()
    }
}

/// Last known candidate set, kept as an opaque fallback for rounds where the
/// schedule source is unreachable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleCache {
    #[serde(default)]
    pub trip_candidates: Vec<Trip>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CurrentStopStatus;
    use crate::stop::Stop;
    use crate::trip::StopTime;

    fn sample_vehicle() -> Vehicle {
        let mut activity = VehicleActivity::default();
        activity.gnss_positions.push(GnssPosition::new(54.3, 10.1, 1_700_000_000));
        activity.gnss_positions.push(GnssPosition::new(54.31, 10.11, 1_700_000_010));
        activity
            .trip_candidate_probabilities
            .insert("trip-1".to_owned(), vec![0.4, 0.7, 0.95]);
        activity.trip_descriptor = Some(TripDescriptor {
            trip_id: Some("trip-1".to_owned()),
            route_id: Some("line-23".to_owned()),
            start_date: Some("20240705".to_owned()),
            start_time: Some("25:15:00".to_owned()),
            ..Default::default()
        });
        activity.trip_metrics = Some(TripMetrics {
            next_stop_sequence: Some(3),
            next_stop_id: Some("stop-3".to_owned()),
            current_stop_status: CurrentStopStatus::IncomingAt,
            current_delay: 120,
            ..Default::default()
        });

        Vehicle {
            vehicle_ref: "bus-4711".to_owned(),
            is_technically_logged_on: true,
            is_operationally_logged_on: true,
            is_differential_deleted: false,
            activity: Some(activity),
            cache: Some(VehicleCache {
                trip_candidates: vec![Trip {
                    descriptor: TripDescriptor {
                        trip_id: Some("trip-1".to_owned()),
                        ..Default::default()
                    },
                    stop_times: vec![
                        StopTime {
                            stop_sequence: 0,
                            arrival_timestamp: 1_700_000_000,
                            departure_timestamp: 1_700_000_060,
                            stop: Stop {
                                stop_id: "stop-0".to_owned(),
                                latitude: 54.3,
                                longitude: 10.1,
                                name: Some("Hauptbahnhof".to_owned()),
                            },
                        },
                        StopTime {
                            stop_sequence: 1,
                            arrival_timestamp: 1_700_000_300,
                            departure_timestamp: 1_700_000_300,
                            stop: Stop {
                                stop_id: "stop-1".to_owned(),
                                latitude: 54.32,
                                longitude: 10.13,
                                name: None,
                            },
                        },
                    ],
                    shape_polyline: "_p~iF~ps|U_ulLnnqC".to_owned(),
                    is_differential_deleted: false,
                }],
            }),
        }
    }

    #[test]
    fn vehicle_round_trips_through_json() {
        let vehicle = sample_vehicle();
        let json = serde_json::to_string(&vehicle).unwrap();
        let restored: Vehicle = serde_json::from_str(&json).unwrap();
        assert_eq!(vehicle, restored);

        // a second serialization must be byte-equal, the store relies on
        // stable documents
        let json_again = serde_json::to_string(&restored).unwrap();
        assert_eq!(json, json_again);
    }

    #[test]
    fn unknown_fields_are_ignored_on_load() {
        let json = r#"{
            "vehicle_ref": "bus-1",
            "is_technically_logged_on": true,
            "legacy_field": 42
        }"#;
        let vehicle: Vehicle = serde_json::from_str(json).unwrap();
        assert_eq!(vehicle.vehicle_ref, "bus-1");
        assert!(vehicle.is_technically_logged_on);
        assert!(vehicle.activity.is_none());
    }

    #[test]
    fn current_trip_id_reads_through_descriptor() {
        let vehicle = sample_vehicle();
        assert_eq!(vehicle.current_trip_id(), Some("trip-1"));
        assert_eq!(Vehicle::new("bus-2").current_trip_id(), None);
    }

    #[test]
    fn stop_status_uses_feed_vocabulary() {
        let json = serde_json::to_string(&CurrentStopStatus::InTransitTo).unwrap();
        assert_eq!(json, "\"IN_TRANSIT_TO\"");
        let status: CurrentStopStatus = serde_json::from_str("\"STOPPED_AT\"").unwrap();
        assert_eq!(status, CurrentStopStatus::StoppedAt);
    }
}

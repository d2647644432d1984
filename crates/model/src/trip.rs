use serde::{Deserialize, Serialize};

use crate::stop::Stop;

/// Identity of a nominal trip the way it is reported downstream.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripDescriptor {
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<String>,

    /// operating day as `YYYYMMDD`. the operating day may end past midnight,
    /// so this is not necessarily the calendar date of the sample.
    pub start_date: Option<String>,

    /// time since operating-day midnight as `HH:MM:SS`. values greater
    /// than 24:00:00 are allowed to represent a time at the next day.
    pub start_time: Option<String>,

    pub schedule_relationship: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTime {
    pub stop_sequence: u32,
    pub arrival_timestamp: i64,
    pub departure_timestamp: i64,
    pub stop: Stop,
}

impl StopTime {
    /// dwell time scheduled at this stop in seconds.
    pub fn waiting_time(&self) -> i64 {
        self.departure_timestamp - self.arrival_timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub descriptor: TripDescriptor,
    pub stop_times: Vec<StopTime>,
    pub shape_polyline: String,

    /// tombstone set on operational log-off. the trip stays around until the
    /// differential feed has reported it as deleted once.
    #[serde(default)]
    pub is_differential_deleted: bool,
}

impl Trip {
    pub fn trip_id(&self) -> Option<&str> {
        self.descriptor.trip_id.as_deref()
    }
}

use serde::{Deserialize, Serialize};

/// Relation of the vehicle to its next stop, using the GTFS-Realtime
/// vocabulary so the value can be passed through to the feed unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurrentStopStatus {
    InTransitTo,
    IncomingAt,
    StoppedAt,
}

impl Default for CurrentStopStatus {
    fn default() -> Self {
        Self::InTransitTo
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripMetrics {
    pub current_stop_sequence: Option<u32>,
    pub current_stop_id: Option<String>,
    pub next_stop_sequence: Option<u32>,
    pub next_stop_id: Option<String>,

    #[serde(default)]
    pub current_stop_status: CurrentStopStatus,

    /// true once the stop the vehicle is heading to (or standing at) is the
    /// last stop of the trip. used to detect the natural end of a trip.
    #[serde(default)]
    pub current_stop_is_final: bool,

    /// deviation from schedule in seconds, positive when running late.
    #[serde(default)]
    pub current_delay: i64,
}

use chrono::{DateTime, Duration, Utc};
use model::{Stop, StopTime, Trip, TripDescriptor};
use serde::Deserialize;
use serde_json::json;
use utility::time::{format_operating_day, operating_day, operating_day_time};

use crate::{AdapterError, NominalAdapter, OperatingDayConfig, Result};

/// maximum number of candidates returned per query.
const MAX_TRIP_CANDIDATES: usize = 20;

/// look-back window absorbing clock skew and early departures.
const LOOK_BACK_MINUTES: i64 = 15;

const TRIP_CANDIDATES_QUERY: &str = r#"
query TripCandidates($lat: Float!, $lon: Float!, $startTime: DateTime!) {
  nearest(latitude: $lat, longitude: $lon, maximumDistance: 200, filterByPlaceTypes: stopPlace) {
    edges {
      node {
        distance,
        place {
          ... on StopPlace {
            id,
            estimatedCalls(startTime: $startTime, numberOfDepartures: 20) {
              date
              serviceJourney {
                id,
                journeyPattern {
                  line {
                    id
                  }
                }
                pointsOnLink {
                  points
                }
                estimatedCalls {
                  aimedArrivalTime
                  aimedDepartureTime
                  stopPositionInPattern
                  quay {
                    id
                    name
                    latitude
                    longitude
                  }
                }
              }
            }
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct OtpConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Nominal adapter against an OpenTripPlanner transmodel GraphQL endpoint.
pub struct OtpAdapter {
    config: OtpConfig,
    operating_day: OperatingDayConfig,
    client: reqwest::Client,
}

impl OtpAdapter {
    pub fn new(config: OtpConfig, operating_day: OperatingDayConfig) -> Self {
        Self {
            config,
            operating_day,
            client: reqwest::Client::new(),
        }
    }

    async fn request(&self, variables: serde_json::Value) -> Result<OtpResponse> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .json(&json!({
                "query": TRIP_CANDIDATES_QUERY,
                "variables": variables,
            }));

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(AdapterError::Request)?
            .error_for_status()
            .map_err(AdapterError::Request)?;

        response.json().await.map_err(AdapterError::Request)
    }
}

#[async_trait::async_trait]
impl NominalAdapter for OtpAdapter {
    async fn get_trip_candidates(&self, latitude: f64, longitude: f64) -> Result<Vec<Trip>> {
        let reference_timestamp = Utc::now() - Duration::minutes(LOOK_BACK_MINUTES);

        let variables = json!({
            "lat": latitude,
            "lon": longitude,
            "startTime": reference_timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        });

        let response = self.request(variables).await?;

        let estimated_calls = response
            .data
            .and_then(|data| data.nearest)
            .map(|nearest| nearest.edges)
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|edge| edge.node.place)
            .map(|place| place.estimated_calls)
            .unwrap_or_default();

        Ok(materialize_candidates(estimated_calls, self.operating_day))
    }
}

/// Builds complete trips from the departures of the nearest stop place.
/// Candidates without a shape or without stop times are dropped, duplicate
/// service journeys collapse to one candidate.
pub(crate) fn materialize_candidates(
    estimated_calls: Vec<StopPlaceCall>,
    operating_day_config: OperatingDayConfig,
) -> Vec<Trip> {
    let mut candidates: Vec<Trip> = Vec::new();

    for call in estimated_calls {
        if candidates.len() >= MAX_TRIP_CANDIDATES {
            break;
        }

        let journey = call.service_journey;

        if candidates
            .iter()
            .any(|candidate| candidate.trip_id() == Some(journey.id.as_str()))
        {
            continue;
        }

        let shape_polyline = match journey.points_on_link.as_ref() {
            Some(points_on_link) if !points_on_link.points.is_empty() => {
                points_on_link.points.clone()
            }
            _ => {
                log::debug!(
                    "OtpAdapter: dropping candidate {} without shape geometry",
                    journey.id
                );
                continue;
            }
        };

        let mut stop_times: Vec<StopTime> = Vec::new();
        for journey_call in &journey.estimated_calls {
            let arrival = journey_call
                .aimed_arrival_time
                .as_deref()
                .or(journey_call.aimed_departure_time.as_deref());
            let departure = journey_call
                .aimed_departure_time
                .as_deref()
                .or(journey_call.aimed_arrival_time.as_deref());

            let (arrival, departure) = match (
                arrival.and_then(parse_timestamp),
                departure.and_then(parse_timestamp),
            ) {
                (Some(arrival), Some(departure)) => (arrival, departure),
                _ => {
                    stop_times.clear();
                    break;
                }
            };

            stop_times.push(StopTime {
                stop_sequence: journey_call.stop_position_in_pattern,
                arrival_timestamp: arrival.timestamp(),
                departure_timestamp: departure.timestamp(),
                stop: Stop {
                    stop_id: journey_call.quay.id.clone(),
                    latitude: journey_call.quay.latitude,
                    longitude: journey_call.quay.longitude,
                    name: journey_call.quay.name.clone(),
                },
            });
        }

        if stop_times.len() < 2 {
            log::debug!(
                "OtpAdapter: dropping candidate {} without usable stop times",
                journey.id
            );
            continue;
        }

        let first_departure =
            DateTime::from_timestamp(stop_times[0].departure_timestamp, 0).unwrap_or_default();
        let local_departure = first_departure.with_timezone(&operating_day_config.timezone);
        let day = operating_day(local_departure, operating_day_config.day_end_seconds);

        let descriptor = TripDescriptor {
            trip_id: Some(journey.id.clone()),
            route_id: journey.journey_pattern.as_ref().map(|p| p.line.id.clone()),
            start_date: Some(format_operating_day(day)),
            start_time: Some(operating_day_time(
                first_departure,
                day,
                operating_day_config.timezone,
            )),
            ..Default::default()
        };

        candidates.push(Trip {
            descriptor,
            stop_times,
            shape_polyline,
            is_differential_deleted: false,
        });
    }

    candidates
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

// - transmodel response model -

#[derive(Debug, Deserialize)]
pub(crate) struct OtpResponse {
    pub data: Option<OtpData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OtpData {
    pub nearest: Option<Nearest>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Nearest {
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Edge {
    pub node: Node,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Node {
    pub place: Option<Place>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Place {
    #[serde(default)]
    pub estimated_calls: Vec<StopPlaceCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StopPlaceCall {
    pub service_journey: ServiceJourney,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServiceJourney {
    pub id: String,
    pub journey_pattern: Option<JourneyPattern>,
    pub points_on_link: Option<PointsOnLink>,
    #[serde(default)]
    pub estimated_calls: Vec<JourneyCall>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JourneyPattern {
    pub line: Line,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Line {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PointsOnLink {
    pub points: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JourneyCall {
    pub aimed_arrival_time: Option<String>,
    pub aimed_departure_time: Option<String>,
    pub stop_position_in_pattern: u32,
    pub quay: Quay,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Quay {
    pub id: String,
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

use std::collections::BTreeMap;

use model::{GnssPosition, Trip, TripMetrics, Vehicle};
use utility::geo::{web_mercator, wgs_84, ShapeLine};

use crate::bayes::bayesian_update;
use crate::spatial::SpatialMatch;
use crate::temporal::TemporalMatch;
use crate::vector::SpatialVectorCollection;

#[derive(Debug, Clone, Copy)]
pub struct ShapeFilter {
    pub enabled: bool,
    pub distance_meters: f64,
}

impl Default for ShapeFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_meters: 50.0,
        }
    }
}

/// Matches the AVL data of one vehicle against a set of nominal trip
/// candidates: spatial and temporal scoring per candidate, merged over
/// successive rounds by the Bayesian update until one candidate converges.
pub struct AvlMatcher<'a> {
    trip_candidates: &'a [Trip],
    shape_filter: ShapeFilter,

    /// set by `verify` when shape-snap filtering applies: the last GNSS
    /// position moved onto the trip shape, for the caller to substitute.
    pub matched_vehicle_position: Option<GnssPosition>,
}

impl<'a> AvlMatcher<'a> {
    pub fn new(trip_candidates: &'a [Trip], shape_filter: ShapeFilter) -> Self {
        Self {
            trip_candidates,
            shape_filter,
            matched_vehicle_position: None,
        }
    }

    /// One matching round for a vehicle that is not operationally logged on
    /// yet. Returns the convergence flag and the updated posterior vectors;
    /// `(false, empty)` means every candidate was discarded this round.
    pub fn match_candidates(
        &self,
        vehicle: &Vehicle,
        all_vehicles: &[Vehicle],
        gnss_positions: &[GnssPosition],
        prior: &BTreeMap<String, Vec<f64>>,
        now: i64,
    ) -> (bool, BTreeMap<String, Vec<f64>>) {
        if self.trip_candidates.is_empty() {
            log::warn!(
                "AvlMatcher: no trip candidates available to match AVL data for vehicle {}",
                vehicle.vehicle_ref
            );
            return (false, prior.clone());
        }

        let movement = match SpatialVectorCollection::new(gnss_positions) {
            Some(movement) => movement,
            None => {
                log::warn!(
                    "AvlMatcher: no AVL data for vehicle {}",
                    vehicle.vehicle_ref
                );
                return (false, prior.clone());
            }
        };

        log::info!(
            "AvlMatcher: matching AVL data for vehicle {} with {} possible trip candidates",
            vehicle.vehicle_ref,
            self.trip_candidates.len()
        );

        let mut trip_candidate_scores: BTreeMap<String, f64> = BTreeMap::new();
        for trip_candidate in self.trip_candidates {
            let trip_id = match trip_candidate.trip_id() {
                Some(trip_id) => trip_id,
                None => continue,
            };

            // skip the resource-consuming matching when another vehicle has
            // already logged on to this trip
            let taken = all_vehicles.iter().any(|other| {
                other.vehicle_ref != vehicle.vehicle_ref
                    && other.current_trip_id() == Some(trip_id)
            });
            if taken {
                continue;
            }

            let trip_shape = match ShapeLine::from_polyline(&trip_candidate.shape_polyline) {
                Ok(shape) => shape,
                Err(why) => {
                    log::warn!("AvlMatcher: dropping trip candidate {}: {}", trip_id, why);
                    continue;
                }
            };

            // 1. step: spatial matching
            let mut spatial_match = SpatialMatch::new(&trip_shape);
            let spatial_match_score = spatial_match.calculate_match_score(&movement);
            if spatial_match_score == 0.0 {
                continue;
            }

            // 2. step: temporal matching
            let mut temporal_match =
                TemporalMatch::new(&trip_candidate.stop_times, &trip_shape, now);
            let temporal_match_score =
                temporal_match.calculate_match_score(spatial_match.spatial_progress_percentage);
            if temporal_match_score == 0.0 {
                continue;
            }

            trip_candidate_scores
                .insert(trip_id.to_owned(), spatial_match_score * temporal_match_score);
        }

        if trip_candidate_scores.is_empty() {
            log::warn!(
                "AvlMatcher: all trip candidates have been discarded due to logical or spatial, temporal mismatch"
            );
            return (false, BTreeMap::new());
        }

        let (convergence, probabilities) = bayesian_update(prior, &trip_candidate_scores, 1.0);

        for (trip_id, vector) in &probabilities {
            log::info!(
                "AvlMatcher: matched [TripID] {} [Score] {:.4} [Convergence] {}",
                trip_id,
                vector.last().copied().unwrap_or(0.0),
                convergence
            );
        }

        (convergence, probabilities)
    }

    /// Spatial-only verification of the single current trip while the
    /// vehicle is operationally logged on.
    pub fn verify(&mut self, vehicle: &Vehicle, gnss_positions: &[GnssPosition]) -> bool {
        self.matched_vehicle_position = None;

        let trip_candidate = match self.trip_candidates.first() {
            Some(trip) => trip,
            None => {
                log::warn!(
                    "AvlMatcher: no trip candidates available to test AVL data for vehicle {}",
                    vehicle.vehicle_ref
                );
                return false;
            }
        };

        let movement = match SpatialVectorCollection::new(gnss_positions) {
            Some(movement) => movement,
            None => {
                log::warn!(
                    "AvlMatcher: no AVL data for vehicle {}",
                    vehicle.vehicle_ref
                );
                return false;
            }
        };

        let trip_shape = match ShapeLine::from_polyline(&trip_candidate.shape_polyline) {
            Ok(shape) => shape,
            Err(why) => {
                log::warn!("AvlMatcher: cannot test against current trip: {}", why);
                return false;
            }
        };

        let mut spatial_match = SpatialMatch::new(&trip_shape);
        let trip_matching = spatial_match.calculate_match_score(&movement) != 0.0;

        let last_position = gnss_positions.last().unwrap();
        if self.shape_filter.enabled {
            let coord = web_mercator(last_position.latitude, last_position.longitude);
            let shape_distance = trip_shape.distance(coord);

            if shape_distance < self.shape_filter.distance_meters {
                let snapped = trip_shape.interpolate(spatial_match.spatial_progress_distance);
                let (latitude, longitude) = wgs_84(snapped);

                self.matched_vehicle_position = Some(GnssPosition::new(
                    latitude,
                    longitude,
                    last_position.timestamp,
                ));

                log::info!(
                    "AvlMatcher: filtered AVL position for vehicle {} to {}, {} on trip {}",
                    vehicle.vehicle_ref,
                    latitude,
                    longitude,
                    trip_candidate.trip_id().unwrap_or("<unknown>")
                );
            }
        } else {
            self.matched_vehicle_position = Some(last_position.clone());
        }

        trip_matching
    }

    /// Trip metrics for a known trip and the latest position.
    pub fn predict_trip_metrics(
        trip: &Trip,
        position: &GnssPosition,
        now: i64,
    ) -> Option<TripMetrics> {
        let trip_shape = match ShapeLine::from_polyline(&trip.shape_polyline) {
            Ok(shape) => shape,
            Err(why) => {
                log::warn!(
                    "AvlMatcher: cannot predict trip metrics for trip {}: {}",
                    trip.trip_id().unwrap_or("<unknown>"),
                    why
                );
                return None;
            }
        };

        let temporal_match = TemporalMatch::new(&trip.stop_times, &trip_shape, now);
        Some(temporal_match.predict_trip_metrics(position, now))
    }
}

use utility::geo::{web_mercator, ShapeLine};

use crate::vector::SpatialVectorCollection;

pub const TRIP_SHAPE_BUFFER_SIZE: f64 = 30.0;
pub const TRIP_SHAPE_MATCHING_RATIO: f64 = 0.60;
pub const TRIP_SHAPE_FORWARD_MOVEMENT_RATIO: f64 = 0.75;

/// Scores how well a movement matches a trip shape. The score combines the
/// share of samples within the buffered shape with the share of forward
/// movement along it; either gate failing discards the candidate.
pub struct SpatialMatch<'a> {
    trip_shape: &'a ShapeLine,

    pub match_score: f64,
    pub spatial_progress_percentage: f64,

    /// arc length of the last sample's projection in meters, used to snap
    /// positions onto the shape.
    pub spatial_progress_distance: f64,
}

impl<'a> SpatialMatch<'a> {
    pub fn new(trip_shape: &'a ShapeLine) -> Self {
        Self {
            trip_shape,
            match_score: 0.0,
            spatial_progress_percentage: 0.0,
            spatial_progress_distance: 0.0,
        }
    }

    pub fn calculate_match_score(&mut self, vehicle_activity: &SpatialVectorCollection) -> f64 {
        let activity_coords: Vec<_> = vehicle_activity
            .positions()
            .iter()
            .map(|p| web_mercator(p.latitude, p.longitude))
            .collect();

        // percentual progress of the trip determined by the latest position
        let last_coord = *activity_coords.last().unwrap();
        self.spatial_progress_distance = self.trip_shape.project(last_coord);
        self.spatial_progress_percentage = if self.trip_shape.length() > 0.0 {
            self.spatial_progress_distance / self.trip_shape.length() * 100.0
        } else {
            0.0
        };

        // check if the GNSS coordinate activity matches the trip candidate
        let num_points_matching = activity_coords
            .iter()
            .filter(|c| self.trip_shape.distance(**c) <= TRIP_SHAPE_BUFFER_SIZE)
            .count();
        let num_points_total = activity_coords.len();

        let match_ratio = if num_points_total > 0 {
            num_points_matching as f64 / num_points_total as f64
        } else {
            0.0
        };
        if match_ratio < TRIP_SHAPE_MATCHING_RATIO {
            log::debug!("SpatialMatch: vehicle activity does not match the trip geometry");
            return 0.0;
        }

        // a certain proportion of the activity must move forward along the
        // trip shape
        let activity_projections: Vec<f64> = activity_coords
            .iter()
            .map(|c| self.trip_shape.project(*c))
            .collect();

        let num_forward_movements = activity_projections
            .windows(2)
            .filter(|pair| pair[0] < pair[1])
            .count();
        let num_backward_movements = activity_projections
            .windows(2)
            .filter(|pair| pair[0] > pair[1])
            .count();

        let forward_movement_ratio = if num_backward_movements > 0 {
            (num_forward_movements as f64 / num_backward_movements as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        if forward_movement_ratio < TRIP_SHAPE_FORWARD_MOVEMENT_RATIO {
            log::debug!("SpatialMatch: vehicle activity does not move forward along the trip geometry");
            return 0.0;
        }

        self.match_score = match_ratio * forward_movement_ratio;

        log::debug!(
            "SpatialMatch: matched trip geometry with score {:.2}, spatial progress {:.2}%",
            self.match_score,
            self.spatial_progress_percentage
        );

        self.match_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::GnssPosition;

    // straight shape heading east along latitude 54.0 for ~1.3 km
    fn shape() -> ShapeLine {
        let coords: Vec<(f64, f64)> = (0..=20).map(|i| (54.0, 10.0 + i as f64 * 0.001)).collect();
        let line = geo_types::LineString::from(
            coords.iter().map(|(lat, lon)| (*lon, *lat)).collect::<Vec<_>>(),
        );
        let encoded = polyline::encode_coordinates(line, 5).unwrap();
        ShapeLine::from_polyline(&encoded).unwrap()
    }

    fn forward_positions() -> Vec<GnssPosition> {
        vec![
            GnssPosition::new(54.0, 10.002, 0),
            GnssPosition::new(54.0, 10.004, 10),
            GnssPosition::new(54.0, 10.006, 20),
        ]
    }

    #[test]
    fn forward_movement_along_the_shape_scores_high() {
        let shape = shape();
        let movement = SpatialVectorCollection::new(&forward_positions()).unwrap();
        let mut spatial = SpatialMatch::new(&shape);

        let score = spatial.calculate_match_score(&movement);
        assert!((score - 1.0).abs() < 1e-9);
        assert!(spatial.spatial_progress_percentage > 0.0);
        assert!(spatial.spatial_progress_percentage < 100.0);
    }

    #[test]
    fn reversed_movement_is_rejected() {
        let shape = shape();
        let mut positions = forward_positions();
        positions.reverse();
        let movement = SpatialVectorCollection::new(&positions).unwrap();

        let score = SpatialMatch::new(&shape).calculate_match_score(&movement);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn movement_off_the_shape_is_rejected() {
        let shape = shape();
        // parallel street, roughly 550 m south of the shape
        let positions = vec![
            GnssPosition::new(53.995, 10.002, 0),
            GnssPosition::new(53.995, 10.004, 10),
            GnssPosition::new(53.995, 10.006, 20),
        ];
        let movement = SpatialVectorCollection::new(&positions).unwrap();

        let score = SpatialMatch::new(&shape).calculate_match_score(&movement);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn progress_is_reported_even_for_rejected_candidates() {
        let shape = shape();
        let mut positions = forward_positions();
        positions.reverse();
        let movement = SpatialVectorCollection::new(&positions).unwrap();
        let mut spatial = SpatialMatch::new(&shape);

        spatial.calculate_match_score(&movement);
        assert!(spatial.spatial_progress_percentage > 0.0);
    }
}

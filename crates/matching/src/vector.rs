use model::GnssPosition;
use utility::geo::{bearing, haversine_distance};

/// Movement between two consecutive GNSS samples.
#[derive(Debug, Clone)]
pub struct SpatialVector {
    pub start: GnssPosition,
    pub end: GnssPosition,
}

impl SpatialVector {
    pub fn new(start: GnssPosition, end: GnssPosition) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        haversine_distance(
            self.start.latitude,
            self.start.longitude,
            self.end.latitude,
            self.end.longitude,
        )
    }

    pub fn bearing(&self) -> f64 {
        bearing(
            self.start.latitude,
            self.start.longitude,
            self.end.latitude,
            self.end.longitude,
        )
    }
}

/// A sequence of at least two GNSS samples interpreted as a chain of
/// movement vectors.
#[derive(Debug, Clone)]
pub struct SpatialVectorCollection {
    positions: Vec<GnssPosition>,
}

impl SpatialVectorCollection {
    /// Returns `None` for fewer than two samples, a single sample carries no
    /// movement information.
    pub fn new(positions: &[GnssPosition]) -> Option<Self> {
        if positions.len() < 2 {
            return None;
        }
        Some(Self {
            positions: positions.to_vec(),
        })
    }

    pub fn positions(&self) -> &[GnssPosition] {
        &self.positions
    }

    pub fn vectors(&self) -> impl Iterator<Item = SpatialVector> + '_ {
        self.positions
            .windows(2)
            .map(|pair| SpatialVector::new(pair[0].clone(), pair[1].clone()))
    }

    /// Total path length in meters.
    pub fn length(&self) -> f64 {
        self.vectors().map(|v| v.length()).sum()
    }

    /// Overall bearing from the first to the last sample.
    pub fn bearing(&self) -> f64 {
        SpatialVector::new(
            self.positions.first().cloned().unwrap(),
            self.positions.last().cloned().unwrap(),
        )
        .bearing()
    }

    /// Whether the samples describe an actual movement rather than GNSS
    /// noise around a standing vehicle: the path must be at least
    /// `min_distance` meters long and reasonably straight.
    pub fn is_movement(&self, min_distance: f64) -> bool {
        let total_distance = self.length();
        if total_distance < min_distance {
            return false;
        }

        let direct_distance = SpatialVector::new(
            self.positions.first().cloned().unwrap(),
            self.positions.last().cloned().unwrap(),
        )
        .length();

        let linearity = if total_distance > 0.0 {
            direct_distance / total_distance
        } else {
            0.0
        };

        linearity > 0.35
    }
}

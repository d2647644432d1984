use geo::{
    Coord, EuclideanDistance, EuclideanLength, LineInterpolatePoint, LineLocatePoint,
    LineString, Point,
};

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// radius of the spherical-mercator reference sphere (EPSG:3857).
const MERCATOR_RADIUS_METERS: f64 = 6_378_137.0;

fn to_radians(degrees: f64) -> f64 {
    degrees * std::f64::consts::PI / 180.0
}

fn to_degrees(radians: f64) -> f64 {
    radians * 180.0 / std::f64::consts::PI
}

/// Projects a WGS-84 coordinate to Web-Mercator meters. The projection is
/// only used for local distance and arc-length comparisons, where the
/// spherical approximation is fine at city scale.
pub fn web_mercator(latitude: f64, longitude: f64) -> Coord<f64> {
    let x = MERCATOR_RADIUS_METERS * to_radians(longitude);
    let y = MERCATOR_RADIUS_METERS
        * ((std::f64::consts::FRAC_PI_4 + to_radians(latitude) / 2.0).tan()).ln();
    Coord { x, y }
}

/// Inverse of `web_mercator`, returns `(latitude, longitude)` degrees.
pub fn wgs_84(coord: Coord<f64>) -> (f64, f64) {
    let longitude = to_degrees(coord.x / MERCATOR_RADIUS_METERS);
    let latitude = to_degrees(
        2.0 * (coord.y / MERCATOR_RADIUS_METERS).exp().atan() - std::f64::consts::FRAC_PI_2,
    );
    (latitude, longitude)
}

#[derive(Debug)]
pub enum ShapeError {
    InvalidPolyline(String),
    EmptyShape,
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InvalidPolyline(why) => write!(f, "invalid polyline: {}", why),
            Self::EmptyShape => write!(f, "shape has no coordinates"),
        }
    }
}

impl std::error::Error for ShapeError {}

/// A trip shape in Web-Mercator meters, decoded from an encoded polyline.
/// Wraps the raw line string with the arc-length operations the matching
/// engine needs.
#[derive(Debug, Clone)]
pub struct ShapeLine {
    line: LineString<f64>,
    length: f64,
}

impl ShapeLine {
    /// Decodes an encoded polyline (precision 5) and projects it to
    /// Web-Mercator.
    pub fn from_polyline(encoded: &str) -> Result<Self, ShapeError> {
        let decoded = polyline::decode_polyline(encoded, 5)
            .map_err(|why| ShapeError::InvalidPolyline(why.to_string()))?;

        if decoded.0.len() < 2 {
            return Err(ShapeError::EmptyShape);
        }

        // decoded coordinates are (x = longitude, y = latitude)
        let line = LineString::from(
            decoded
                .0
                .iter()
                .map(|c| web_mercator(c.y, c.x))
                .collect::<Vec<_>>(),
        );
        let length = line.euclidean_length();

        Ok(Self { line, length })
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    /// Arc length of the foot of the perpendicular from `point` onto the
    /// shape, in meters from the start of the line.
    pub fn project(&self, point: Coord<f64>) -> f64 {
        self.line
            .line_locate_point(&Point::from(point))
            .unwrap_or(0.0)
            * self.length
    }

    /// Shortest distance from `point` to the shape in meters.
    pub fn distance(&self, point: Coord<f64>) -> f64 {
        Point::from(point).euclidean_distance(&self.line)
    }

    /// Point on the shape at the given arc length from the start.
    pub fn interpolate(&self, arc_length: f64) -> Coord<f64> {
        let fraction = if self.length > 0.0 {
            (arc_length / self.length).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.line
            .line_interpolate_point(fraction)
            .map(|p| p.0)
            .unwrap_or(self.line.0[0])
    }
}

pub fn haversine_distance(
    latitude_1: f64,
    longitude_1: f64,
    latitude_2: f64,
    longitude_2: f64,
) -> f64 {
    let lat1_rad = to_radians(latitude_1);
    let lon1_rad = to_radians(longitude_1);
    let lat2_rad = to_radians(latitude_2);
    let lon2_rad = to_radians(longitude_2);

    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Initial bearing from the first to the second coordinate in degrees,
/// normalized to [0, 360).
pub fn bearing(
    latitude_1: f64,
    longitude_1: f64,
    latitude_2: f64,
    longitude_2: f64,
) -> f64 {
    let lat1_rad = to_radians(latitude_1);
    let lat2_rad = to_radians(latitude_2);
    let dlon = to_radians(longitude_2 - longitude_1);

    let x = dlon.sin() * lat2_rad.cos();
    let y = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * dlon.cos();

    (to_degrees(x.atan2(y)) + 360.0) % 360.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // straight line along the equator from (0, 0) to (0, 2)
    const EQUATOR_LINE: &str = "???_ibE?_ibE";

    #[test]
    fn mercator_round_trips() {
        let coord = web_mercator(54.323, 10.134);
        let (lat, lon) = wgs_84(coord);
        assert!((lat - 54.323).abs() < 1e-9);
        assert!((lon - 10.134).abs() < 1e-9);
    }

    #[test]
    fn shape_projection_is_monotonic_along_the_line() {
        let shape = ShapeLine::from_polyline(EQUATOR_LINE).unwrap();
        let quarter = shape.project(web_mercator(0.0, 0.5));
        let half = shape.project(web_mercator(0.0, 1.0));
        let almost_end = shape.project(web_mercator(0.0, 1.9));
        assert!(quarter < half);
        assert!(half < almost_end);
        assert!(almost_end <= shape.length());
    }

    #[test]
    fn interpolate_inverts_project() {
        let shape = ShapeLine::from_polyline(EQUATOR_LINE).unwrap();
        let arc = shape.project(web_mercator(0.0, 1.0));
        let coord = shape.interpolate(arc);
        let (lat, lon) = wgs_84(coord);
        assert!(lat.abs() < 1e-6);
        assert!((lon - 1.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_polyline_is_rejected() {
        assert!(matches!(
            ShapeLine::from_polyline(""),
            Err(ShapeError::EmptyShape)
        ));
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Kiel Hbf to Kiel university, roughly 3.4 km
        let distance = haversine_distance(54.3142, 10.1316, 54.3388, 10.1225);
        assert!((distance - 3_400.0).abs() < 300.0);
    }

    #[test]
    fn bearing_east_is_90_degrees() {
        let b = bearing(0.0, 0.0, 0.0, 1.0);
        assert!((b - 90.0).abs() < 1e-6);
    }
}

use model::{CurrentStopStatus, GnssPosition, StopTime, TripMetrics};
use utility::geo::{web_mercator, ShapeLine};

pub const MAX_DEVIATION_PERCENTAGE: f64 = 30.0;

/// distance below which the vehicle counts as standing at a stop.
const STOPPED_AT_DISTANCE: f64 = 30.0;

/// distance below which the vehicle counts as approaching a stop.
const INCOMING_AT_DISTANCE: f64 = 60.0;

/// Scores the plausibility of a trip candidate in time: where the schedule
/// says the vehicle should be along the shape right now versus where the
/// GNSS samples put it.
pub struct TemporalMatch<'a> {
    stop_times: &'a [StopTime],
    trip_shape: &'a ShapeLine,

    /// projection length of every stop onto the shape, in stop order.
    stop_projections: Vec<f64>,

    pub time_based_progress_percentage: f64,
    pub match_score: f64,
}

impl<'a> TemporalMatch<'a> {
    /// `now` is epoch seconds; it is truncated to the whole minute so the
    /// score does not flutter between samples of the same minute.
    pub fn new(stop_times: &'a [StopTime], trip_shape: &'a ShapeLine, now: i64) -> Self {
        let stop_projections = stop_times
            .iter()
            .map(|stop_time| {
                trip_shape.project(web_mercator(
                    stop_time.stop.latitude,
                    stop_time.stop.longitude,
                ))
            })
            .collect();

        let mut temporal = Self {
            stop_times,
            trip_shape,
            stop_projections,
            time_based_progress_percentage: 0.0,
            match_score: 0.0,
        };

        temporal.time_based_progress_percentage = temporal.calculate_time_progress(now - now % 60);
        temporal
    }

    fn calculate_time_progress(&self, now: i64) -> f64 {
        let (first, last) = match (self.stop_times.first(), self.stop_times.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0.0,
        };

        // check whether the trip should run currently
        if now <= first.departure_timestamp {
            return 0.0;
        }
        if now >= last.departure_timestamp {
            return 100.0;
        }

        // locate the pair of stops the current timestamp falls between and
        // interpolate the expected position linearly in time
        for (index, pair) in self.stop_times.windows(2).enumerate() {
            let this_departure = pair[0].departure_timestamp;
            let next_departure = pair[1].departure_timestamp;

            if this_departure <= now && now <= next_departure {
                let elapsed = (now - this_departure) as f64;
                let duration = (next_departure - this_departure) as f64;
                let time_based_progress = if duration > 0.0 {
                    elapsed / duration
                } else {
                    1.0
                };

                let this_projection = self.stop_projections[index];
                let next_projection = self.stop_projections[index + 1];
                let progress_length =
                    this_projection + (next_projection - this_projection) * time_based_progress;

                let percentage = if self.trip_shape.length() > 0.0 {
                    progress_length / self.trip_shape.length() * 100.0
                } else {
                    0.0
                };
                return percentage.clamp(0.0, 100.0);
            }
        }

        0.0
    }

    pub fn calculate_match_score(&mut self, spatial_progress_percentage: f64) -> f64 {
        // the vehicle has moved already but the trip should not have started
        // yet (or is over), discard the candidate
        if spatial_progress_percentage != 0.0 && self.time_based_progress_percentage == 0.0 {
            log::debug!("TemporalMatch: trip candidate discarded, trip not running yet");
            return 0.0;
        }

        let deviation_percentage =
            self.time_based_progress_percentage - spatial_progress_percentage;

        if deviation_percentage.abs() > MAX_DEVIATION_PERCENTAGE {
            log::debug!(
                "TemporalMatch: trip candidate discarded, deviation of {:.2}% too high",
                deviation_percentage
            );
            return 0.0;
        }

        // early trips (vehicle ahead of schedule) are less common than late
        // ones, so they are penalized harder
        self.match_score = if deviation_percentage >= 0.0 {
            1.0 - deviation_percentage.abs() / 100.0
        } else {
            (1.0 - deviation_percentage.abs() / 100.0) * 0.8
        };

        self.match_score
    }

    /// Locates the vehicle between the stops of the trip and derives the
    /// per-stop metrics reported in the feeds.
    pub fn predict_trip_metrics(&self, position: &GnssPosition, now: i64) -> TripMetrics {
        let mut metrics = TripMetrics::default();
        if self.stop_times.is_empty() {
            return metrics;
        }

        let position_projection =
            self.trip_shape.project(web_mercator(position.latitude, position.longitude));

        // first stop whose projection lies at or beyond the vehicle; past
        // the last stop, the last stop remains the reference
        let next_index = self
            .stop_projections
            .iter()
            .position(|projection| *projection >= position_projection)
            .unwrap_or(self.stop_times.len() - 1);

        let next_stop = &self.stop_times[next_index];
        let next_projection = self.stop_projections[next_index];
        let is_final = next_index == self.stop_times.len() - 1;

        if (next_projection - position_projection).abs() < STOPPED_AT_DISTANCE {
            metrics.current_stop_status = CurrentStopStatus::StoppedAt;
            metrics.current_stop_is_final = is_final;
        } else if next_projection - position_projection < INCOMING_AT_DISTANCE {
            metrics.current_stop_status = CurrentStopStatus::IncomingAt;
            metrics.current_stop_is_final = is_final;
        } else {
            metrics.current_stop_status = CurrentStopStatus::InTransitTo;
        }

        if next_index > 0 {
            let current_stop = &self.stop_times[next_index - 1];
            metrics.current_stop_sequence = Some(current_stop.stop_sequence);
            metrics.current_stop_id = Some(current_stop.stop.stop_id.clone());
        }

        metrics.next_stop_sequence = Some(next_stop.stop_sequence);
        metrics.next_stop_id = Some(next_stop.stop.stop_id.clone());
        metrics.current_delay = now - next_stop.departure_timestamp;

        metrics
    }
}

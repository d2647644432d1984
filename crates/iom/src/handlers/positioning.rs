use chrono::{DateTime, Utc};
use matching::{AvlMatcher, SpatialVectorCollection};
use model::{GnssPosition, Trip, Vehicle, VehicleCache};

use crate::events::{EventKind, EventMessage};
use crate::handlers::{
    HandlerContext, RateGate, GNSS_MAX_AGE_SECONDS, MOVEMENT_MIN_DISTANCE_METERS,
};
use crate::vdv435::GnssPhysicalPositionData;

/// GNSS position update for a technically logged-on vehicle: appends the
/// sample to the activity buffer and runs the matching stage when the gates
/// allow it. Works through the acquisition/tracking state machine; all
/// failures are logged and leave the pipeline running.
pub async fn handle_position(
    context: &HandlerContext,
    rate_gate: &RateGate,
    vehicle_ref: &str,
    data: &GnssPhysicalPositionData,
) {
    let vehicle = match context.storage.get_vehicle(vehicle_ref).await {
        Ok(vehicle) => vehicle,
        Err(why) => {
            log::error!("GnssPhysicalPositionHandler: {}", why);
            return;
        }
    };

    let mut vehicle = match vehicle {
        Some(vehicle) if vehicle.is_technically_logged_on => vehicle,
        _ => {
            log::error!(
                "GnssPhysicalPositionHandler: vehicle {} is not technically logged on",
                vehicle_ref
            );
            return;
        }
    };

    let timestamp = match DateTime::parse_from_rfc3339(&data.timestamp_of_measurement) {
        Ok(timestamp) => timestamp.timestamp(),
        Err(why) => {
            log::error!(
                "GnssPhysicalPositionHandler: invalid TimestampOfMeasurement for vehicle {}: {}",
                vehicle_ref,
                why
            );
            return;
        }
    };
    let position = &data.gnss_physical_position.wgs_84_physical_position;

    let now = Utc::now().timestamp();
    if timestamp < now - GNSS_MAX_AGE_SECONDS {
        log::warn!(
            "GnssPhysicalPositionHandler: GNSS data update for vehicle {} is older than {} seconds and will be ignored",
            vehicle_ref,
            GNSS_MAX_AGE_SECONDS
        );
        return;
    }

    let activity = vehicle.activity.get_or_insert_with(Default::default);

    // timestamps must stay monotonic per vehicle, retained messages and
    // bus replays may deliver samples twice
    if activity
        .last_position()
        .map_or(false, |last| timestamp <= last.timestamp)
    {
        log::debug!(
            "GnssPhysicalPositionHandler: discarding out-of-order sample for vehicle {}",
            vehicle_ref
        );
        return;
    }

    activity.gnss_positions.push(GnssPosition::new(
        position.latitude,
        position.longitude,
        timestamp,
    ));

    if let Err(why) = context.storage.update_vehicle(vehicle).await {
        log::error!("GnssPhysicalPositionHandler: {}", why);
        return;
    }

    context.events.publish(EventMessage::new(
        EventKind::GnssPhysicalPositionUpdate,
        vehicle_ref,
    ));

    log::info!(
        "GnssPhysicalPositionHandler: processed GNSS data update for vehicle {} successfully",
        vehicle_ref
    );

    // re-read the windowed state for the matching stage
    let mut vehicle = match context.storage.get_vehicle(vehicle_ref).await {
        Ok(Some(vehicle)) => vehicle,
        _ => return,
    };

    let positions = vehicle
        .activity
        .as_ref()
        .map(|activity| activity.gnss_positions.clone())
        .unwrap_or_default();
    if positions.len() < 2 {
        return;
    }

    let newest = positions.last().map(|p| p.timestamp).unwrap_or(now);
    if !rate_gate.should_run(vehicle_ref, newest).await {
        log::debug!(
            "GnssPhysicalPositionHandler: matching interval for vehicle {} not reached yet",
            vehicle_ref
        );
        return;
    }

    let movement = match SpatialVectorCollection::new(&positions) {
        Some(movement) => movement,
        None => return,
    };

    // matching needs a sequence of movement coordinates, a vehicle waiting
    // at a stop produces only jitter
    if !movement.is_movement(MOVEMENT_MIN_DISTANCE_METERS) {
        log::debug!(
            "GnssPhysicalPositionHandler: vehicle {} is not moving",
            vehicle_ref
        );
        return;
    }

    if !vehicle.is_operationally_logged_on {
        acquire(
            context,
            &mut vehicle,
            &positions,
            position.latitude,
            position.longitude,
            now,
        )
        .await;
    } else {
        track(context, &mut vehicle, &positions, now).await;
    }
}

/// Acquisition: fetch nominal candidates near the vehicle, score them and
/// update the posteriors; on convergence, perform the operational log-on.
async fn acquire(
    context: &HandlerContext,
    vehicle: &mut Vehicle,
    positions: &[GnssPosition],
    latitude: f64,
    longitude: f64,
    now: i64,
) {
    log::debug!(
        "GnssPhysicalPositionHandler: vehicle {} is not operationally logged on, loading nominal trip candidates",
        vehicle.vehicle_ref
    );

    let mut candidates = context.nominal.get_trip_candidates(latitude, longitude).await;
    if candidates.is_empty() {
        if let Some(cached) = vehicle
            .cache
            .as_ref()
            .filter(|cache| !cache.trip_candidates.is_empty())
        {
            log::info!(
                "GnssPhysicalPositionHandler: falling back to {} cached trip candidates for vehicle {}",
                cached.trip_candidates.len(),
                vehicle.vehicle_ref
            );
            candidates = cached.trip_candidates.clone();
        }
    } else {
        vehicle.cache = Some(VehicleCache {
            trip_candidates: candidates.clone(),
        });
    }

    let all_vehicles = match context.storage.get_vehicles().await {
        Ok(vehicles) => vehicles,
        Err(why) => {
            log::error!("GnssPhysicalPositionHandler: {}", why);
            return;
        }
    };

    let prior = vehicle
        .activity
        .as_ref()
        .map(|activity| activity.trip_candidate_probabilities.clone())
        .unwrap_or_default();

    let matcher = AvlMatcher::new(&candidates, context.matching.shape_filter);
    let (convergence, probabilities) =
        matcher.match_candidates(vehicle, &all_vehicles, positions, &prior, now);

    let activity = vehicle.activity.get_or_insert_with(Default::default);
    activity.trip_candidate_convergence = convergence;
    activity.trip_candidate_probabilities = probabilities.clone();

    if let Err(why) = context.storage.update_vehicle(vehicle.clone()).await {
        log::error!("GnssPhysicalPositionHandler: {}", why);
        return;
    }

    if !convergence {
        return;
    }

    // adopt the candidate with the highest posterior
    let best_trip_id = probabilities
        .iter()
        .max_by(|a, b| {
            let a = a.1.last().copied().unwrap_or(0.0);
            let b = b.1.last().copied().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(trip_id, _)| trip_id.clone());

    let trip_candidate = best_trip_id.and_then(|trip_id| {
        candidates
            .iter()
            .find(|candidate| candidate.trip_id() == Some(trip_id.as_str()))
            .cloned()
    });

    let trip_candidate = match trip_candidate {
        Some(trip_candidate) => trip_candidate,
        None => return,
    };

    log::info!(
        "GnssPhysicalPositionHandler: vehicle {} matched to trip {}, performing operational log on",
        vehicle.vehicle_ref,
        trip_candidate.trip_id().unwrap_or("<unknown>")
    );

    vehicle.is_operationally_logged_on = true;
    let activity = vehicle.activity.get_or_insert_with(Default::default);
    activity.trip_descriptor = Some(trip_candidate.descriptor.clone());
    if let Some(last_position) = positions.last() {
        activity.trip_metrics =
            AvlMatcher::predict_trip_metrics(&trip_candidate, last_position, now);
    }

    if let Err(why) = context.storage.update_vehicle(vehicle.clone()).await {
        log::error!("GnssPhysicalPositionHandler: {}", why);
        return;
    }
    if let Err(why) = context.storage.update_trip(trip_candidate).await {
        log::error!("GnssPhysicalPositionHandler: {}", why);
        return;
    }

    context.events.publish(EventMessage::new(
        EventKind::OperationalVehicleLogOn,
        vehicle.vehicle_ref.clone(),
    ));
}

/// Tracking: verify the vehicle is still on its trip, refresh the metrics
/// and handle the log-off conditions (natural end, repeated mismatch).
async fn track(
    context: &HandlerContext,
    vehicle: &mut Vehicle,
    positions: &[GnssPosition],
    now: i64,
) {
    log::debug!(
        "GnssPhysicalPositionHandler: vehicle {} is operationally logged on, verifying current trip",
        vehicle.vehicle_ref
    );

    let trip_id = match vehicle.current_trip_id() {
        Some(trip_id) => trip_id.to_owned(),
        None => {
            log::error!(
                "GnssPhysicalPositionHandler: vehicle {} is operationally logged on without a trip descriptor",
                vehicle.vehicle_ref
            );
            return;
        }
    };

    let current_trip = match context.storage.get_trip(&trip_id).await {
        Ok(Some(trip)) => trip,
        Ok(None) => {
            log::error!(
                "GnssPhysicalPositionHandler: current trip {} of vehicle {} is not stored",
                trip_id,
                vehicle.vehicle_ref
            );
            return;
        }
        Err(why) => {
            log::error!("GnssPhysicalPositionHandler: {}", why);
            return;
        }
    };

    let candidates = std::slice::from_ref(&current_trip);
    let mut matcher = AvlMatcher::new(candidates, context.matching.shape_filter);
    let trip_matches = matcher.verify(vehicle, positions);

    if trip_matches {
        let metrics = positions
            .last()
            .and_then(|last| AvlMatcher::predict_trip_metrics(&current_trip, last, now));

        let activity = vehicle.activity.get_or_insert_with(Default::default);
        activity.trip_candidate_failures = 0;
        activity.trip_metrics = metrics;

        // substitute the raw position with the one snapped onto the shape
        if let Some(snapped) = matcher.matched_vehicle_position.take() {
            if let Some(last) = activity.gnss_positions.last_mut() {
                *last = snapped;
            }
        }

        let reached_final_stop = activity
            .trip_metrics
            .as_ref()
            .map_or(false, |metrics| metrics.current_stop_is_final);

        if reached_final_stop {
            log::info!(
                "GnssPhysicalPositionHandler: vehicle {} reached the end of its trip, performing operational log off",
                vehicle.vehicle_ref
            );
            operational_log_off(context, vehicle, current_trip, true).await;
            return;
        }

        if let Err(why) = context.storage.update_vehicle(vehicle.clone()).await {
            log::error!("GnssPhysicalPositionHandler: {}", why);
        }
    } else {
        let activity = vehicle.activity.get_or_insert_with(Default::default);
        activity.trip_candidate_failures += 1;
        let failures = activity.trip_candidate_failures;

        if failures >= context.matching.max_failures {
            log::info!(
                "GnssPhysicalPositionHandler: vehicle {} does not match its current trip anymore, performing operational log off",
                vehicle.vehicle_ref
            );
            operational_log_off(context, vehicle, current_trip, false).await;
            return;
        }

        if let Err(why) = context.storage.update_vehicle(vehicle.clone()).await {
            log::error!("GnssPhysicalPositionHandler: {}", why);
        }
    }
}

/// Ends the operational log-on: tombstones the trip for the differential
/// feed and resets the matching state. The trip descriptor and metrics stay
/// on the activity until the differential cleanup has run. After a natural
/// end of the trip the GNSS buffer is emptied, otherwise the vehicle would
/// immediately re-bind to the trip it just finished.
async fn operational_log_off(
    context: &HandlerContext,
    vehicle: &mut Vehicle,
    mut current_trip: Trip,
    clear_gnss_buffer: bool,
) {
    current_trip.is_differential_deleted = true;
    if let Err(why) = context.storage.update_trip(current_trip).await {
        log::error!("GnssPhysicalPositionHandler: {}", why);
    }

    vehicle.is_operationally_logged_on = false;
    let activity = vehicle.activity.get_or_insert_with(Default::default);
    activity.trip_candidate_convergence = false;
    activity.trip_candidate_probabilities.clear();
    activity.trip_candidate_failures = 0;
    if clear_gnss_buffer {
        activity.gnss_positions.clear();
    }

    if let Err(why) = context.storage.update_vehicle(vehicle.clone()).await {
        log::error!("GnssPhysicalPositionHandler: {}", why);
        return;
    }

    context.events.publish(EventMessage::new(
        EventKind::OperationalVehicleLogOff,
        vehicle.vehicle_ref.clone(),
    ));
}

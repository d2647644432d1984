use model::{Vehicle, VehicleActivity, VehicleCache};
use storage::StoreError;

use crate::events::{EventKind, EventMessage};
use crate::handlers::HandlerContext;
use crate::vdv435::{
    ResponseKind, TechnicalLogOnOffResponse, RESPONSE_CODE_DOUBLE_LOG_ON,
    RESPONSE_CODE_NOT_LOGGED_ON,
};

/// Technical log-on: creates the vehicle on first contact, resets its
/// activity and cache and clears the differential tombstone. A second
/// log-on of an already logged-on vehicle is answered with `doubleLogOn`.
pub async fn handle_log_on(
    context: &HandlerContext,
    vehicle_ref: &str,
) -> Result<TechnicalLogOnOffResponse, StoreError> {
    let mut vehicle = context
        .storage
        .get_vehicle(vehicle_ref)
        .await?
        .unwrap_or_else(|| Vehicle::new(vehicle_ref));

    if vehicle.is_technically_logged_on {
        log::error!(
            "TechnicalVehicleLogOnHandler: vehicle {} tried to log on but is already logged on",
            vehicle_ref
        );
        return Ok(TechnicalLogOnOffResponse::error(
            ResponseKind::LogOn,
            RESPONSE_CODE_DOUBLE_LOG_ON,
        ));
    }

    vehicle.is_technically_logged_on = true;
    vehicle.is_differential_deleted = false;
    vehicle.activity = Some(VehicleActivity::default());
    vehicle.cache = Some(VehicleCache::default());

    context.storage.update_vehicle(vehicle).await?;
    context
        .events
        .publish(EventMessage::new(EventKind::TechnicalVehicleLogOn, vehicle_ref));

    log::info!(
        "TechnicalVehicleLogOnHandler: vehicle {} logged on successfully",
        vehicle_ref
    );

    Ok(TechnicalLogOnOffResponse::data(ResponseKind::LogOn))
}

/// Technical log-off: tombstones the vehicle and, if it was operationally
/// logged on, its current trip. The trip descriptor and metrics stay on the
/// activity so the differential feed can still report the deletion; the
/// feed assembler cleans them up afterwards.
pub async fn handle_log_off(
    context: &HandlerContext,
    vehicle_ref: &str,
) -> Result<TechnicalLogOnOffResponse, StoreError> {
    let vehicle = context.storage.get_vehicle(vehicle_ref).await?;

    let mut vehicle = match vehicle {
        Some(vehicle) if vehicle.is_technically_logged_on => vehicle,
        _ => {
            log::error!(
                "TechnicalVehicleLogOffHandler: vehicle {} tried to log off but is not logged on",
                vehicle_ref
            );
            return Ok(TechnicalLogOnOffResponse::error(
                ResponseKind::LogOff,
                RESPONSE_CODE_NOT_LOGGED_ON,
            ));
        }
    };

    if vehicle.is_operationally_logged_on {
        if let Some(trip_id) = vehicle.current_trip_id() {
            if let Some(mut current_trip) = context.storage.get_trip(trip_id).await? {
                current_trip.is_differential_deleted = true;
                context.storage.update_trip(current_trip).await?;
            }
        }
    }

    vehicle.is_operationally_logged_on = false;
    vehicle.is_technically_logged_on = false;
    vehicle.cache = None;
    vehicle.is_differential_deleted = true;

    context.storage.update_vehicle(vehicle).await?;
    context
        .events
        .publish(EventMessage::new(EventKind::TechnicalVehicleLogOff, vehicle_ref));

    log::info!(
        "TechnicalVehicleLogOffHandler: vehicle {} logged off successfully",
        vehicle_ref
    );

    Ok(TechnicalLogOnOffResponse::data(ResponseKind::LogOff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::RecordingPublisher;
    use crate::handlers::MatchingConfig;
    use crate::topics::TopicSet;
    use model::{Trip, TripDescriptor, TripMetrics};
    use nominal::{NominalAdapter, NominalClient};
    use std::sync::Arc;
    use storage::{GnssWindow, MemoryStore};

    struct EmptyAdapter;

    #[async_trait::async_trait]
    impl NominalAdapter for EmptyAdapter {
        async fn get_trip_candidates(&self, _: f64, _: f64) -> nominal::Result<Vec<Trip>> {
            Ok(Vec::new())
        }
    }

    fn context() -> HandlerContext {
        HandlerContext {
            storage: Arc::new(MemoryStore::new(GnssWindow::default())),
            nominal: Arc::new(NominalClient::new("test", Box::new(EmptyAdapter))),
            matching: MatchingConfig::default(),
            events: Default::default(),
            publisher: Arc::new(RecordingPublisher::default()),
            topics: TopicSet::new("VKG", "1"),
        }
    }

    #[tokio::test]
    async fn log_on_creates_and_resets_the_vehicle() {
        let context = context();

        let response = handle_log_on(&context, "bus-1").await.unwrap();
        assert!(!response.is_error());

        let vehicle = context.storage.get_vehicle("bus-1").await.unwrap().unwrap();
        assert!(vehicle.is_technically_logged_on);
        assert!(!vehicle.is_differential_deleted);
        assert!(vehicle.activity.is_some());
        assert!(vehicle.cache.is_some());
    }

    #[tokio::test]
    async fn double_log_on_is_answered_with_the_defined_code() {
        let context = context();

        handle_log_on(&context, "bus-1").await.unwrap();
        let response = handle_log_on(&context, "bus-1").await.unwrap();

        assert!(response.is_error());
        assert!(response.xml().contains(RESPONSE_CODE_DOUBLE_LOG_ON));
    }

    #[tokio::test]
    async fn log_off_of_unknown_vehicle_is_answered_with_the_defined_code() {
        let context = context();

        let response = handle_log_off(&context, "bus-1").await.unwrap();
        assert!(response.is_error());
        assert!(response.xml().contains(RESPONSE_CODE_NOT_LOGGED_ON));
    }

    #[tokio::test]
    async fn log_off_tombstones_vehicle_and_current_trip() {
        let context = context();
        handle_log_on(&context, "bus-1").await.unwrap();

        // put the vehicle on a trip
        let mut vehicle = context.storage.get_vehicle("bus-1").await.unwrap().unwrap();
        vehicle.is_operationally_logged_on = true;
        let activity = vehicle.activity.as_mut().unwrap();
        activity.trip_descriptor = Some(TripDescriptor {
            trip_id: Some("trip-1".to_owned()),
            ..Default::default()
        });
        activity.trip_metrics = Some(TripMetrics::default());
        context.storage.update_vehicle(vehicle).await.unwrap();
        context
            .storage
            .update_trip(Trip {
                descriptor: TripDescriptor {
                    trip_id: Some("trip-1".to_owned()),
                    ..Default::default()
                },
                stop_times: vec![],
                shape_polyline: "abc".to_owned(),
                is_differential_deleted: false,
            })
            .await
            .unwrap();

        let response = handle_log_off(&context, "bus-1").await.unwrap();
        assert!(!response.is_error());

        let vehicle = context.storage.get_vehicle("bus-1").await.unwrap().unwrap();
        assert!(!vehicle.is_technically_logged_on);
        assert!(!vehicle.is_operationally_logged_on);
        assert!(vehicle.is_differential_deleted);
        assert!(vehicle.cache.is_none());

        // descriptor and metrics survive for the differential cleanup
        let activity = vehicle.activity.unwrap();
        assert!(activity.trip_descriptor.is_some());
        assert!(activity.trip_metrics.is_some());

        let trip = context.storage.get_trip("trip-1").await.unwrap().unwrap();
        assert!(trip.is_differential_deleted);
    }

    #[tokio::test]
    async fn re_log_on_clears_the_tombstone() {
        let context = context();
        handle_log_on(&context, "bus-1").await.unwrap();
        handle_log_off(&context, "bus-1").await.unwrap();
        handle_log_on(&context, "bus-1").await.unwrap();

        let vehicle = context.storage.get_vehicle("bus-1").await.unwrap().unwrap();
        assert!(vehicle.is_technically_logged_on);
        assert!(!vehicle.is_differential_deleted);

        // fresh activity, the previous trip refs are gone
        assert!(vehicle.activity.unwrap().trip_descriptor.is_none());
    }
}

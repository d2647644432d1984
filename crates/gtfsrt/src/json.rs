//! Debug rendering of feed messages as JSON. The wire format stays
//! protobuf; this mirrors the same fields for the `?debug` query so the
//! feeds can be inspected in a browser.

use serde_json::{json, Map, Value};

use crate::realtime::{
    trip_update, FeedEntity, FeedMessage, TripDescriptor, TripUpdate, VehicleDescriptor,
    VehiclePosition,
};

pub fn feed_message(message: &FeedMessage) -> Value {
    json!({
        "header": {
            "gtfs_realtime_version": message.header.gtfs_realtime_version,
            "incrementality": message.header.incrementality().as_str_name(),
            "timestamp": message.header.timestamp,
        },
        "entity": message.entity.iter().map(feed_entity).collect::<Vec<_>>(),
    })
}

pub fn to_pretty_string(message: &FeedMessage) -> String {
    serde_json::to_string_pretty(&feed_message(message)).unwrap_or_else(|_| "{}".to_owned())
}

fn feed_entity(entity: &FeedEntity) -> Value {
    let mut object = Map::new();
    object.insert("id".to_owned(), json!(entity.id));
    object.insert("is_deleted".to_owned(), json!(entity.is_deleted()));

    if let Some(vehicle) = &entity.vehicle {
        object.insert("vehicle".to_owned(), vehicle_position(vehicle));
    }
    if let Some(update) = &entity.trip_update {
        object.insert("trip_update".to_owned(), trip_update(update));
    }

    Value::Object(object)
}

fn vehicle_position(position: &VehiclePosition) -> Value {
    let mut object = Map::new();

    if let Some(timestamp) = position.timestamp {
        object.insert("timestamp".to_owned(), json!(timestamp));
    }
    if let Some(vehicle) = &position.vehicle {
        object.insert("vehicle".to_owned(), vehicle_descriptor(vehicle));
    }
    if let Some(p) = &position.position {
        object.insert(
            "position".to_owned(),
            json!({ "latitude": p.latitude, "longitude": p.longitude }),
        );
    }
    if let Some(trip) = &position.trip {
        object.insert("trip".to_owned(), trip_descriptor(trip));
    }
    if let Some(current_stop_sequence) = position.current_stop_sequence {
        object.insert("current_stop_sequence".to_owned(), json!(current_stop_sequence));
    }
    if position.current_status.is_some() {
        object.insert(
            "current_status".to_owned(),
            json!(position.current_status().as_str_name()),
        );
    }
    if let Some(stop_id) = &position.stop_id {
        object.insert("stop_id".to_owned(), json!(stop_id));
    }

    Value::Object(object)
}

fn trip_update(update: &TripUpdate) -> Value {
    let mut object = Map::new();

    if let Some(timestamp) = update.timestamp {
        object.insert("timestamp".to_owned(), json!(timestamp));
    }
    object.insert("trip".to_owned(), trip_descriptor(&update.trip));
    if let Some(vehicle) = &update.vehicle {
        object.insert("vehicle".to_owned(), vehicle_descriptor(vehicle));
    }
    object.insert(
        "stop_time_update".to_owned(),
        Value::Array(update.stop_time_update.iter().map(stop_time_update).collect()),
    );

    Value::Object(object)
}

fn stop_time_update(update: &trip_update::StopTimeUpdate) -> Value {
    json!({
        "stop_id": update.stop_id,
        "arrival": update.arrival.as_ref().map(stop_time_event),
        "departure": update.departure.as_ref().map(stop_time_event),
    })
}

fn stop_time_event(event: &trip_update::StopTimeEvent) -> Value {
    json!({
        "time": event.time,
        "delay": event.delay,
    })
}

fn trip_descriptor(descriptor: &TripDescriptor) -> Value {
    json!({
        "trip_id": descriptor.trip_id,
        "route_id": descriptor.route_id,
        "start_time": descriptor.start_time,
        "start_date": descriptor.start_date,
    })
}

fn vehicle_descriptor(descriptor: &VehicleDescriptor) -> Value {
    json!({
        "id": descriptor.id,
        "label": descriptor.label,
        "license_plate": descriptor.license_plate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{feed_header::Incrementality, FeedHeader, Position};

    #[test]
    fn feed_message_renders_header_and_entities() {
        let mut header = FeedHeader {
            gtfs_realtime_version: "2.0".to_owned(),
            timestamp: Some(1_700_000_000),
            ..Default::default()
        };
        header.set_incrementality(Incrementality::Differential);

        let message = FeedMessage {
            header,
            entity: vec![FeedEntity {
                id: "bus-1".to_owned(),
                is_deleted: Some(true),
                vehicle: Some(VehiclePosition {
                    timestamp: Some(1_700_000_000),
                    position: Some(Position {
                        latitude: 54.3,
                        longitude: 10.1,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                trip_update: None,
            }],
        };

        let value = feed_message(&message);
        assert_eq!(value["header"]["incrementality"], "DIFFERENTIAL");
        assert_eq!(value["header"]["gtfs_realtime_version"], "2.0");
        assert_eq!(value["entity"][0]["id"], "bus-1");
        assert_eq!(value["entity"][0]["is_deleted"], true);

        let rendered = to_pretty_string(&message);
        assert!(rendered.contains("\"latitude\""));
    }
}

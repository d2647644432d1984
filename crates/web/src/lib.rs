use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use gtfsrt::{json, realtime::FeedMessage, FeedAssembler};
use prost::Message;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct WebState {
    pub assembler: Arc<FeedAssembler>,
}

pub fn routes(state: WebState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/vehicle-positions.pbf", get(vehicle_positions))
        .route("/trip-updates.pbf", get(trip_updates))
        .layer(cors)
        .with_state(state)
}

pub async fn start_web_server(state: WebState, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, routes(state).into_make_service()).await?;

    Ok(())
}

async fn vehicle_positions(
    State(state): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match state.assembler.full_vehicle_positions().await {
        Ok(feed) => feed_response(feed, params.contains_key("debug")),
        Err(why) => {
            log::error!("web: {}", why);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn trip_updates(
    State(state): State<WebState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match state.assembler.full_trip_updates().await {
        Ok(feed) => feed_response(feed, params.contains_key("debug")),
        Err(why) => {
            log::error!("web: {}", why);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn feed_response(feed: FeedMessage, debug: bool) -> Response {
    if debug {
        (
            [(header::CONTENT_TYPE, "application/json")],
            json::to_pretty_string(&feed),
        )
            .into_response()
    } else {
        (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            feed.encode_to_vec(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono_tz::Europe::Berlin;
    use storage::{GnssWindow, MemoryStore};
    use tower::ServiceExt;

    fn test_routes() -> Router {
        let storage = Arc::new(MemoryStore::new(GnssWindow::default()));
        routes(WebState {
            assembler: Arc::new(FeedAssembler::new(storage, Berlin)),
        })
    }

    #[tokio::test]
    async fn vehicle_positions_endpoint_serves_protobuf() {
        let response = test_routes()
            .oneshot(
                Request::builder()
                    .uri("/vehicle-positions.pbf")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let feed = FeedMessage::decode(&bytes[..]).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "2.0");
        assert!(feed.entity.is_empty());
    }

    #[tokio::test]
    async fn debug_query_switches_to_json() {
        let response = test_routes()
            .oneshot(
                Request::builder()
                    .uri("/trip-updates.pbf?debug")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"gtfs_realtime_version\": \"2.0\""));
    }
}

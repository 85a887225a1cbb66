//! Inbound HTTP surface. Handlers enforce their required-scopes policy via
//! the gate, then delegate to the DSS coordinator or the geozone
//! downloader.

use crate::auth::scopes::ScopeGate;
use crate::geozone::GeozoneDownloader;
use crate::rid::cluster::generate_cluster_details;
use crate::rid::dss::{DEFAULT_EXPIRATION, DssCoordinator};
use crate::rid::records::RecordWriter;
use crate::rid::types::{LatLngPoint, RidVolume4D};
use crate::rid::view::{DEFAULT_MAX_VIEW_LENGTH, parse_view_lat_lng};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use geo::{Rect, coord};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const ISA_WRITE_SCOPES: &[&str] = &["rid.service_provider"];
const DISPLAY_SCOPES: &[&str] = &["rid.display_provider"];
const GEOZONE_SCOPES: &[&str] = &["geo-awareness.test"];

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<ScopeGate>,
    pub dss: Arc<DssCoordinator>,
    pub geozone: Arc<GeozoneDownloader>,
    pub records: Arc<dyn RecordWriter>,
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/rid/dss/isa", put(create_isa))
        .route("/rid/dss/subscriptions", post(create_subscription))
        .route("/rid/dss/subscriptions/{id}", delete(delete_subscription))
        .route("/display/flights", get(display_flights))
        .route("/geozone/sources", put(add_geozone_source))
        .with_state(state)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}

#[derive(Debug, Deserialize)]
struct IsaCreateRequest {
    extents: RidVolume4D,
    uss_base_url: String,
}

async fn create_isa(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IsaCreateRequest>,
) -> Response {
    if let Err(response) = state.gate.enforce(&headers, ISA_WRITE_SCOPES, false).await {
        return response;
    }

    let created = state
        .dss
        .create_isa(request.extents, &request.uss_base_url, DEFAULT_EXPIRATION)
        .await;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(created)).into_response()
}

#[derive(Debug, Deserialize)]
struct SubscriptionCreateRequest {
    view: String,
    #[serde(default)]
    is_simulated: bool,
}

async fn create_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubscriptionCreateRequest>,
) -> Response {
    if let Err(response) = state.gate.enforce(&headers, DISPLAY_SCOPES, false).await {
        return response;
    }

    let coords = match parse_view_lat_lng(&request.view, DEFAULT_MAX_VIEW_LENGTH) {
        Ok(coords) => coords,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response();
        }
    };
    let vertices = view_vertices(coords);

    let request_uuid = Uuid::new_v4().to_string();
    let created = state
        .dss
        .create_subscription(
            &vertices,
            &request.view,
            &request_uuid,
            DEFAULT_EXPIRATION,
            request.is_simulated,
        )
        .await;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(created)).into_response()
}

async fn delete_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(subscription_id): Path<String>,
) -> Response {
    if let Err(response) = state.gate.enforce(&headers, DISPLAY_SCOPES, false).await {
        return response;
    }

    let deleted = state.dss.delete_subscription(&subscription_id).await;
    (StatusCode::OK, Json(json!({ "deleted": deleted }))).into_response()
}

#[derive(Debug, Deserialize)]
struct DisplayQuery {
    view: String,
}

/// Obfuscated display data for a view: the flights currently observed
/// inside it, reported as privacy-floor clusters.
async fn display_flights(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DisplayQuery>,
) -> Response {
    if let Err(response) = state.gate.enforce(&headers, DISPLAY_SCOPES, false).await {
        return response;
    }

    let coords = match parse_view_lat_lng(&query.view, DEFAULT_MAX_VIEW_LENGTH) {
        Ok(coords) => coords,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response();
        }
    };
    let [min_lat, min_lng, max_lat, max_lng] = coords;
    let view_rect = Rect::new(
        coord! { x: min_lng, y: min_lat },
        coord! { x: max_lng, y: max_lat },
    );

    let observations = match state.records.recent_observations().await {
        Ok(observations) => observations,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response();
        }
    };
    let positions: Vec<LatLngPoint> = observations
        .iter()
        .filter(|o| {
            (min_lat..=max_lat).contains(&o.lat_dd) && (min_lng..=max_lng).contains(&o.lon_dd)
        })
        .map(|o| LatLngPoint {
            lat: o.lat_dd,
            lng: o.lon_dd,
        })
        .collect();

    let clusters = generate_cluster_details(&positions, view_rect);
    (StatusCode::OK, Json(json!({ "clusters": clusters }))).into_response()
}

#[derive(Debug, Deserialize)]
struct GeozoneSourceRequest {
    url: String,
    #[serde(default)]
    id: Option<String>,
}

async fn add_geozone_source(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GeozoneSourceRequest>,
) -> Response {
    if let Err(response) = state.gate.enforce(&headers, GEOZONE_SCOPES, false).await {
        return response;
    }

    let source_id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let downloader = state.geozone.clone();
    let url = request.url;
    let task_source_id = source_id.clone();
    tokio::spawn(async move {
        downloader.ingest(&url, &task_source_id).await;
    });

    (
        StatusCode::CREATED,
        Json(json!({ "id": source_id, "status": "Processing" })),
    )
        .into_response()
}

/// The four corners of a `minLat,minLng,maxLat,maxLng` view rectangle,
/// counter-clockwise.
fn view_vertices(coords: [f64; 4]) -> Vec<LatLngPoint> {
    let [min_lat, min_lng, max_lat, max_lng] = coords;
    vec![
        LatLngPoint { lat: min_lat, lng: min_lng },
        LatLngPoint { lat: min_lat, lng: max_lng },
        LatLngPoint { lat: max_lat, lng: max_lng },
        LatLngPoint { lat: max_lat, lng: min_lng },
    ]
}

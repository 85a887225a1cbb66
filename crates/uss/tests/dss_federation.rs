//! DSS coordinator flows against mock DSS / peer / authority servers:
//! ISA creation with subscriber notification, subscription creation and
//! persistence, the fallback peer mode, and peer polling.

mod common;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use blender_test_support::MockServer;
use blender_uss::auth::broker::TokenBroker;
use blender_uss::config::Settings;
use blender_uss::rid::dss::{DEFAULT_EXPIRATION, DssCoordinator, view_hash};
use blender_uss::rid::records::{RecordWriter, StoreRecords};
use blender_uss::rid::types::{LatLngPoint, RidTime, RidVolume4D};
use blender_uss::store::{KeyValueStore, MemoryStore};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const VIEW: &str = "33.0,-117.0,34.0,-116.0";

struct Fixture {
    store: Arc<MemoryStore>,
    records: Arc<StoreRecords>,
    _token_server: MockServer,
}

async fn fixture_with(settings: Settings) -> (Fixture, Arc<DssCoordinator>) {
    let token_hits = Arc::new(AtomicUsize::new(0));
    let token_server = MockServer::spawn(common::token_server_router("auth-token", token_hits))
        .await
        .expect("spawn token server");

    let mut settings = settings;
    settings.dss_auth_url = token_server.base_url.clone();

    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn KeyValueStore> = store.clone();
    let broker = Arc::new(TokenBroker::new(&settings, store_dyn.clone()).expect("build broker"));
    let records = Arc::new(StoreRecords::new(store_dyn.clone()));

    let settings = Arc::new(settings);
    let coordinator = Arc::new(
        DssCoordinator::new(settings.clone(), store_dyn, broker, records.clone())
            .expect("build coordinator"),
    );

    (
        Fixture {
            store,
            records,
            _token_server: token_server,
        },
        coordinator,
    )
}

fn rid_time(offset_s: i64) -> Value {
    serde_json::to_value(RidTime::rfc3339(
        Utc::now() + chrono::Duration::seconds(offset_s),
    ))
    .expect("serialize time")
}

fn test_extents() -> RidVolume4D {
    serde_json::from_value(json!({
        "volume": {
            "outline_polygon": { "vertices": [
                { "lat": 33.0, "lng": -117.0 },
                { "lat": 33.0, "lng": -116.0 },
                { "lat": 34.0, "lng": -116.0 },
                { "lat": 34.0, "lng": -117.0 },
            ]},
            "altitude_lower": { "value": 0.5, "reference": "W84", "units": "M" },
            "altitude_upper": { "value": 800.0, "reference": "W84", "units": "M" },
        },
        "time_start": rid_time(0),
        "time_end": rid_time(30),
    }))
    .expect("build extents")
}

fn service_area_json(id: &str, uss_base_url: &str) -> Value {
    json!({
        "id": id,
        "uss_base_url": uss_base_url,
        "owner": "peer-uss",
        "time_start": rid_time(0),
        "time_end": rid_time(30),
        "version": "1",
    })
}

#[tokio::test]
async fn create_isa_notifies_subscribers_and_stores_marker() {
    let notified = Arc::new(AtomicUsize::new(0));
    let subscriber_router = Router::new().route(
        "/uss/identification_service_areas/{isa_id}",
        post({
            let notified = notified.clone();
            move |Path(_isa_id): Path<String>, Json(body): Json<Value>| {
                let notified = notified.clone();
                async move {
                    assert!(body.get("service_area").is_some());
                    assert!(body.get("subscriptions").is_some());
                    assert!(body.get("extents").is_some());
                    notified.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }
            }
        }),
    );
    let subscriber = MockServer::spawn(subscriber_router).await.expect("spawn subscriber");

    let subscriber_url = subscriber.base_url.clone();
    let dss_router = Router::new().route(
        "/rid/v2/dss/identification_service_areas/{isa_id}",
        put(move |Path(_isa_id): Path<String>, Json(_body): Json<Value>| {
            let subscriber_url = subscriber_url.clone();
            async move {
                Json(json!({
                    "service_area": service_area_json("isa-record-1", "http://flight-blender:8000/rid"),
                    "subscribers": [{
                        "url": subscriber_url,
                        "subscriptions": [
                            { "subscription_id": "sub-1", "notification_index": 2 },
                        ],
                    }],
                }))
            }
        }),
    );
    let dss = MockServer::spawn(dss_router).await.expect("spawn dss");

    let mut settings = common::base_settings();
    settings.dss_base_url = dss.base_url.clone();
    let (fixture, coordinator) = fixture_with(settings).await;

    let response = coordinator
        .create_isa(test_extents(), "http://flight-blender:8000/rid", DEFAULT_EXPIRATION)
        .await;

    assert!(response.created);
    let service_area = response.service_area.expect("service area returned");
    assert_eq!(service_area.id, "isa-record-1");
    assert_eq!(response.subscribers.len(), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(
        fixture.store.exists("isa-isa-record-1").await.unwrap(),
        "ISA TTL marker stored"
    );
}

#[tokio::test]
async fn create_isa_returns_empty_when_dss_rejects() {
    let dss_router = Router::new().route(
        "/rid/v2/dss/identification_service_areas/{isa_id}",
        put(|Path(_isa_id): Path<String>, Json(_body): Json<Value>| async {
            (StatusCode::CONFLICT, "already exists")
        }),
    );
    let dss = MockServer::spawn(dss_router).await.expect("spawn dss");

    let mut settings = common::base_settings();
    settings.dss_base_url = dss.base_url.clone();
    let (_fixture, coordinator) = fixture_with(settings).await;

    let response = coordinator
        .create_isa(test_extents(), "http://flight-blender:8000/rid", DEFAULT_EXPIRATION)
        .await;
    assert!(!response.created);
    assert!(response.service_area.is_none());
    assert!(response.subscribers.is_empty());
}

#[tokio::test]
async fn create_subscription_persists_the_flights_record() {
    let dss_router = Router::new().route(
        "/rid/v2/dss/subscriptions/{subscription_id}",
        put(|Path(subscription_id): Path<String>, Json(body): Json<Value>| async move {
            assert!(body["uss_base_url"].as_str().unwrap().ends_with("/rid"));
            Json(json!({
                "service_areas": [
                    service_area_json("peer-isa-1", "https://peer.uss.example/rid"),
                ],
                "subscription": {
                    "id": subscription_id,
                    "uss_base_url": body["uss_base_url"],
                    "owner": "self.uss.example",
                    "notification_index": 1,
                    "time_start": body["extents"]["time_start"],
                    "time_end": body["extents"]["time_end"],
                    "version": "1",
                },
            }))
        }),
    );
    let dss = MockServer::spawn(dss_router).await.expect("spawn dss");

    let mut settings = common::base_settings();
    settings.dss_base_url = dss.base_url.clone();
    let (fixture, coordinator) = fixture_with(settings).await;

    let vertices = vec![
        LatLngPoint { lat: 33.0, lng: -117.0 },
        LatLngPoint { lat: 33.0, lng: -116.0 },
        LatLngPoint { lat: 34.0, lng: -116.0 },
        LatLngPoint { lat: 34.0, lng: -117.0 },
    ];
    let response = coordinator
        .create_subscription(&vertices, VIEW, "request-uuid-1", DEFAULT_EXPIRATION, false)
        .await;

    assert!(response.created);
    assert_eq!(response.notification_index, 1);
    let subscription_id = response.dss_subscription_id.expect("subscription id");

    let active = fixture.records.active_subscription_records().await.unwrap();
    assert_eq!(active.len(), 1);
    let record = &active[0];
    assert_eq!(record.subscription_id, subscription_id);
    assert_eq!(record.record_id, "request-uuid-1");
    assert_eq!(record.view, VIEW);
    assert_eq!(record.view_hash, view_hash(VIEW));
    assert!(!record.is_simulated);
    assert_eq!(record.flights_record.service_areas.len(), 1);
    assert_eq!(
        record.flights_record.service_areas[0].uss_base_url,
        "https://peer.uss.example/rid"
    );
}

#[tokio::test]
async fn unreachable_dss_degrades_to_fallback_subscription() {
    let mut settings = common::base_settings();
    // Nothing listens here: the PUT fails at the transport level.
    settings.dss_base_url = "http://127.0.0.1:1".to_string();
    settings.rid_fallback_uss_urls = vec![
        "https://uss1.example".to_string(),
        "https://uss2.example".to_string(),
    ];
    let (fixture, coordinator) = fixture_with(settings).await;

    let response = coordinator
        .create_subscription(&[], VIEW, "request-uuid-2", DEFAULT_EXPIRATION, false)
        .await;

    assert!(response.created);
    let subscription_id = response.dss_subscription_id.expect("fresh subscription id");

    let active = fixture.records.active_subscription_records().await.unwrap();
    assert_eq!(active.len(), 1);
    let record = &active[0];
    assert_eq!(record.subscription_id, subscription_id);
    assert!(record.is_simulated, "fallback records are simulated");
    assert_eq!(record.flights_record.subscription.owner, "fallback");
    let peers: Vec<&str> = record
        .flights_record
        .service_areas
        .iter()
        .map(|area| area.uss_base_url.as_str())
        .collect();
    assert_eq!(peers, vec!["https://uss1.example", "https://uss2.example"]);
}

#[tokio::test]
async fn no_fallback_urls_means_not_created() {
    let mut settings = common::base_settings();
    settings.dss_base_url = "http://127.0.0.1:1".to_string();
    settings.rid_fallback_uss_urls = Vec::new();
    let (fixture, coordinator) = fixture_with(settings).await;

    let response = coordinator
        .create_subscription(&[], VIEW, "request-uuid-3", DEFAULT_EXPIRATION, false)
        .await;

    assert!(!response.created);
    assert!(response.dss_subscription_id.is_none());
    assert!(fixture.records.active_subscription_records().await.unwrap().is_empty());
}

#[derive(Clone)]
struct PeerState {
    details_hits: Arc<AtomicUsize>,
}

fn peer_router(state: PeerState) -> Router {
    Router::new()
        .route(
            "/uss/flights",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("view").map(String::as_str), Some(VIEW));
                Json(json!({
                    "flights": [
                        {
                            "id": "flight-1",
                            "simulated": false,
                            "aircraft_type": "Helicopter",
                            "current_state": {
                                "position": { "lat": 33.5, "lng": -116.5, "alt": 120.0 },
                            },
                            "recent_positions": [],
                        },
                        {
                            // No current_state: must be skipped, not fatal.
                            "id": "flight-2",
                            "simulated": false,
                            "aircraft_type": "NotDeclared",
                        },
                    ],
                }))
            }),
        )
        .route(
            "/uss/flights/{flight_id}/details",
            get(move |Path(flight_id): Path<String>, State(state): State<PeerState>| async move {
                state.details_hits.fetch_add(1, Ordering::SeqCst);
                Json(json!({ "details": { "id": flight_id, "operator_id": "op-1" } }))
            }),
        )
        .with_state(state)
}

#[tokio::test]
async fn poll_flights_stores_details_once_and_emits_observations() {
    let details_hits = Arc::new(AtomicUsize::new(0));
    let peer = MockServer::spawn(peer_router(PeerState {
        details_hits: details_hits.clone(),
    }))
    .await
    .expect("spawn peer");

    let (fixture, coordinator) = fixture_with(common::base_settings()).await;

    let record = serde_json::from_value(json!({
        "subscription_id": "sub-poll-1",
        "record_id": "req-1",
        "view": VIEW,
        "view_hash": view_hash(VIEW),
        "end_datetime": RidTime::rfc3339(Utc::now() + chrono::Duration::seconds(30)).value,
        "is_simulated": false,
        "flights_record": {
            "service_areas": [service_area_json("peer-isa-1", &peer.base_url)],
            "subscription": {
                "id": "sub-poll-1",
                "uss_base_url": "http://flight-blender:8000/rid",
                "owner": "self.uss.example",
                "notification_index": 0,
                "time_start": rid_time(0),
                "time_end": rid_time(30),
                "version": "1",
            },
        },
    }))
    .expect("build record");

    coordinator.poll_flights(&record).await;

    assert!(fixture.records.flight_details_exist("flight-1").await.unwrap());
    assert_eq!(details_hits.load(Ordering::SeqCst), 2, "details fetched for both flights");

    let observations = fixture.store.scan("observation:sub-poll-1:").await.unwrap();
    assert_eq!(observations.len(), 1, "only the flight with a position is observed");
    let raw = fixture.store.get(&observations[0]).await.unwrap().unwrap();
    let observation: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(observation["icao_address"], "flight-1");
    assert_eq!(observation["traffic_source"], 11);
    assert_eq!(observation["source_type"], 1);
    assert_eq!(observation["lat_dd"], 33.5);
    assert_eq!(observation["lon_dd"], -116.5);
    assert_eq!(observation["altitude_mm"], 120.0);
    assert_eq!(observation["metadata"]["subscription_id"], "sub-poll-1");

    // Second sweep: details are cached, observations accumulate.
    coordinator.poll_flights(&record).await;
    assert_eq!(details_hits.load(Ordering::SeqCst), 2, "details are not refetched");
    let observations = fixture.store.scan("observation:sub-poll-1:").await.unwrap();
    assert_eq!(observations.len(), 2);
}

#[tokio::test]
async fn settings_resolve_base_url_strips_trailing_slash() {
    let mut settings = common::base_settings();
    settings.flightblender_fqdn = Some("https://uss.example.com/".to_string());
    assert_eq!(settings.resolve_base_url(), "https://uss.example.com");
}

//! Shared fixtures for integration tests.

use blender_uss::config::Settings;
use std::time::Duration;

/// Settings skeleton pointing nowhere; tests override the endpoints they
/// exercise. Debug mode is on so local mock servers are reachable through
/// the safe fetcher.
#[must_use]
pub fn base_settings() -> Settings {
    Settings {
        http_timeout: Duration::from_secs(2),
        http_max_redirects: 3,
        http_max_download_bytes: 1024 * 1024,
        jwks_cache_ttl_s: 300.0,
        jwks_backoff_initial_s: 1.0,
        jwks_backoff_max_s: 60.0,
        geozone_max_download_bytes: 5_000_000,
        geozone_max_redirects: 3,
        dss_base_url: "http://127.0.0.1:1".to_string(),
        dss_auth_url: "http://127.0.0.1:1".to_string(),
        dss_auth_token_endpoint: "/auth/token".to_string(),
        dss_auth_jwks_endpoint: "http://127.0.0.1:1/.well-known/jwks.json".to_string(),
        dss_auth_issuer: None,
        dss_self_audience: Some("self.uss.example".to_string()),
        passport_url: "http://127.0.0.1:1".to_string(),
        passport_issuer: None,
        passport_audience: "testflight.flightblender.com".to_string(),
        auth_dss_client_id: Some("client-id".to_string()),
        auth_dss_client_secret: Some("client-secret".to_string()),
        flightblender_fqdn: Some("http://flight-blender:8000".to_string()),
        rid_fallback_uss_urls: Vec::new(),
        bypass_auth_token_verification: false,
        is_debug: true,
        allow_private_networks: true,
        redis_url: "redis://127.0.0.1:6379".to_string(),
    }
}

/// A mock authority issuing the same bearer token to every POST request.
#[must_use]
pub fn token_server_router(
    access_token: &str,
    hits: std::sync::Arc<std::sync::atomic::AtomicUsize>,
) -> axum::Router {
    use axum::Json;
    use axum::routing::post;
    use serde_json::json;

    let token = access_token.to_string();
    axum::Router::new().route(
        "/auth/token",
        post(move || {
            let token = token.clone();
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Json(json!({ "access_token": token, "token_type": "Bearer", "expires_in": 3600 }))
            }
        }),
    )
}

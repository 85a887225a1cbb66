//! Wire and record types for the ASTM F3411 Remote ID federation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLngPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidAltitude {
    pub value: f64,
    pub reference: String,
    pub units: String,
}

impl RidAltitude {
    #[must_use]
    pub fn w84_meters(value: f64) -> Self {
        Self {
            value,
            reference: "W84".to_string(),
            units: "M".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidPolygon {
    pub vertices: Vec<LatLngPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidVolume3D {
    pub outline_polygon: RidPolygon,
    pub altitude_lower: RidAltitude,
    pub altitude_upper: RidAltitude,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidTime {
    pub value: String,
    pub format: String,
}

impl RidTime {
    #[must_use]
    pub fn rfc3339(at: DateTime<Utc>) -> Self {
        Self {
            value: at.to_rfc3339_opts(SecondsFormat::Micros, true),
            format: "RFC3339".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidVolume4D {
    pub volume: RidVolume3D,
    pub time_start: RidTime,
    pub time_end: RidTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentificationServiceArea {
    pub id: String,
    pub uss_base_url: String,
    pub owner: String,
    pub time_start: RidTime,
    pub time_end: RidTime,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub subscription_id: String,
    pub notification_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberToNotify {
    pub url: String,
    pub subscriptions: Vec<SubscriptionState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidSubscription {
    pub id: String,
    pub uss_base_url: String,
    pub owner: String,
    pub notification_index: i64,
    pub time_start: RidTime,
    pub time_end: RidTime,
    pub version: String,
}

/// The service areas a subscription will poll, together with the
/// subscription itself. Stored as a value document; subscribers are referred
/// to by ID only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightsRecord {
    pub service_areas: Vec<IdentificationServiceArea>,
    pub subscription: RidSubscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct IsaCreationResponse {
    pub created: bool,
    pub service_area: Option<IdentificationServiceArea>,
    pub subscribers: Vec<SubscriberToNotify>,
}

impl IsaCreationResponse {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            created: false,
            service_area: None,
            subscribers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionResponse {
    pub created: bool,
    pub dss_subscription_id: Option<String>,
    pub notification_index: i64,
}

impl SubscriptionResponse {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            created: false,
            dss_subscription_id: None,
            notification_index: 0,
        }
    }
}

/// Persisted subscription record, bound to the request UUID that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub record_id: String,
    pub view: String,
    pub view_hash: u64,
    pub end_datetime: String,
    pub is_simulated: bool,
    pub flights_record: FlightsRecord,
}

/// DSS response to `PUT .../identification_service_areas/{id}`.
#[derive(Debug, Deserialize)]
pub struct IsaPutResponse {
    pub service_area: IdentificationServiceArea,
    #[serde(default)]
    pub subscribers: Vec<SubscriberToNotify>,
}

/// DSS response to `PUT .../subscriptions/{id}`.
#[derive(Debug, Deserialize)]
pub struct SubscriptionPutResponse {
    #[serde(default)]
    pub service_areas: Vec<IdentificationServiceArea>,
    pub subscription: RidSubscription,
}

/// A flight as reported by a peer USS. `current_state` and
/// `recent_positions` are carried opaquely into observation metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerFlight {
    pub id: String,
    #[serde(default)]
    pub current_state: Option<Value>,
    #[serde(default)]
    pub recent_positions: Vec<Value>,
    #[serde(default)]
    pub simulated: Option<bool>,
    #[serde(default)]
    pub aircraft_type: Option<String>,
}

impl PeerFlight {
    /// `(lat, lng, alt)` of the current position, when all three are
    /// present.
    #[must_use]
    pub fn position(&self) -> Option<(f64, f64, f64)> {
        let position = self.current_state.as_ref()?.get("position")?;
        Some((
            position.get("lat")?.as_f64()?,
            position.get("lng")?.as_f64()?,
            position.get("alt")?.as_f64()?,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct PeerFlightsResponse {
    #[serde(default)]
    pub flights: Vec<PeerFlight>,
}

/// A single fused air-traffic observation emitted by the peer poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub session_id: String,
    pub icao_address: String,
    pub traffic_source: u8,
    pub source_type: u8,
    pub lat_dd: f64,
    pub lon_dd: f64,
    pub altitude_mm: f64,
    pub metadata: Value,
}

/// One obfuscated cluster reported for a display view. `area_sqm` is the
/// area of the *view*, not of the cluster rectangle (ASTM reference
/// behavior).
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDetail {
    pub corners: Vec<LatLngPoint>,
    pub area_sqm: f64,
    pub number_of_flights: usize,
}

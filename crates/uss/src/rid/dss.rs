//! DSS federation coordinator: ISA and subscription CRUD against the DSS,
//! subscriber notification, peer USS polling, and the fallback peer mode
//! that keeps the poller alive through DSS outages.
//!
//! Implements the ASTM F3411 Remote ID DSS interface (`/rid/v2/dss/...`).

use crate::auth::audience::audience_from_base_url;
use crate::auth::broker::{TokenBroker, TokenType};
use crate::config::Settings;
use crate::rid::records::RecordWriter;
use crate::rid::types::{
    FlightsRecord, IdentificationServiceArea, IsaCreationResponse, IsaPutResponse, LatLngPoint,
    Observation, PeerFlight, PeerFlightsResponse, RidAltitude, RidPolygon, RidSubscription,
    RidTime, RidVolume3D, RidVolume4D, SubscriberToNotify, SubscriptionPutResponse,
    SubscriptionRecord, SubscriptionResponse,
};
use crate::store::KeyValueStore;
use anyhow::Context as _;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde_json::{Value, json};
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RESPONSE_CONTENT_TYPE: &str = "application/json";

/// Default lifetime for ISAs and subscriptions created by this node.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(30);

/// Altitude band advertised for subscriptions, meters above the W84
/// ellipsoid.
const SUBSCRIPTION_ALTITUDE_LOWER_M: f64 = 0.5;
const SUBSCRIPTION_ALTITUDE_UPPER_M: f64 = 800.0;

pub struct DssCoordinator {
    settings: Arc<Settings>,
    store: Arc<dyn KeyValueStore>,
    broker: Arc<TokenBroker>,
    records: Arc<dyn RecordWriter>,
    client: reqwest::Client,
}

/// `sha256(view) mod 1e8`, a compact fingerprint used to correlate
/// subscription records with the display view that created them.
#[must_use]
pub fn view_hash(view: &str) -> u64 {
    let digest = Sha256::digest(view.as_bytes());
    digest
        .iter()
        .fold(0u64, |acc, byte| (acc * 256 + u64::from(*byte)) % 100_000_000)
}

impl DssCoordinator {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn KeyValueStore>,
        broker: Arc<TokenBroker>,
        records: Arc<dyn RecordWriter>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("build dss http client")?;
        Ok(Self {
            settings,
            store,
            broker,
            records,
            client,
        })
    }

    async fn self_rid_token(&self) -> Option<Value> {
        let Some(audience) = self.settings.dss_self_audience.clone() else {
            error!("DSS_SELF_AUDIENCE is not set in the environment");
            return None;
        };
        let credentials = match self.broker.get(&audience, TokenType::Rid).await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!(error = %e, "error in getting authority access token");
                return None;
            }
        };
        if credentials.get("error").is_some() {
            error!(body = %credentials, "authority returned an error instead of credentials");
            return None;
        }
        Some(credentials)
    }

    /// Create an Identification Service Area on the DSS and notify every
    /// subscriber the DSS returns. Individual subscriber failures are logged
    /// and swallowed; ISA refreshes give at-least-once delivery.
    pub async fn create_isa(
        &self,
        extents: RidVolume4D,
        uss_base_url: &str,
        expiration: Duration,
    ) -> IsaCreationResponse {
        let new_isa_id = Uuid::new_v4().to_string();

        let Some(credentials) = self.self_rid_token().await else {
            return IsaCreationResponse::empty();
        };
        let Some(access_token) = credentials.get("access_token").and_then(Value::as_str) else {
            error!("authority credentials are missing access_token");
            return IsaCreationResponse::empty();
        };

        let url = format!(
            "{}/rid/v2/dss/identification_service_areas/{new_isa_id}",
            self.settings.dss_base_url
        );
        let body = json!({ "extents": extents, "uss_base_url": uss_base_url });
        let response = match self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
            .bearer_auth(access_token)
            .json(&body)
            .timeout(self.settings.http_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(url, error = %e, "error in putting to DSS URL");
                return IsaCreationResponse::empty();
            }
        };

        if response.status() != StatusCode::OK {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(%status, body = %text, "error in creating ISA in the DSS");
            return IsaCreationResponse::empty();
        }

        let parsed: IsaPutResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "could not parse DSS ISA response");
                return IsaCreationResponse::empty();
            }
        };

        info!(isa_id = %new_isa_id, "successfully created a DSS ISA");

        // Side-channel TTL marker so local components know the ISA is live.
        let isa_key = format!("isa-{}", parsed.service_area.id);
        if let Err(e) = self.store.set(&isa_key, "1").await {
            warn!(error = %e, "could not store ISA marker");
        } else if let Err(e) = self.store.expire(&isa_key, expiration).await {
            warn!(error = %e, "could not expire ISA marker");
        }

        for subscriber in &parsed.subscribers {
            self.notify_subscriber(subscriber, &parsed.service_area, &extents, &new_isa_id)
                .await;
        }

        IsaCreationResponse {
            created: true,
            service_area: Some(parsed.service_area),
            subscribers: parsed.subscribers,
        }
    }

    async fn notify_subscriber(
        &self,
        subscriber: &SubscriberToNotify,
        service_area: &IdentificationServiceArea,
        extents: &RidVolume4D,
        isa_id: &str,
    ) {
        let url = format!("{}/uss/identification_service_areas/{isa_id}", subscriber.url);
        let audience = audience_from_base_url(&subscriber.url);

        let credentials = match self.broker.get(&audience, TokenType::Rid).await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!(url, audience, error = %e, "could not get token for subscriber notification");
                return;
            }
        };
        let Some(access_token) = credentials.get("access_token").and_then(Value::as_str) else {
            error!(url, audience, "subscriber token is missing access_token");
            return;
        };

        let payload = json!({
            "service_area": service_area,
            "subscriptions": subscriber.subscriptions,
            "extents": extents,
        });

        match self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
            .bearer_auth(access_token)
            .json(&payload)
            .timeout(self.settings.http_timeout)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::NO_CONTENT => {
                info!(url, "successfully notified subscriber");
            }
            Ok(response) => {
                warn!(url, status = %response.status(), "subscriber notification was not acknowledged");
            }
            Err(e) => {
                error!(url, error = %e, "error in sending subscriber notification");
            }
        }
    }

    /// Create a DSS subscription over `vertices` and persist the returned
    /// flights record for the poller. On a DSS transport failure or
    /// rejection, degrades to the fallback peer mode.
    pub async fn create_subscription(
        &self,
        vertices: &[LatLngPoint],
        view: &str,
        request_uuid: &str,
        duration: Duration,
        is_simulated: bool,
    ) -> SubscriptionResponse {
        let Some(credentials) = self.self_rid_token().await else {
            return SubscriptionResponse::empty();
        };
        let Some(access_token) = credentials.get("access_token").and_then(Value::as_str) else {
            error!("authority credentials are missing access_token");
            return SubscriptionResponse::empty();
        };

        let new_subscription_id = Uuid::new_v4().to_string();
        let url = format!(
            "{}/rid/v2/dss/subscriptions/{new_subscription_id}",
            self.settings.dss_base_url
        );

        let now = Utc::now();
        let end = now
            + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(30));
        let time_start = RidTime::rfc3339(now);
        let time_end = RidTime::rfc3339(end);
        let uss_base_url = format!("{}/rid", self.settings.resolve_base_url());

        let extents = RidVolume4D {
            volume: RidVolume3D {
                outline_polygon: RidPolygon {
                    vertices: vertices.to_vec(),
                },
                altitude_lower: RidAltitude::w84_meters(SUBSCRIPTION_ALTITUDE_LOWER_M),
                altitude_upper: RidAltitude::w84_meters(SUBSCRIPTION_ALTITUDE_UPPER_M),
            },
            time_start: time_start.clone(),
            time_end: time_end.clone(),
        };
        let body = json!({ "extents": extents, "uss_base_url": uss_base_url });

        let response = match self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
            .bearer_auth(access_token)
            .json(&body)
            .timeout(self.settings.http_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(url, error = %e, "error in putting to subscription URL");
                return self
                    .fallback_subscription(
                        request_uuid,
                        view,
                        &time_start,
                        &time_end,
                        &time_end.value,
                        &uss_base_url,
                        "request_failed",
                    )
                    .await;
            }
        };

        if response.status() != StatusCode::OK {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(%status, body = %text, "error in creating subscription in the DSS");
            return self
                .fallback_subscription(
                    request_uuid,
                    view,
                    &time_start,
                    &time_end,
                    &time_end.value,
                    &uss_base_url,
                    "dss_rejected",
                )
                .await;
        }

        let parsed: SubscriptionPutResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "could not parse DSS subscription response");
                return SubscriptionResponse::empty();
            }
        };

        let subscription = parsed.subscription;
        let record = SubscriptionRecord {
            subscription_id: subscription.id.clone(),
            record_id: request_uuid.to_string(),
            view: view.to_string(),
            view_hash: view_hash(view),
            end_datetime: time_end.value.clone(),
            is_simulated,
            flights_record: FlightsRecord {
                service_areas: parsed.service_areas,
                subscription: subscription.clone(),
            },
        };
        if let Err(e) = self.records.create_subscription_record(&record).await {
            error!(error = %e, "could not persist subscription record");
        }

        SubscriptionResponse {
            created: true,
            dss_subscription_id: Some(subscription.id),
            notification_index: subscription.notification_index,
        }
    }

    /// Synthesize a subscription over the configured fallback peer USSes so
    /// the poller stays operational while the DSS is unreachable.
    #[allow(clippy::too_many_arguments)]
    async fn fallback_subscription(
        &self,
        request_uuid: &str,
        view: &str,
        time_start: &RidTime,
        time_end: &RidTime,
        end_datetime: &str,
        uss_base_url: &str,
        reason: &str,
    ) -> SubscriptionResponse {
        let fallback_urls = &self.settings.rid_fallback_uss_urls;
        if fallback_urls.is_empty() {
            warn!(reason, "RID DSS subscription failed; no fallback USS URLs configured");
            return SubscriptionResponse::empty();
        }

        let subscription_id = Uuid::new_v4().to_string();
        let subscription = RidSubscription {
            id: subscription_id.clone(),
            uss_base_url: uss_base_url.to_string(),
            owner: "fallback".to_string(),
            notification_index: 0,
            time_start: time_start.clone(),
            time_end: time_end.clone(),
            version: "1".to_string(),
        };
        let service_areas = fallback_urls
            .iter()
            .map(|url| IdentificationServiceArea {
                id: Uuid::new_v4().to_string(),
                uss_base_url: url.clone(),
                owner: "fallback".to_string(),
                time_start: time_start.clone(),
                time_end: time_end.clone(),
                version: "1".to_string(),
            })
            .collect();

        let record = SubscriptionRecord {
            subscription_id: subscription_id.clone(),
            record_id: request_uuid.to_string(),
            view: view.to_string(),
            view_hash: view_hash(view),
            end_datetime: end_datetime.to_string(),
            is_simulated: true,
            flights_record: FlightsRecord {
                service_areas,
                subscription,
            },
        };
        if let Err(e) = self.records.create_subscription_record(&record).await {
            error!(error = %e, "could not persist fallback subscription record");
        }

        warn!(
            reason,
            fallback_urls = %fallback_urls.join(", "),
            "RID DSS subscription failed; using fallback USS URLs"
        );
        SubscriptionResponse {
            created: true,
            dss_subscription_id: Some(subscription_id),
            notification_index: 0,
        }
    }

    /// Best-effort delete of a DSS subscription; 200 and 204 both count as
    /// success, and the local record is removed only then.
    pub async fn delete_subscription(&self, subscription_id: &str) -> bool {
        let Some(credentials) = self.self_rid_token().await else {
            return false;
        };
        let Some(access_token) = credentials.get("access_token").and_then(Value::as_str) else {
            return false;
        };

        let url = format!(
            "{}/rid/v2/dss/subscriptions/{subscription_id}",
            self.settings.dss_base_url
        );
        let response = match self
            .client
            .delete(&url)
            .header(reqwest::header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
            .bearer_auth(access_token)
            .timeout(self.settings.http_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(url, error = %e, "error in deleting DSS subscription");
                return false;
            }
        };

        if !matches!(response.status(), StatusCode::OK | StatusCode::NO_CONTENT) {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(%status, body = %text, "error in deleting subscription in the DSS");
            return false;
        }

        if let Err(e) = self.records.delete_subscription_record(subscription_id).await {
            warn!(error = %e, "could not remove local subscription record");
        }
        true
    }

    /// Poll every peer USS named in a persisted flights record and store the
    /// flights seen as observations. A missing peer token downgrades to an
    /// unauthenticated request with a warning.
    pub async fn poll_flights(&self, record: &SubscriptionRecord) {
        for service_area in &record.flights_record.service_areas {
            let flights_url = format!(
                "{}/uss/flights?view={}",
                service_area.uss_base_url, record.view
            );
            let audience = audience_from_base_url(&service_area.uss_base_url);

            let access_token = match self.broker.get(&audience, TokenType::Rid).await {
                Ok(credentials) => credentials
                    .get("access_token")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                Err(e) => {
                    warn!(audience, error = %e, "RID auth token fetch failed");
                    None
                }
            };
            if access_token.is_none() {
                warn!(audience, "RID auth token missing; requesting without auth");
            }

            let mut request = self
                .client
                .get(&flights_url)
                .header(reqwest::header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
                .timeout(self.settings.http_timeout);
            if let Some(token) = &access_token {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %flights_url, error = %e, "error polling peer USS");
                    continue;
                }
            };
            if response.status() != StatusCode::OK {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                info!(url = %flights_url, %status, body = %text, "received a non-200 from peer USS");
                continue;
            }

            let flights: PeerFlightsResponse = match response.json().await {
                Ok(flights) => flights,
                Err(e) => {
                    warn!(url = %flights_url, error = %e, "could not parse peer flights response");
                    continue;
                }
            };

            for flight in &flights.flights {
                self.ingest_peer_flight(
                    flight,
                    &service_area.uss_base_url,
                    &record.subscription_id,
                    access_token.as_deref(),
                    &flights_url,
                )
                .await;
            }
        }
    }

    async fn ingest_peer_flight(
        &self,
        flight: &PeerFlight,
        peer_base_url: &str,
        subscription_id: &str,
        access_token: Option<&str>,
        flights_url: &str,
    ) {
        self.fetch_flight_details(flight, peer_base_url, access_token)
            .await;

        let Some(current_state) = &flight.current_state else {
            error!(url = %flights_url, flight_id = %flight.id, "no current_state provided by SP on the flights URL");
            return;
        };

        let Some((lat, lng, alt)) = flight.position() else {
            error!(flight_id = %flight.id, "error in received flights data: position is incomplete");
            return;
        };

        let metadata = json!({
            "id": flight.id,
            "simulated": flight.simulated,
            "aircraft_type": flight.aircraft_type,
            "subscription_id": subscription_id,
            "current_state": current_state,
            "recent_positions": flight.recent_positions,
        });
        let observation = Observation {
            session_id: subscription_id.to_string(),
            icao_address: flight.id.clone(),
            traffic_source: 11,
            source_type: 1,
            lat_dd: lat,
            lon_dd: lng,
            altitude_mm: alt,
            metadata,
        };
        debug!(flight_id = %flight.id, "writing flight remote-id data");
        if let Err(e) = self.records.write_observation(&observation).await {
            error!(flight_id = %flight.id, error = %e, "could not write flight observation");
        }
    }

    async fn fetch_flight_details(
        &self,
        flight: &PeerFlight,
        peer_base_url: &str,
        access_token: Option<&str>,
    ) {
        match self.records.flight_details_exist(&flight.id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(flight_id = %flight.id, error = %e, "could not check for cached flight details");
                return;
            }
        }

        let details_url = format!("{peer_base_url}/uss/flights/{}/details", flight.id);
        let mut request = self
            .client
            .get(&details_url)
            .header(reqwest::header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
            .timeout(self.settings.http_timeout);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %details_url, error = %e, "error retrieving flight details");
                return;
            }
        };
        if response.status() != StatusCode::OK {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            info!(flight_id = %flight.id, %status, body = %text, "error in retrieving flight details");
            return;
        }

        let Ok(body) = response.json::<Value>().await else {
            warn!(url = %details_url, "could not parse flight details response");
            return;
        };
        let Some(details) = body.get("details") else {
            warn!(url = %details_url, "flight details response is missing the details member");
            return;
        };

        info!(flight_id = %flight.id, "retrieved flight details");
        if let Err(e) = self.records.save_flight_details(&flight.id, details).await {
            error!(flight_id = %flight.id, error = %e, "could not store flight details");
        }
    }

    /// Poll peers for every unexpired persisted subscription.
    pub async fn poll_active_subscriptions(&self) {
        let records = match self.records.active_subscription_records().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not list active subscription records");
                return;
            }
        };
        for record in records {
            self.poll_flights(&record).await;
        }
    }
}

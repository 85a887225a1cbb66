//! Scope-enforcing gate for inbound requests.
//!
//! Handlers call [`ScopeGate::enforce`] with their required-scopes policy;
//! a failed check yields the ready-to-return error `Response`.

use super::jwks::{JwksCache, JwksFetch};
use crate::config::Settings;
use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse as _, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;

pub struct ScopeGate {
    jwks: JwksCache,
    fetcher: Arc<dyn JwksFetch>,
    passport_jwks_url: String,
    dss_jwks_url: String,
    api_identifier: String,
    allowed_issuers: Vec<String>,
    bypass_verification: bool,
    is_debug: bool,
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "message": "You don't have access to this resource" })),
    )
        .into_response()
}

impl ScopeGate {
    #[must_use]
    pub fn new(settings: &Settings, jwks: JwksCache, fetcher: Arc<dyn JwksFetch>) -> Self {
        Self {
            jwks,
            fetcher,
            passport_jwks_url: settings.passport_jwks_url(),
            dss_jwks_url: settings.dss_auth_jwks_endpoint.clone(),
            api_identifier: settings.passport_audience.clone(),
            allowed_issuers: settings.allowed_issuers(),
            bypass_verification: settings.bypass_auth_token_verification,
            is_debug: settings.is_debug,
        }
    }

    /// Enforce the required-scopes policy on an inbound request.
    ///
    /// # Errors
    ///
    /// Returns the response to send back: 401 for credential problems, 403
    /// for insufficient scope, 503 when the required key server is
    /// unreachable.
    pub async fn enforce(
        &self,
        headers: &HeaderMap,
        required_scopes: &[&str],
        allow_any: bool,
    ) -> Result<(), Response> {
        let Some(token) = bearer_token(headers) else {
            return Err(detail(
                StatusCode::UNAUTHORIZED,
                "Authentication credentials were not provided",
            ));
        };

        let Ok(unverified_header) = jsonwebtoken::decode_header(&token) else {
            return Err(detail(
                StatusCode::UNAUTHORIZED,
                "Bearer token could not be decoded properly",
            ));
        };

        if self.bypass_verification && !self.is_debug {
            warn!("BYPASS_AUTH_TOKEN_VERIFICATION is set but IS_DEBUG is false; ignoring bypass");
        }
        if self.bypass_verification && self.is_debug {
            return handle_bypass(&token, required_scopes);
        }

        let passport_keys = match self
            .jwks
            .get(&self.passport_jwks_url, self.fetcher.as_ref(), false, true, "Passport")
            .await
        {
            Ok((_, keys)) => keys,
            Err(_) => {
                return Err(detail(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!(
                        "Public Key Server necessary to validate the token could not be reached, tried to reach URL: {}",
                        self.passport_jwks_url
                    ),
                ));
            }
        };
        let dss_keys = self.optional_dss_keys(false).await;

        let mut public_keys = passport_keys;
        public_keys.extend(dss_keys);

        let kid = unverified_header.kid.unwrap_or_default();
        if !public_keys.contains_key(&kid) {
            // One forced refresh before rejecting: the signer may have
            // rotated keys since the cache was filled.
            if let Ok((_, refreshed)) = self
                .jwks
                .get(&self.passport_jwks_url, self.fetcher.as_ref(), true, true, "Passport")
                .await
            {
                public_keys = refreshed;
            }
            public_keys.extend(self.optional_dss_keys(true).await);
        }
        let Some(key) = public_keys.get(&kid) else {
            return Err(detail(
                StatusCode::UNAUTHORIZED,
                format!(
                    "Error in parsing public keys, the signing key id {kid} is not present in JWKS"
                ),
            ));
        };

        let decoded = match decode_verified(&token, key, &self.api_identifier) {
            Ok(claims) => claims,
            Err(e) => {
                error!(error = %e, "token verification failed");
                return Err((
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "detail": "Invalid token", "error details": e.to_string() })),
                )
                    .into_response());
            }
        };

        let issuer = decoded
            .get("iss")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_end_matches('/');
        if !self.allowed_issuers.iter().any(|allowed| allowed == issuer) {
            return Err(detail(StatusCode::UNAUTHORIZED, "Invalid token issuer"));
        }

        let granted = scope_set(&decoded);
        let satisfied = if allow_any {
            required_scopes.iter().any(|s| granted.contains(*s))
        } else {
            required_scopes.iter().all(|s| granted.contains(*s))
        };
        if satisfied { Ok(()) } else { Err(forbidden()) }
    }

    async fn optional_dss_keys(&self, force_refresh: bool) -> HashMap<String, DecodingKey> {
        match self
            .jwks
            .get(&self.dss_jwks_url, self.fetcher.as_ref(), force_refresh, false, "DSS")
            .await
        {
            Ok((_, keys)) => keys,
            Err(_) => {
                info!(
                    url = %self.dss_jwks_url,
                    "DSS public key server could not be reached; tokens for DSS operations will not be validated"
                );
                HashMap::new()
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authz = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = authz.strip_prefix("Bearer ").map(str::trim)?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn decode_verified(token: &str, key: &DecodingKey, audience: &str) -> anyhow::Result<Value> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_required_spec_claims(&["exp", "iss", "aud"]);
    validation.set_audience(&[audience]);
    let data = jsonwebtoken::decode::<Value>(token, key, &validation)?;
    Ok(data.claims)
}

fn scope_set(claims: &Value) -> HashSet<String> {
    claims
        .get("scope")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Debug-only path: check scopes and claim shape without verifying the
/// signature.
fn handle_bypass(token: &str, required_scopes: &[&str]) -> Result<(), Response> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let Ok(data) =
        jsonwebtoken::decode::<Value>(token, &DecodingKey::from_secret(&[]), &validation)
    else {
        return Err(detail(StatusCode::UNAUTHORIZED, "Invalid token provided"));
    };
    let claims = data.claims;

    let granted = scope_set(&claims);
    if !required_scopes.iter().all(|s| granted.contains(*s)) {
        return Err(forbidden());
    }

    let issuer = claims.get("iss").and_then(Value::as_str).unwrap_or_default();
    if issuer.is_empty() {
        return Err(detail(
            StatusCode::UNAUTHORIZED,
            "Incomplete token provided, issuer (iss) claim must be present and should not be empty",
        ));
    }
    if issuer != "dummy" {
        let valid_url = Url::parse(issuer)
            .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some());
        if !valid_url {
            return Err(detail(
                StatusCode::UNAUTHORIZED,
                "Issuer (iss) claim is not a valid URL",
            ));
        }
    }

    let has_audience = match claims.get("aud") {
        Some(Value::String(aud)) => !aud.is_empty(),
        Some(Value::Array(auds)) => !auds.is_empty(),
        _ => false,
    };
    if !has_audience {
        return Err(detail(
            StatusCode::UNAUTHORIZED,
            "Incomplete token provided, audience claim must be present and should not be empty",
        ));
    }

    Ok(())
}

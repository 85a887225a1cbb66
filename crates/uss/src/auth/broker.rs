//! Authority token broker: obtains, scopes, and caches OAuth2
//! client-credentials tokens per `(audience, token type)`.

use crate::config::Settings;
use crate::store::KeyValueStore;
use anyhow::Context as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};
use url::Url;

/// Cached credentials are served for this long after they were obtained.
const TOKEN_FRESHNESS_MINUTES: i64 = 58;

/// The closed set of credential scopes this USS requests from the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Rid,
    Scd,
    Constraints,
}

impl TokenType {
    /// Scope set submitted for this token type, space-joined on the wire.
    #[must_use]
    pub fn scopes(self) -> &'static [&'static str] {
        match self {
            Self::Rid => &["rid.service_provider", "rid.display_provider"],
            Self::Scd => &["utm.strategic_coordination", "utm.conformance_monitoring_sa"],
            Self::Constraints => &["utm.constraint_processing"],
        }
    }

    /// Suffix appended to the audience to form the cache key.
    #[must_use]
    pub fn cache_suffix(self) -> &'static str {
        match self {
            Self::Rid => "_auth_rid_token",
            Self::Scd => "_auth_scd_token",
            Self::Constraints => "_auth_constraints_token",
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid token type: {0}")]
pub struct InvalidTokenType(pub String);

impl FromStr for TokenType {
    type Err = InvalidTokenType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rid" => Ok(Self::Rid),
            "scd" => Ok(Self::Scd),
            "constraints" => Ok(Self::Constraints),
            other => Err(InvalidTokenType(other.to_string())),
        }
    }
}

/// How credentials are requested from the token endpoint.
///
/// The InterUSS dummy-oauth commonly used for local DSS deployments exposes a
/// GET /token endpoint; real authorities speak OAuth2 form-urlencoded POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTransport {
    PostForm,
    GetQuery,
}

/// Pick the transport from the endpoint host: `local_`/`local-` prefixed
/// hosts indicate a dummy-oauth.
#[must_use]
pub fn select_transport(token_url: &Url) -> TokenTransport {
    let scheme_ok = matches!(token_url.scheme(), "http" | "https");
    let local = token_url
        .host_str()
        .is_some_and(|h| h.starts_with("local_") || h.starts_with("local-"));
    if scheme_ok && local {
        TokenTransport::GetQuery
    } else {
        TokenTransport::PostForm
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    credentials: Value,
    created_at: DateTime<Utc>,
}

pub struct TokenBroker {
    store: Arc<dyn KeyValueStore>,
    client: reqwest::Client,
    timeout: Duration,
    token_url: String,
    dss_self_audience: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl TokenBroker {
    /// Build a broker over the configured token endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: &Settings, store: Arc<dyn KeyValueStore>) -> anyhow::Result<Self> {
        // Token endpoints return results directly; never follow redirects.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build token http client")?;
        Ok(Self {
            store,
            client,
            timeout: settings.http_timeout,
            token_url: settings.token_url(),
            dss_self_audience: settings.dss_self_audience.clone(),
            client_id: settings.auth_dss_client_id.clone(),
            client_secret: settings.auth_dss_client_secret.clone(),
        })
    }

    /// Return credentials for `(audience, token_type)`, served from the
    /// store when obtained less than 58 minutes ago, freshly requested and
    /// cached otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-JSON token response.
    /// A JSON error body from the authority is returned as-is; callers check
    /// for an `error` member.
    pub async fn get(&self, audience: &str, token_type: TokenType) -> anyhow::Result<Value> {
        let cache_key = format!("{audience}{}", token_type.cache_suffix());

        if let Some(raw) = self.store.get(&cache_key).await?
            && let Ok(cached) = serde_json::from_str::<CachedToken>(&raw)
            && Utc::now() < cached.created_at + ChronoDuration::minutes(TOKEN_FRESHNESS_MINUTES)
        {
            return Ok(cached.credentials);
        }

        let credentials = self.request_credentials(audience, token_type).await?;

        let record = CachedToken {
            credentials: credentials.clone(),
            created_at: Utc::now(),
        };
        self.store
            .set(&cache_key, &serde_json::to_string(&record)?)
            .await?;
        self.store
            .expire(
                &cache_key,
                Duration::from_secs(60 * TOKEN_FRESHNESS_MINUTES as u64),
            )
            .await?;

        Ok(credentials)
    }

    async fn request_credentials(
        &self,
        audience: &str,
        token_type: TokenType,
    ) -> anyhow::Result<Value> {
        let scopes = token_type.scopes().join(" ");
        let issuer = (audience == "localhost").then_some("localhost");
        let token_url = Url::parse(&self.token_url).context("parse token endpoint URL")?;

        if select_transport(&token_url) == TokenTransport::GetQuery {
            return self
                .request_via_get(token_url, audience, &scopes, issuer)
                .await;
        }

        if self.client_id.is_none() || self.client_secret.is_none() {
            warn!("AUTH_DSS_CLIENT_ID/AUTH_DSS_CLIENT_SECRET not set; requesting token without client credentials");
        }
        let form = [
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone().unwrap_or_default()),
            ("client_secret", self.client_secret.clone().unwrap_or_default()),
            ("audience", audience.to_string()),
            ("scope", scopes.clone()),
        ];

        let response = self
            .client
            .post(token_url.clone())
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .context("POST token request")?;
        let status = response.status();
        let body = response.text().await.context("read token response")?;

        if status == reqwest::StatusCode::OK {
            match serde_json::from_str::<Value>(&body) {
                Ok(credentials) => return Ok(credentials),
                Err(e) => {
                    error!(url = %token_url, error = %e, body = truncate(&body, 200), "failed to parse token response JSON");
                }
            }
        } else {
            error!(
                audience,
                scope = %scopes,
                url = %token_url,
                status = %status,
                body = truncate(&body, 200),
                "token POST failed; falling back to GET /token"
            );
        }

        // The configured endpoint doesn't speak OAuth2 POST; fall back to the
        // dummy-oauth GET /token on the same origin.
        let mut get_url = token_url;
        get_url.set_path("/token");
        get_url.set_query(None);
        self.request_via_get(get_url, audience, &scopes, issuer).await
    }

    async fn request_via_get(
        &self,
        url: Url,
        audience: &str,
        scopes: &str,
        issuer: Option<&str>,
    ) -> anyhow::Result<Value> {
        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "client_credentials".to_string()),
            (
                "intended_audience",
                self.dss_self_audience.clone().unwrap_or_default(),
            ),
            ("scope", scopes.to_string()),
        ];
        if let Some(issuer) = issuer {
            params.push(("issuer", issuer.to_string()));
        }

        let response = self
            .client
            .get(url.clone())
            .query(&params)
            .timeout(self.timeout)
            .send()
            .await
            .context("GET token request")?;
        let status = response.status();
        let body = response.text().await.context("read token response")?;

        if status != reqwest::StatusCode::OK {
            error!(
                audience,
                scope = %scopes,
                url = %url,
                status = %status,
                body = truncate(&body, 200),
                "failed to get token"
            );
        }

        serde_json::from_str(&body)
            .with_context(|| format!("parse token response JSON (status {status})"))
    }
}

fn truncate(s: &str, n: usize) -> &str {
    s.get(..n).unwrap_or(s)
}

use blender_http_safe::{DownloadSettings, FetchSettings, UrlPolicy};
use std::path::Path;
use std::time::Duration;

/// Service configuration, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_timeout: Duration,
    pub http_max_redirects: usize,
    pub http_max_download_bytes: usize,
    pub jwks_cache_ttl_s: f64,
    pub jwks_backoff_initial_s: f64,
    pub jwks_backoff_max_s: f64,
    pub geozone_max_download_bytes: usize,
    pub geozone_max_redirects: usize,
    pub dss_base_url: String,
    pub dss_auth_url: String,
    pub dss_auth_token_endpoint: String,
    pub dss_auth_jwks_endpoint: String,
    pub dss_auth_issuer: Option<String>,
    pub dss_self_audience: Option<String>,
    pub passport_url: String,
    pub passport_issuer: Option<String>,
    pub passport_audience: String,
    pub auth_dss_client_id: Option<String>,
    pub auth_dss_client_secret: Option<String>,
    pub flightblender_fqdn: Option<String>,
    pub rid_fallback_uss_urls: Vec<String>,
    pub bypass_auth_token_verification: bool,
    pub is_debug: bool,
    pub allow_private_networks: bool,
    pub redis_url: String,
}

impl Settings {
    /// Read every setting from the environment, applying defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            http_timeout: Duration::from_secs_f64(env_f64("HTTP_TIMEOUT_S", 10.0)),
            http_max_redirects: env_usize("HTTP_MAX_REDIRECTS", 3),
            http_max_download_bytes: env_usize("HTTP_MAX_DOWNLOAD_BYTES", 1024 * 1024),
            jwks_cache_ttl_s: env_f64("JWKS_CACHE_TTL_S", 300.0),
            jwks_backoff_initial_s: env_f64("JWKS_FETCH_BACKOFF_INITIAL_S", 1.0),
            jwks_backoff_max_s: env_f64("JWKS_FETCH_BACKOFF_MAX_S", 60.0),
            geozone_max_download_bytes: env_usize("GEOZONE_MAX_DOWNLOAD_BYTES", 5_000_000),
            geozone_max_redirects: env_usize("GEOZONE_MAX_REDIRECTS", 3),
            dss_base_url: normalize_base_url(
                env_var("DSS_BASE_URL"),
                "http://local-dss-core:8082",
            ),
            dss_auth_url: env_var("DSS_AUTH_URL")
                .unwrap_or_else(|| "http://host.docker.internal:8085".to_string()),
            dss_auth_token_endpoint: env_var("DSS_AUTH_TOKEN_ENDPOINT")
                .unwrap_or_else(|| "/auth/token".to_string()),
            dss_auth_jwks_endpoint: env_var("DSS_AUTH_JWKS_ENDPOINT").unwrap_or_else(|| {
                "http://local.test:9000/.well-known/jwks.json".to_string()
            }),
            dss_auth_issuer: env_var("DSS_AUTH_ISSUER"),
            dss_self_audience: env_var("DSS_SELF_AUDIENCE"),
            passport_url: env_var("PASSPORT_URL")
                .unwrap_or_else(|| "http://local.test:9000".to_string()),
            passport_issuer: env_var("PASSPORT_ISSUER"),
            passport_audience: env_var("PASSPORT_AUDIENCE")
                .unwrap_or_else(|| "testflight.flightblender.com".to_string()),
            auth_dss_client_id: env_var("AUTH_DSS_CLIENT_ID"),
            auth_dss_client_secret: env_var("AUTH_DSS_CLIENT_SECRET"),
            flightblender_fqdn: env_var("FLIGHTBLENDER_FQDN"),
            rid_fallback_uss_urls: parse_fallback_uss_urls(
                &env_var("RID_FALLBACK_USS_URLS").unwrap_or_default(),
            ),
            bypass_auth_token_verification: env_flag("BYPASS_AUTH_TOKEN_VERIFICATION"),
            is_debug: env_flag("IS_DEBUG"),
            allow_private_networks: env_flag("HTTP_ALLOW_PRIVATE_NETWORKS"),
            redis_url: env_var("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
        }
    }

    /// The token endpoint for the authority (DSS auth server).
    #[must_use]
    pub fn token_url(&self) -> String {
        format!(
            "{}{}",
            self.dss_auth_url.trim_end_matches('/'),
            self.dss_auth_token_endpoint
        )
    }

    /// The Passport JWKS endpoint (trailing slash on the base stripped).
    #[must_use]
    pub fn passport_jwks_url(&self) -> String {
        format!(
            "{}/.well-known/jwks.json",
            self.passport_url.trim_end_matches('/')
        )
    }

    /// Issuers accepted on inbound tokens, trailing slashes stripped.
    #[must_use]
    pub fn allowed_issuers(&self) -> Vec<String> {
        let mut issuers = Vec::new();
        let passport = self
            .passport_issuer
            .clone()
            .unwrap_or_else(|| self.passport_url.clone());
        issuers.push(passport.trim_end_matches('/').to_string());
        if let Some(dss) = &self.dss_auth_issuer {
            issuers.push(dss.trim_end_matches('/').to_string());
        }
        issuers
    }

    /// URL policy for outbound JSON ingestion. Debug deployments may speak
    /// plain http and reach private networks; production requires https to
    /// public addresses.
    #[must_use]
    pub fn url_policy(&self) -> UrlPolicy {
        UrlPolicy {
            allow_http: self.is_debug,
            require_https: !self.is_debug,
            allow_private_networks: self.allow_private_networks,
        }
    }

    #[must_use]
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            timeout: self.http_timeout,
            max_redirects: self.http_max_redirects,
            max_download_bytes: self.http_max_download_bytes,
            policy: self.url_policy(),
        }
    }

    #[must_use]
    pub fn geozone_settings(&self) -> DownloadSettings {
        DownloadSettings {
            timeout: self.http_timeout,
            max_redirects: self.geozone_max_redirects,
            max_download_bytes: self.geozone_max_download_bytes,
            policy: self.url_policy(),
        }
    }

    /// The base URL peers use to reach this USS. `FLIGHTBLENDER_FQDN` wins;
    /// a loopback FQDN inside a container falls back to the compose-network
    /// service name.
    #[must_use]
    pub fn resolve_base_url(&self) -> String {
        let mut base = self
            .flightblender_fqdn
            .clone()
            .unwrap_or_else(|| "http://flight-blender:8000".to_string());

        if (base.starts_with("http://localhost") || base.starts_with("http://127.0.0.1"))
            && Path::new("/.dockerenv").exists()
        {
            base = "http://flight-blender:8000".to_string();
        }

        base.trim_end_matches('/').to_string()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_var(name)
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env_var(name)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn normalize_base_url(value: Option<String>, fallback: &str) -> String {
    value
        .unwrap_or_else(|| fallback.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Parse the comma-separated fallback USS list: entries are trimmed, given
/// an `http://` scheme when none is present, and stripped of trailing
/// slashes.
#[must_use]
pub fn parse_fallback_uss_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let entry = if entry.starts_with("http://") || entry.starts_with("https://") {
                entry.to_string()
            } else {
                format!("http://{entry}")
            };
            entry.trim_end_matches('/').to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_urls_get_scheme_and_lose_trailing_slash() {
        let urls = parse_fallback_uss_urls("https://uss1.example/, uss2.example , ,");
        assert_eq!(urls, vec!["https://uss1.example", "http://uss2.example"]);
    }

    #[test]
    fn fallback_urls_empty_when_unset() {
        assert!(parse_fallback_uss_urls("").is_empty());
    }
}

//! Bounded, redirect-validated JSON GETs.
//!
//! Every failure path logs a warning and returns `None`; callers that need to
//! distinguish failure modes use [`crate::download`] instead.

use crate::safety::{UrlPolicy, sanitize_reqwest_error, validate_public_url};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::warn;
use url::Url;

const REDIRECT_STATUSES: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_download_bytes: usize,
    pub policy: UrlPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_redirects: 3,
            max_download_bytes: 1024 * 1024,
            policy: UrlPolicy::strict(),
        }
    }
}

/// Build a client suitable for [`fetch_json`]: redirects are handled manually
/// so every hop can be re-vetted.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn no_redirect_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

pub(crate) fn is_json_content_type(content_type: &str) -> bool {
    // JWKS endpoints commonly use application/jwk-set+json; accept anything
    // that indicates JSON.
    content_type.to_ascii_lowercase().contains("json")
}

/// Fetch JSON from a URL with SSRF protections, redirect validation, a
/// per-request timeout, and a size limit. Returns the parsed JSON object on
/// success, otherwise `None`. The root must be an object; anything else is
/// treated as a failure.
///
/// `client` must not follow redirects on its own (see [`no_redirect_client`]).
pub async fn fetch_json(
    client: &reqwest::Client,
    url: &str,
    settings: &FetchSettings,
) -> Option<Map<String, Value>> {
    let mut current_url = url.to_string();

    for hop in 0..=settings.max_redirects {
        if let Err(reason) = validate_public_url(&current_url, &settings.policy).await {
            warn!(url = %current_url, %reason, "blocked URL");
            return None;
        }

        let response = match client
            .get(&current_url)
            .timeout(settings.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %current_url, error = %sanitize_reqwest_error(&e), "HTTP fetch failed");
                return None;
            }
        };

        if REDIRECT_STATUSES.contains(&response.status()) {
            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                warn!(url = %current_url, "redirect without Location");
                return None;
            };
            if hop >= settings.max_redirects {
                warn!(url = %url, "too many redirects");
                return None;
            }
            let Ok(base) = Url::parse(&current_url) else {
                return None;
            };
            let Ok(next_url) = base.join(location) else {
                warn!(url = %current_url, location, "unresolvable redirect target");
                return None;
            };
            current_url = next_url.to_string();
            continue;
        }

        if response.status() != StatusCode::OK {
            warn!(url = %current_url, status = %response.status(), "non-200 response");
            return None;
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            && !is_json_content_type(content_type)
        {
            warn!(url = %current_url, content_type, "non-JSON Content-Type");
            return None;
        }

        let bytes = read_body_limited(response, settings.max_download_bytes).await?;
        let parsed: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(url = %current_url, error = %e, "failed to parse JSON");
                return None;
            }
        };

        return match parsed {
            Value::Object(map) => Some(map),
            _ => {
                warn!(url = %current_url, "expected JSON object at document root");
                None
            }
        };
    }

    None
}

async fn read_body_limited(mut response: reqwest::Response, max: usize) -> Option<Vec<u8>> {
    let url = response.url().clone();
    let mut out: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if out.len().saturating_add(chunk.len()) > max {
                    warn!(url = %url, limit = max, "response too large");
                    return None;
                }
                out.extend_from_slice(&chunk);
            }
            Ok(None) => return Some(out),
            Err(e) => {
                warn!(url = %url, error = %sanitize_reqwest_error(&e), "failed reading response body");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_content_types() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/jwk-set+json; charset=utf-8"));
        assert!(is_json_content_type("APPLICATION/JSON"));
        assert!(!is_json_content_type("text/html"));
    }
}

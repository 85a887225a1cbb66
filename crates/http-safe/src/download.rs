//! Taxonomic JSON downloads for ingestion boundaries.
//!
//! Same engine as [`crate::fetch`], but every refusal carries a stable,
//! operator-visible tag so callers can distinguish a blocked URL
//! (misconfiguration / hostile input) from an upstream outage.

use crate::fetch::is_json_content_type;
use crate::safety::{UrlPolicy, UrlRejection, sanitize_reqwest_error, validate_public_url};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REDIRECT_STATUSES: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("url_not_allowed:{0}")]
    UrlNotAllowed(UrlRejection),
    #[error("redirect_without_location")]
    RedirectWithoutLocation,
    #[error("http_status:{0}")]
    HttpStatus(u16),
    #[error("response_too_large")]
    ResponseTooLarge,
    #[error("unsupported_content_type")]
    UnsupportedContentType,
    #[error("invalid_json")]
    InvalidJson,
    #[error("json_not_object")]
    JsonNotObject,
    #[error("too_many_redirects")]
    TooManyRedirects,
    #[error("request_failed:{0}")]
    RequestFailed(String),
}

impl DownloadError {
    /// A rejection is a policy decision about the URL itself, as opposed to
    /// a failure of the fetch. Ingestion boundaries report rejections as
    /// `Rejected` and everything else as `Error`.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::UrlNotAllowed(_))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_download_bytes: usize,
    pub policy: UrlPolicy,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_redirects: 3,
            max_download_bytes: 5_000_000,
            policy: UrlPolicy::strict(),
        }
    }
}

/// Download and parse a JSON object, re-vetting the URL on every redirect
/// hop and enforcing the size cap both on the advertised `Content-Length`
/// and on the streamed body.
///
/// `client` must not follow redirects on its own
/// (see [`crate::fetch::no_redirect_client`]).
///
/// # Errors
///
/// Returns a [`DownloadError`] naming the first step that refused.
pub async fn download_json(
    client: &reqwest::Client,
    url: &str,
    settings: &DownloadSettings,
) -> Result<Value, DownloadError> {
    let mut current_url = url.to_string();

    for _hop in 0..=settings.max_redirects {
        validate_public_url(&current_url, &settings.policy)
            .await
            .map_err(DownloadError::UrlNotAllowed)?;

        let response = client
            .get(&current_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(settings.timeout)
            .send()
            .await
            .map_err(|e| DownloadError::RequestFailed(sanitize_reqwest_error(&e)))?;

        if REDIRECT_STATUSES.contains(&response.status()) {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(DownloadError::RedirectWithoutLocation)?;
            let base = Url::parse(&current_url)
                .map_err(|_| DownloadError::UrlNotAllowed(UrlRejection::InvalidUrl))?;
            let next_url = base
                .join(location)
                .map_err(|_| DownloadError::UrlNotAllowed(UrlRejection::InvalidUrl))?;
            current_url = next_url.to_string();
            continue;
        }

        if response.status() != StatusCode::OK {
            return Err(DownloadError::HttpStatus(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len > settings.max_download_bytes as u64
        {
            return Err(DownloadError::ResponseTooLarge);
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            && !is_json_content_type(content_type)
        {
            return Err(DownloadError::UnsupportedContentType);
        }

        let raw = read_body_capped(response, settings.max_download_bytes).await?;

        let text = std::str::from_utf8(&raw).map_err(|_| DownloadError::InvalidJson)?;
        let parsed: Value = serde_json::from_str(text).map_err(|_| DownloadError::InvalidJson)?;
        if !parsed.is_object() {
            return Err(DownloadError::JsonNotObject);
        }
        return Ok(parsed);
    }

    Err(DownloadError::TooManyRedirects)
}

async fn read_body_capped(
    mut response: reqwest::Response,
    max: usize,
) -> Result<Vec<u8>, DownloadError> {
    let mut out: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if out.len().saturating_add(chunk.len()) > max {
                    return Err(DownloadError::ResponseTooLarge);
                }
                out.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok(out),
            Err(e) => return Err(DownloadError::RequestFailed(sanitize_reqwest_error(&e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_tags_are_stable() {
        assert_eq!(
            DownloadError::UrlNotAllowed(UrlRejection::IpNotAllowed).to_string(),
            "url_not_allowed:ip_not_allowed"
        );
        assert_eq!(DownloadError::HttpStatus(503).to_string(), "http_status:503");
        assert_eq!(
            DownloadError::RedirectWithoutLocation.to_string(),
            "redirect_without_location"
        );
        assert_eq!(DownloadError::ResponseTooLarge.to_string(), "response_too_large");
        assert_eq!(
            DownloadError::UnsupportedContentType.to_string(),
            "unsupported_content_type"
        );
        assert_eq!(DownloadError::InvalidJson.to_string(), "invalid_json");
        assert_eq!(DownloadError::JsonNotObject.to_string(), "json_not_object");
        assert_eq!(DownloadError::TooManyRedirects.to_string(), "too_many_redirects");
        assert_eq!(
            DownloadError::RequestFailed("boom".into()).to_string(),
            "request_failed:boom"
        );
    }

    #[test]
    fn only_url_rejections_are_rejections() {
        assert!(DownloadError::UrlNotAllowed(UrlRejection::LocalhostNotAllowed).is_rejection());
        assert!(!DownloadError::HttpStatus(404).is_rejection());
        assert!(!DownloadError::InvalidJson.is_rejection());
    }
}

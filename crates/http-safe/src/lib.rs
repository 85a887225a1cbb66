//! SSRF-hardened outbound HTTP for the Flight Blender service.
//!
//! Three layers, smallest first:
//! - [`safety`]: URL vetting (scheme/host/IP-range checks, DNS resolution).
//! - [`fetch`]: bounded, redirect-validated JSON GETs that fail soft (`None`).
//! - [`download`]: the same engine with a stable error taxonomy, used by
//!   ingestion paths that must report *why* a fetch was refused.

pub mod download;
pub mod fetch;
pub mod safety;

pub use download::{DownloadError, DownloadSettings, download_json};
pub use fetch::{FetchSettings, fetch_json, no_redirect_client};
pub use safety::{UrlPolicy, UrlRejection, validate_public_url};

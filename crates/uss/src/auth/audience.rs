use url::{Host, Url};

/// Domains that mark a peer as a local/compose deployment; tokens for those
/// peers are requested with the `localhost` audience.
const LOCAL_DOMAINS: [&str; 3] = ["localhost", "internal", "localutm"];

/// Derive the token audience for a peer USS from its base URL.
///
/// IP literals, single-label hosts, unparseable URLs, and hosts whose last
/// or second-to-last label is a local marker (`host.docker.internal`,
/// `uss1.localutm`, ...) all map to `localhost`. Every other host is its own
/// audience, lowercased.
#[must_use]
pub fn audience_from_base_url(base_url: &str) -> String {
    let Ok(url) = Url::parse(base_url) else {
        return "localhost".to_string();
    };

    let Some(Host::Domain(domain)) = url.host() else {
        // Missing host or an IP literal.
        return "localhost".to_string();
    };

    let host = domain.to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 1 {
        return "localhost".to_string();
    }

    let tail = &labels[labels.len() - 2..];
    if tail.iter().any(|label| LOCAL_DOMAINS.contains(label)) {
        return "localhost".to_string();
    }

    host
}

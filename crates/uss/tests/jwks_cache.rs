//! JWKS verifier cache semantics: TTL, backoff, stale-on-error, and reset
//! on success, driven through the fetch seam with a deterministic clock.

use async_trait::async_trait;
use blender_test_support::TestRsaKey;
use blender_uss::auth::jwks::{JwksCache, JwksFetch};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Replays a scripted sequence of fetch outcomes and counts calls.
struct SeqFetcher {
    responses: Mutex<VecDeque<Result<Value, String>>>,
    calls: AtomicUsize,
}

impl SeqFetcher {
    fn new(responses: Vec<Result<Value, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JwksFetch for SeqFetcher {
    async fn fetch(&self, _url: &str) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .pop_front()
            .expect("no more scripted responses");
        next.map_err(|message| anyhow::anyhow!(message))
    }
}

const URL: &str = "http://jwks.example/.well-known/jwks.json";

fn jwks_doc() -> Value {
    TestRsaKey::generate("k1").expect("generate test key").jwks()
}

#[tokio::test]
async fn caches_within_ttl() {
    let cache = JwksCache::new(100.0, 1.0, 60.0);
    let fetcher = SeqFetcher::new(vec![Ok(jwks_doc())]);

    let (_, keys1) = cache
        .get_at(URL, &fetcher, false, true, "Test", 1000.0)
        .await
        .expect("first fetch succeeds");
    let (_, keys2) = cache
        .get_at(URL, &fetcher, false, true, "Test", 1050.0)
        .await
        .expect("second call served from cache");

    assert_eq!(fetcher.calls(), 1);
    assert!(keys1.contains_key("k1"));
    assert!(keys2.contains_key("k1"));
}

#[tokio::test]
async fn backoff_skips_fetch_when_no_cache() {
    let cache = JwksCache::new(300.0, 1.0, 60.0);
    let fetcher = SeqFetcher::new(vec![Err("timeout".to_string())]);

    assert!(
        cache
            .get_at(URL, &fetcher, false, true, "Test", 1000.0)
            .await
            .is_err(),
        "required fetch fails"
    );
    // Retry lands inside the backoff window and must not hit the network.
    assert!(
        cache
            .get_at(URL, &fetcher, false, true, "Test", 1000.5)
            .await
            .is_err(),
        "still failing while in backoff"
    );

    assert_eq!(fetcher.calls(), 1);
    // next_retry_at grew by exactly the initial backoff; backoff doubled.
    assert_eq!(cache.backoff_state(URL), Some((1001.0, 2.0)));
}

#[tokio::test]
async fn optional_fetch_in_backoff_returns_empty() {
    let cache = JwksCache::new(300.0, 1.0, 60.0);
    let fetcher = SeqFetcher::new(vec![Err("refused".to_string())]);

    let (jwks, keys) = cache
        .get_at(URL, &fetcher, false, false, "DSS", 1000.0)
        .await
        .expect("optional fetch never errors");
    assert!(keys.is_empty());
    assert_eq!(jwks, serde_json::json!({}));

    let (_, keys) = cache
        .get_at(URL, &fetcher, false, false, "DSS", 1000.5)
        .await
        .expect("optional fetch in backoff returns empty");
    assert!(keys.is_empty());
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn fetch_failure_returns_stale_cached_keys() {
    let cache = JwksCache::new(1.0, 1.0, 60.0);
    let fetcher = SeqFetcher::new(vec![Ok(jwks_doc()), Err("timeout".to_string())]);

    let (_, keys1) = cache
        .get_at(URL, &fetcher, false, true, "Test", 1000.0)
        .await
        .expect("first fetch succeeds");
    // TTL has lapsed; the refresh fails but the stale document is served.
    let (_, keys2) = cache
        .get_at(URL, &fetcher, false, true, "Test", 1002.0)
        .await
        .expect("stale document served on failure");

    assert_eq!(fetcher.calls(), 2);
    assert!(keys1.contains_key("k1"));
    assert!(keys2.contains_key("k1"));
}

#[tokio::test]
async fn force_refresh_bypasses_backoff() {
    let cache = JwksCache::new(300.0, 1.0, 60.0);
    let fetcher = SeqFetcher::new(vec![Err("timeout".to_string()), Ok(jwks_doc())]);

    assert!(
        cache
            .get_at(URL, &fetcher, false, true, "Test", 1000.0)
            .await
            .is_err(),
        "first fetch fails"
    );
    let (_, keys) = cache
        .get_at(URL, &fetcher, true, true, "Test", 1000.5)
        .await
        .expect("forced refresh ignores backoff");

    assert_eq!(fetcher.calls(), 2);
    assert!(keys.contains_key("k1"));
}

#[tokio::test]
async fn success_resets_backoff() {
    let cache = JwksCache::new(300.0, 1.0, 60.0);
    let fetcher = SeqFetcher::new(vec![
        Err("timeout".to_string()),
        Err("timeout".to_string()),
        Ok(jwks_doc()),
    ]);

    assert!(
        cache
            .get_at(URL, &fetcher, false, true, "Test", 1000.0)
            .await
            .is_err(),
        "first failure"
    );
    assert_eq!(cache.backoff_state(URL), Some((1001.0, 2.0)));

    assert!(
        cache
            .get_at(URL, &fetcher, false, true, "Test", 1001.5)
            .await
            .is_err(),
        "second failure"
    );
    assert_eq!(cache.backoff_state(URL), Some((1003.5, 4.0)));

    cache
        .get_at(URL, &fetcher, false, true, "Test", 1004.0)
        .await
        .expect("third attempt succeeds");
    assert_eq!(cache.backoff_state(URL), Some((0.0, 1.0)));
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn clear_drops_cached_entries() {
    let cache = JwksCache::new(300.0, 1.0, 60.0);
    let fetcher = SeqFetcher::new(vec![Ok(jwks_doc()), Ok(jwks_doc())]);

    cache
        .get_at(URL, &fetcher, false, true, "Test", 1000.0)
        .await
        .expect("first fetch succeeds");
    cache.clear();
    cache
        .get_at(URL, &fetcher, false, true, "Test", 1001.0)
        .await
        .expect("refetched after clear");

    assert_eq!(fetcher.calls(), 2);
}

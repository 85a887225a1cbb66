use anyhow::Context as _;
use blender_uss::api::{AppState, router};
use blender_uss::auth::broker::TokenBroker;
use blender_uss::auth::jwks::{JwksCache, SafeJwksFetcher};
use blender_uss::auth::scopes::ScopeGate;
use blender_uss::config::Settings;
use blender_uss::geozone::{GeozoneDownloader, StoreGeozoneWriter};
use blender_uss::rid::dss::DssCoordinator;
use blender_uss::rid::records::StoreRecords;
use blender_uss::store::{KeyValueStore, RedisStore};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Interval between peer-USS poll sweeps.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "flight-blender", about = "USS node for federated UTM networks")]
struct Args {
    /// Address to serve the inbound API on.
    #[arg(long, env = "BLENDER_BIND_ADDR", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Emit logs as JSON lines.
    #[arg(long, env = "BLENDER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let settings = Arc::new(Settings::from_env());

    let store: Arc<dyn KeyValueStore> = Arc::new(
        RedisStore::connect(&settings.redis_url)
            .await
            .context("connect to redis")?,
    );

    let broker = Arc::new(TokenBroker::new(&settings, store.clone())?);
    let jwks = JwksCache::new(
        settings.jwks_cache_ttl_s,
        settings.jwks_backoff_initial_s,
        settings.jwks_backoff_max_s,
    );
    let fetcher = Arc::new(SafeJwksFetcher::new(settings.fetch_settings())?);
    let gate = Arc::new(ScopeGate::new(&settings, jwks, fetcher));

    let records = Arc::new(StoreRecords::new(store.clone()));
    let dss = Arc::new(DssCoordinator::new(
        settings.clone(),
        store.clone(),
        broker,
        records.clone(),
    )?);

    let geozone_writer = Arc::new(StoreGeozoneWriter::new(store.clone()));
    let geozone = Arc::new(GeozoneDownloader::new(
        settings.geozone_settings(),
        store.clone(),
        geozone_writer,
    )?);

    // Background federation worker: poll peer USSes for every unexpired
    // subscription record.
    let poller = dss.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            poller.poll_active_subscriptions().await;
        }
    });

    let state = AppState {
        gate,
        dss,
        geozone,
        records,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "flight-blender listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("serve inbound API")?;

    Ok(())
}

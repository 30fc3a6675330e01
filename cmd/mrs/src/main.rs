use mrs_core::api;
use mrs_core::forward::HttpForwarder;
use mrs_core::ingest::object_events::{HttpObjectStore, ObjectStore};
use mrs_core::ingest::queue::{AmqpQueueSource, QueueSource};
use mrs_core::ingest::stream::{HttpStreamSource, StreamSource};
use mrs_core::meta;
use mrs_core::obs::Metrics;
use mrs_core::util::config::{Config, IngestMode};
use mrs_core::util::shutdown::shutdown_signal;
use mrs_core::util::usage;
use mrs_core::{ingest, obs};
use std::future::Future;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = match option_env!("MRS_APP_VERSION") {
    Some(value) => value,
    None => env!("CARGO_PKG_VERSION"),
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if usage::handle_cli_flags(APP_VERSION) {
        return Ok(());
    }

    install_crypto_provider();
    init_tracing();

    let config = Config::load()?;

    let pool = meta::db::connect(&config.postgres_dsn).await?;
    meta::migrate::run_migrations(&pool).await?;

    if is_migrate_only() {
        tracing::info!("migrations completed");
        return Ok(());
    }

    let metrics: Arc<Metrics> = obs::Metrics::new();
    let forwarder = Arc::new(HttpForwarder::new(
        &config.sink_url,
        &config.sink_token,
        config.forward_timeout,
    )?);
    let state = api::AppState::new(config, pool, forwarder, metrics);
    run_mode(state).await
}

fn install_crypto_provider() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring crypto provider");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn is_migrate_only() -> bool {
    std::env::args().any(|arg| arg == "--migrate-only")
}

async fn run_mode(state: api::AppState) -> Result<(), Box<dyn std::error::Error>> {
    let mode = state.config.ingest_mode;
    tracing::info!(mode = mode.as_str(), "starting ingestion");
    match mode {
        IngestMode::Http => run_http(state).await,
        IngestMode::Queue => run_queue(state).await,
        IngestMode::ObjectEvents => run_object_events(state).await,
        IngestMode::Stream => run_stream(state).await,
    }
}

async fn run_http(state: api::AppState) -> Result<(), Box<dyn std::error::Error>> {
    let servers = api::build_http_servers(state)?;
    wait_for_exit(servers.run_all()).await;
    Ok(())
}

async fn run_queue(state: api::AppState) -> Result<(), Box<dyn std::error::Error>> {
    let source: Arc<dyn QueueSource> = Arc::new(connect_queue(&state, &state.config.queue_name).await?);
    let servers = api::build_metrics_server(state.clone())?;
    ingest::queue::spawn_queue_ingest(state, source);
    wait_for_exit(servers.run_all()).await;
    Ok(())
}

async fn run_object_events(state: api::AppState) -> Result<(), Box<dyn std::error::Error>> {
    let events: Arc<dyn QueueSource> =
        Arc::new(connect_queue(&state, &state.config.object_events_queue).await?);
    let objects: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
        state
            .config
            .object_store_url
            .as_deref()
            .ok_or("MRS_OBJECT_STORE_URL is required for this ingest mode")?,
        &state.config.object_store_token,
        state.config.forward_timeout,
    )?);
    let servers = api::build_metrics_server(state.clone())?;
    ingest::object_events::spawn_object_events_ingest(state, events, objects);
    wait_for_exit(servers.run_all()).await;
    Ok(())
}

async fn run_stream(state: api::AppState) -> Result<(), Box<dyn std::error::Error>> {
    let source: Arc<dyn StreamSource> = Arc::new(HttpStreamSource::new(
        state
            .config
            .stream_url
            .as_deref()
            .ok_or("MRS_STREAM_URL is required for this ingest mode")?,
        &state.config.stream_id,
        state.config.forward_timeout,
    )?);
    let servers = api::build_metrics_server(state.clone())?;
    ingest::stream::spawn_stream_ingest(state, source);
    wait_for_exit(servers.run_all()).await;
    Ok(())
}

async fn connect_queue(state: &api::AppState, queue: &str) -> Result<AmqpQueueSource, String> {
    let url = state
        .config
        .queue_url
        .as_deref()
        .ok_or("MRS_QUEUE_URL is required for this ingest mode")?;
    AmqpQueueSource::connect(url, queue).await
}

async fn wait_for_exit<F>(run_all: F)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = run_all => {},
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }
}

use crate::engine::ReassemblyEngine;
use crate::forward::Forwarder;
use crate::meta::repos::Repo;
use crate::obs::{Metrics, MetricsLayer};
use crate::util::config::Config;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{extract::State, Router};
use prometheus::{Encoder, TextEncoder};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub mod ingest;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repo: Repo,
    pub engine: Arc<ReassemblyEngine>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: PgPool,
        forwarder: Arc<dyn Forwarder>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let repo = Repo::new(pool);
        let engine = Arc::new(ReassemblyEngine::new(Arc::new(repo.clone()), forwarder));
        Self {
            config,
            repo,
            engine,
            metrics,
        }
    }
}

pub struct Servers {
    handles: Vec<JoinHandle<()>>,
}

impl Servers {
    pub async fn run_all(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Servers for http ingest mode: the push endpoint plus metrics.
pub fn build_http_servers(state: AppState) -> Result<Servers, String> {
    let mut handles = Vec::new();

    let ingest_app =
        ingest::router(state.clone()).layer(MetricsLayer::new(state.metrics.clone(), "ingest"));
    handles.push(spawn_server(&state.config.http_listen, ingest_app)?);

    let metrics_app =
        metrics_router(state.clone()).layer(MetricsLayer::new(state.metrics.clone(), "metrics"));
    handles.push(spawn_server(&state.config.metrics_listen, metrics_app)?);

    Ok(Servers { handles })
}

/// Metrics-only server for the pull ingest modes.
pub fn build_metrics_server(state: AppState) -> Result<Servers, String> {
    let metrics_app =
        metrics_router(state.clone()).layer(MetricsLayer::new(state.metrics.clone(), "metrics"));
    let handle = spawn_server(&state.config.metrics_listen, metrics_app)?;
    Ok(Servers {
        handles: vec![handle],
    })
}

fn spawn_server(addr: &str, app: Router) -> Result<JoinHandle<()>, String> {
    let socket: SocketAddr = addr
        .parse()
        .map_err(|_| format!("invalid listen addr {addr}"))?;
    let handle = tokio::spawn(async move {
        let listener = match TcpListener::bind(socket).await {
            Ok(val) => val,
            Err(_) => return,
        };
        let _ = axum::serve(listener, app).await;
    });
    Ok(handle)
}

fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(ready_handler))
        .route("/status", get(ingest::message_stats))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    refresh_open_message_metrics(&state).await;
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&state.metrics.gather(), &mut buffer);
    String::from_utf8_lossy(&buffer).to_string()
}

pub async fn refresh_open_message_metrics(state: &AppState) {
    match state.engine.tracked_messages().await {
        Ok(count) => state.metrics.open_messages.set(count as i64),
        Err(err) => tracing::debug!(error = %err, "open message metrics refresh failed"),
    }
}

async fn ready_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if !check_db_ready(&state).await {
        return (StatusCode::SERVICE_UNAVAILABLE, "db not ready");
    }
    (StatusCode::OK, "ok")
}

async fn check_db_ready(state: &AppState) -> bool {
    tokio::time::timeout(
        std::time::Duration::from_secs(3),
        state.repo.pool().acquire(),
    )
    .await
    .is_ok_and(|result| result.is_ok())
}

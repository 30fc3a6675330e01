use axum::extract::MatchedPath;
use axum::http::Request;
use futures_util::future::BoxFuture;
use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub fragments: IntCounterVec,
    pub forwards: IntCounterVec,
    pub ingest_errors: IntCounterVec,
    pub open_messages: IntGauge,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new("mrs_http_requests_total", "HTTP requests"),
            &["service", "route", "method", "status"],
        )
        .expect("http_requests");
        let http_duration = HistogramVec::new(
            HistogramOpts::new("mrs_http_request_duration_seconds", "HTTP request duration"),
            &["service", "route", "method"],
        )
        .expect("http_duration");
        let fragments = IntCounterVec::new(
            Opts::new("mrs_fragments_total", "Fragment submissions by outcome"),
            &["source", "outcome"],
        )
        .expect("fragments");
        let forwards = IntCounterVec::new(
            Opts::new("mrs_forwards_total", "Assembled message forwards"),
            &["result"],
        )
        .expect("forwards");
        let ingest_errors = IntCounterVec::new(
            Opts::new("mrs_ingest_errors_total", "Ingestion failures"),
            &["source", "kind"],
        )
        .expect("ingest_errors");
        let open_messages = IntGauge::new("mrs_open_messages", "Messages pending reassembly")
            .expect("open_messages");

        register_collector(&registry, &http_requests);
        register_collector(&registry, &http_duration);
        register_collector(&registry, &fragments);
        register_collector(&registry, &forwards);
        register_collector(&registry, &ingest_errors);
        register_collector(&registry, &open_messages);

        Arc::new(Self {
            registry,
            http_requests,
            http_duration,
            fragments,
            forwards,
            ingest_errors,
            open_messages,
        })
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

fn register_collector<C>(registry: &Registry, collector: &C)
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone())).ok();
}

#[derive(Clone)]
pub struct MetricsLayer {
    metrics: Arc<Metrics>,
    service: &'static str,
}

impl MetricsLayer {
    pub fn new(metrics: Arc<Metrics>, service: &'static str) -> Self {
        Self { metrics, service }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
            service: self.service,
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<Metrics>,
    service: &'static str,
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let mut inner = self.inner.clone();
        let metrics = self.metrics.clone();
        let service = self.service;
        let method = req.method().clone();
        let path = request_path_label(&req);
        let start = Instant::now();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let status_label = response.status().as_u16().to_string();
            metrics
                .http_requests
                .with_label_values(&[service, &path, method.as_str(), &status_label])
                .inc();
            metrics
                .http_duration
                .with_label_values(&[service, &path, method.as_str()])
                .observe(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

fn request_path_label<B>(req: &Request<B>) -> String {
    if let Some(matched) = req.extensions().get::<MatchedPath>() {
        return matched.as_str().to_string();
    }
    req.uri().path().to_string()
}

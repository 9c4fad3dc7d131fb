//! HTTP server and scrape handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, ProtobufEncoder, Registry,
    TextEncoder,
};
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tracing::{error, info};

use crate::gather::MergingGatherer;

const PROTOBUF_MEDIA_TYPE: &str = "application/vnd.google.protobuf";

/// Self-instrumentation of the exposition handler, registered in the same
/// registry it serves.
#[derive(Clone)]
pub struct HandlerMetrics {
    requests: IntCounterVec,
    in_flight: IntGauge,
    duration: Histogram,
}

impl HandlerMetrics {
    /// Create the handler metrics and register them in `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests = IntCounterVec::new(
            Opts::new(
                "kamailio_exporter_http_requests_total",
                "Total number of scrapes served by the metrics handler.",
            ),
            &["code"],
        )?;
        let in_flight = IntGauge::new(
            "kamailio_exporter_http_requests_in_flight",
            "Number of scrapes currently being served.",
        )?;
        let duration = Histogram::with_opts(HistogramOpts::new(
            "kamailio_exporter_http_request_duration_seconds",
            "Time spent serving scrape requests.",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            requests,
            in_flight,
            duration,
        })
    }
}

/// Upstream mirrored by the rtp metrics path.
#[derive(Clone)]
pub struct ProxyTarget {
    path: String,
    url: String,
    client: reqwest::Client,
}

impl ProxyTarget {
    pub fn new(path: String, url: String, client: reqwest::Client) -> Self {
        Self { path, url, client }
    }

    /// The scrape path the proxy is mounted on.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    gatherer: Arc<MergingGatherer>,
    metrics: HandlerMetrics,
    metrics_path: String,
    proxy: Option<ProxyTarget>,
}

impl AppState {
    pub fn new(
        gatherer: Arc<MergingGatherer>,
        metrics: HandlerMetrics,
        metrics_path: String,
        proxy: Option<ProxyTarget>,
    ) -> Self {
        Self {
            gatherer,
            metrics,
            metrics_path,
            proxy,
        }
    }
}

/// Create the HTTP router. The proxy route is only mounted when a target is
/// configured.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(root_handler))
        .route(&state.metrics_path, get(metrics_handler));

    if let Some(proxy) = &state.proxy {
        router = router.route(proxy.path(), get(rtp_metrics_handler));
    }

    router.layer(CompressionLayer::new()).with_state(state)
}

/// Handler for the metrics endpoint.
async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.metrics.in_flight.inc();
    let timer = state.metrics.duration.start_timer();

    let response = match state.gatherer.gather().await {
        Ok(families) => encode_families(&families, &headers),
        Err(err) => {
            error!(error = %err, "Gathering local metrics failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to gather metrics: {err}\n"),
            )
                .into_response()
        }
    };

    timer.observe_duration();
    state.metrics.in_flight.dec();
    state
        .metrics
        .requests
        .with_label_values(&[response.status().as_str()])
        .inc();
    response
}

/// Encode the families in the format negotiated from the `Accept` header.
fn encode_families(families: &[MetricFamily], headers: &HeaderMap) -> Response {
    let mut buffer = Vec::new();
    let (format_type, result) = if accepts_protobuf(headers) {
        let encoder = ProtobufEncoder::new();
        (encoder.format_type().to_string(), encoder.encode(families, &mut buffer))
    } else {
        let encoder = TextEncoder::new();
        (encoder.format_type().to_string(), encoder.encode(families, &mut buffer))
    };

    match result {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, format_type)],
            buffer,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Encoding metrics failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {err}\n"),
            )
                .into_response()
        }
    }
}

fn accepts_protobuf(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains(PROTOBUF_MEDIA_TYPE))
}

/// Handler for the rtp metrics path: mirrors the upstream response verbatim.
async fn rtp_metrics_handler(State(state): State<AppState>) -> Response {
    // The route is only mounted when a proxy target is configured.
    let Some(proxy) = &state.proxy else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let response = match proxy.client.get(&proxy.url).send().await {
        Ok(response) => response,
        Err(err) => {
            error!(url = %proxy.url, error = %err, "Failed to connect to rtpengine");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Failed to connect to rtpengine: {err}"),
            )
                .into_response();
        }
    };

    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            error!(url = %proxy.url, error = %err, "Failed to read response from rtpengine");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to read response from rtpengine: {err}"),
            )
                .into_response();
        }
    };

    let mut mirrored = (StatusCode::OK, body).into_response();
    if let Some(content_type) = content_type {
        mirrored.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    mirrored
}

/// Handler for the informational root page.
async fn root_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>Kamailio Exporter</title></head>\n\
         <body>\n\
         <p>This is a prometheus metric exporter for Kamailio.</p>\n\
         <p>Browse <a href='{path}'>{path}</a> to get the metrics.</p>\n\
         </body>\n\
         </html>\n",
        path = state.metrics_path
    ))
}

/// HTTP server serving the scrape routes.
pub struct HttpServer {
    state: AppState,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(state: AppState, listen_addr: SocketAddr) -> Self {
        Self { state, listen_addr }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let metrics_path = self.state.metrics_path.clone();
        let router = create_router(self.state);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|err| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, err))?;

        info!(
            addr = %self.listen_addr,
            path = %metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|err| anyhow::anyhow!("HTTP server error: {}", err))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather::{Gather, GatherError, GatherResult};
    use axum::body::Body;
    use axum::http::Request;
    use prometheus::Gauge;
    use tower::ServiceExt;

    struct FailingGather;

    impl Gather for FailingGather {
        fn gather(&self) -> Result<GatherResult, GatherError> {
            Err(GatherError::new("collector unavailable"))
        }
    }

    fn make_state_with_local(local: Arc<dyn Gather>, registry: &Registry) -> AppState {
        let metrics = HandlerMetrics::new(registry).unwrap();
        let gatherer = Arc::new(MergingGatherer::new(local, None));
        AppState::new(gatherer, metrics, "/metrics".to_string(), None)
    }

    fn make_state() -> AppState {
        let registry = Registry::new();
        let gauge = Gauge::new("test_metric", "A test metric.").unwrap();
        gauge.set(42.0);
        registry.register(Box::new(gauge)).unwrap();
        make_state_with_local(Arc::new(registry.clone()), &registry)
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let router = create_router(make_state());

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = body_string(response).await;
        assert!(body.contains("test_metric 42"));
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let registry = Registry::new();
        let metrics = HandlerMetrics::new(&registry).unwrap();
        let gatherer = Arc::new(MergingGatherer::new(Arc::new(registry.clone()), None));
        let state = AppState::new(gatherer, metrics, "/prometheus/metrics".to_string(), None);
        let router = create_router(state);

        let response = router
            .clone()
            .oneshot(
                Request::get("/prometheus/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Default path should 404
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_root_page_links_to_metrics_path() {
        let router = create_router(make_state());

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("href='/metrics'"));
    }

    #[tokio::test]
    async fn test_protobuf_negotiation() {
        let router = create_router(make_state());

        let response = router
            .oneshot(
                Request::get("/metrics")
                    .header(
                        "accept",
                        "application/vnd.google.protobuf; \
                         proto=io.prometheus.client.MetricFamily; encoding=delimited",
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(
            content_type
                .to_str()
                .unwrap()
                .starts_with("application/vnd.google.protobuf")
        );
    }

    #[tokio::test]
    async fn test_gzip_encoding_when_requested() {
        let router = create_router(make_state());

        let response = router
            .oneshot(
                Request::get("/metrics")
                    .header("accept-encoding", "gzip")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let encoding = response.headers().get("content-encoding").unwrap();
        assert_eq!(encoding.to_str().unwrap(), "gzip");
    }

    #[tokio::test]
    async fn test_local_gather_failure_returns_500() {
        let registry = Registry::new();
        let state = make_state_with_local(Arc::new(FailingGather), &registry);
        let router = create_router(state.clone());

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert!(body.contains("collector unavailable"));

        let served = state.metrics.requests.with_label_values(&["500"]).get();
        assert_eq!(served, 1);
    }

    #[tokio::test]
    async fn test_proxy_route_not_mounted_without_target() {
        let router = create_router(make_state());

        let response = router
            .oneshot(Request::get("/rtpmetrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

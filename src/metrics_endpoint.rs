//! Metrics HTTP endpoint
//!
//! Serves relay metrics on a separate port: Prometheus text at `/metrics`,
//! a JSON snapshot at `/stats` and a liveness probe at `/health`.

use crate::error::Result;
use crate::metrics::{MetricsSnapshot, RelayMetrics};
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<RelayMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Example
    /// ```no_run
    /// use range_relay::metrics::RelayMetrics;
    /// use range_relay::metrics_endpoint::MetricsEndpoint;
    /// use std::sync::Arc;
    ///
    /// let metrics = Arc::new(RelayMetrics::new());
    /// let endpoint = MetricsEndpoint::new(metrics, "127.0.0.1:9090".parse().unwrap());
    /// ```
    pub fn new(metrics: Arc<RelayMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve until the process exits
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<RelayMetrics>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &RelayMetrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics.get_stats()),
        ),
        "/stats" => match serde_json::to_string(&metrics.get_stats()) {
            Ok(body) => text_response(StatusCode::OK, "application/json", body),
            Err(e) => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("failed to encode stats: {}", e),
            ),
        },
        "/health" => text_response(StatusCode::OK, "application/json", r#"{"status":"healthy"}"#.to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found".to_string()),
    }
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "# HELP range_relay_{} {}", name, help);
    let _ = writeln!(output, "# TYPE range_relay_{} {}", name, kind);
    let _ = writeln!(output, "range_relay_{} {}\n", name, value);
}

/// Format metrics in Prometheus exposition format
fn format_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut output = String::new();

    push_metric(&mut output, "requests_total", "counter", "Client requests received", snapshot.total_requests);
    push_metric(&mut output, "completed_requests_total", "counter", "Requests relayed in full", snapshot.completed_requests);
    push_metric(&mut output, "failed_requests_total", "counter", "Requests ended with an error status or truncated", snapshot.failed_requests);
    push_metric(&mut output, "declined_requests_total", "counter", "Requests declined because no fetch target is configured", snapshot.declined_requests);
    push_metric(&mut output, "range_rejected_requests_total", "counter", "Requests rejected with 416", snapshot.range_rejected_requests);

    push_metric(&mut output, "fetches_total", "counter", "Internal fetches issued", snapshot.total_fetches);
    push_metric(&mut output, "failed_fetches_total", "counter", "Internal fetches that failed", snapshot.failed_fetches);
    push_metric(&mut output, "resumed_fetches_total", "counter", "Fetches issued to resume a short delivery", snapshot.resumed_fetches);
    push_metric(&mut output, "redirects_followed_total", "counter", "Relocations followed", snapshot.redirects_followed);
    push_metric(&mut output, "fetch_failure_rate", "gauge", "Fetch failure rate percentage", format!("{:.2}", snapshot.fetch_failure_rate()));
    push_metric(&mut output, "fetches_per_request", "gauge", "Average fetches per served request", format!("{:.2}", snapshot.fetches_per_request()));

    push_metric(&mut output, "bytes_to_client_total", "counter", "Body bytes relayed to clients", snapshot.bytes_to_client);

    push_metric(&mut output, "request_duration_ms_avg", "gauge", "Average request duration in milliseconds", format!("{:.2}", snapshot.avg_request_duration_ms()));
    push_metric(&mut output, "fetch_duration_ms_avg", "gauge", "Average fetch duration in milliseconds", format!("{:.2}", snapshot.avg_fetch_duration_ms()));

    output
}

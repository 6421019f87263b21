//! HTTP server for the metrics endpoints
//!
//! - `/metrics`: Prometheus text exposition
//! - `/report`: the plain-text broker report
//! - `/health`: liveness probe

use super::Metrics;
use crate::broker::wait_for_shutdown;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// HTTP server that exposes broker metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    top_topics: usize,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self {
            metrics,
            addr,
            top_topics: 10,
        }
    }

    /// Number of filters listed by `/report`
    pub fn with_top_topics(mut self, top_topics: usize) -> Self {
        self.top_topics = top_topics;
        self
    }

    /// Serve until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!("Metrics server stopping");
                    return Ok(());
                }
            };

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();
            let top_topics = self.top_topics;

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = route(req.uri().path(), &metrics, top_topics);
                    async move { Ok::<_, Infallible>(response) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}

pub(crate) fn route(path: &str, metrics: &Metrics, top_topics: usize) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = metrics.registry.gather();
            let mut buffer = Vec::new();

            match encoder.encode(&metric_families, &mut buffer) {
                Ok(()) => respond(StatusCode::OK, prometheus::TEXT_FORMAT, buffer),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        "Failed to encode metrics",
                    )
                }
            }
        }
        "/report" => respond(
            StatusCode::OK,
            "text/plain; charset=utf-8",
            metrics.report(top_topics),
        ),
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

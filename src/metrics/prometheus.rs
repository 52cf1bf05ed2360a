//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "mydeployment_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors by error class
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "mydeployment_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind", "error"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "mydeployment_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Writes to dependent Deployments by action
    pub static ref DEPENDENT_WRITES: CounterVec = register_counter_vec!(
        "mydeployment_operator_dependent_writes_total",
        "Writes to dependent resources by action",
        &["action"]
    ).unwrap();

    /// Status sub-resource writes
    pub static ref STATUS_WRITES: Counter = register_counter!(
        "mydeployment_operator_status_writes_total",
        "Total number of status writes"
    ).unwrap();

    /// Optimistic-concurrency conflicts retried in place
    pub static ref CONFLICT_RETRIES: CounterVec = register_counter_vec!(
        "mydeployment_operator_conflict_retries_total",
        "Conflicts retried locally by the reconciler",
        &["target"]
    ).unwrap();

    /// Keys re-enqueued with backoff after a failed reconcile
    pub static ref QUEUE_RETRIES: Counter = register_counter!(
        "mydeployment_operator_workqueue_retries_total",
        "Total number of rate-limited requeues"
    ).unwrap();

    /// Keys ready in the work queue
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "mydeployment_operator_workqueue_depth",
        "Number of keys ready for processing"
    ).unwrap();

    /// Watch notifications received by kind and event type
    pub static ref WATCH_EVENTS: CounterVec = register_counter_vec!(
        "mydeployment_operator_watch_events_total",
        "Watch notifications received",
        &["kind", "event"]
    ).unwrap();

    /// Workers currently reconciling
    pub static ref ACTIVE_WORKERS: Gauge = register_gauge!(
        "mydeployment_operator_active_workers",
        "Number of workers currently reconciling"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "mydeployment_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Set once the controller's workers are running
static READY: AtomicBool = AtomicBool::new(false);

/// Mark the operator ready (or not) for `/readyz`
pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::SeqCst);
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    // Set initial health
    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = text_response(StatusCode::OK, buffer);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}

/// Readiness check response
fn ready_response() -> Response<Full<Bytes>> {
    if READY.load(Ordering::SeqCst) {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_follows_flag() {
        set_ready(false);
        assert_eq!(ready_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        set_ready(true);
        assert_eq!(ready_response().status(), StatusCode::OK);
    }

    #[test]
    fn metrics_are_exposed() {
        QUEUE_DEPTH.set(3.0);
        let response = metrics_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            prometheus::TEXT_FORMAT
        );
    }
}

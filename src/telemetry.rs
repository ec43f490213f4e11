//! Prometheus metrics.

use std::time::Instant;

use axum::{extract::MatchedPath, http::Request, middleware::Next, response::Response};
use bankd_core::{PaymentStatus, TransactionKind};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub async fn track_requests<B>(req: Request<B>, next: Next<B>) -> Response {
    let start = Instant::now();
    // label by route template; unmatched requests share one label
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::increment_counter!(
        "bankd_http_requests_total",
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status
    );
    metrics::histogram!(
        "bankd_http_request_duration_seconds",
        start.elapsed().as_secs_f64(),
        "method" => method,
        "path" => path
    );
    response
}

pub fn record_posting(kind: TransactionKind) {
    metrics::increment_counter!("bankd_ledger_postings_total", "kind" => kind.as_str());
}

pub fn record_idempotent_replay(operation: &'static str) {
    metrics::increment_counter!("bankd_idempotent_replays_total", "operation" => operation);
}

pub fn record_payment(status: PaymentStatus) {
    metrics::increment_counter!("bankd_payments_total", "status" => status.as_str());
}

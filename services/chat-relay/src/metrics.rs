//! Prometheus metrics setup and recording helpers

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for the /metrics
/// endpoint to render.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("relay_request_duration_seconds".to_string()),
        &[
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ],
    )?;
    let handle = builder.install_recorder()?;
    Ok(handle)
}

/// Record one completed request with its outward code and total duration.
pub fn record_request(code: i32, duration_secs: f64) {
    counter!("relay_requests_total", "code" => code.to_string()).increment(1);
    histogram!("relay_request_duration_seconds").record(duration_secs);
}

/// Record one backend attempt by outcome label
/// ("success", "rate_limited", "unauthorized", "transient").
pub fn record_attempt(outcome: &'static str) {
    counter!("relay_attempts_total", "outcome" => outcome).increment(1);
}

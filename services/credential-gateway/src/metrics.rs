//! Prometheus metrics exposition
//!
//! Library crates emit through the `metrics` facade; this module installs the
//! recorder that renders them on `/metrics`:
//!
//! - `credential_cache_{hits,misses,evictions}_total` (counters)
//! - `circuit_breaker_state` (gauge, 0 closed / 1 open / 2 half-open)
//! - `circuit_breaker_rejections_total` (counter)
//! - `connection_pool_requests_total`, `connection_pool_retries_total` (counters)
//! - `connection_pool_request_duration_seconds`, `token_refresh_duration_seconds` (histograms)
//! - `token_refresh_total` (counter): labels `method`, `outcome`, `error_type`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Outbound calls range from a local mock (ms) to a slow provider at the
/// pool's default 30s timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

const HISTOGRAMS: &[&str] = &[
    "connection_pool_request_duration_seconds",
    "token_refresh_duration_seconds",
];

fn builder() -> PrometheusBuilder {
    HISTOGRAMS
        .iter()
        .fold(PrometheusBuilder::new(), |builder, name| {
            builder
                .set_buckets_for_metric(Matcher::Full((*name).to_string()), DURATION_BUCKETS)
                .expect("histogram buckets are non-empty")
        })
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Recorder/handle pair for tests, without touching the global recorder.
#[cfg(test)]
pub fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}

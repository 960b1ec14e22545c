//! Prometheus exposition for the engine's counters and histograms.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use radportal_notifications::timing::names;

/// Seconds. Gateway sends are capped by the send timeout (10s by default).
const OPERATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(names::OPERATION_DURATION_SECONDS.to_string()),
        OPERATION_BUCKETS,
    )
}

/// Install the process-wide recorder and return the handle `/metrics` renders.
///
/// `None` if a recorder is already installed; the endpoint then answers 503.
pub fn install() -> Option<PrometheusHandle> {
    match builder().and_then(PrometheusBuilder::install_recorder) {
        Ok(handle) => {
            tracing::info!("Prometheus recorder installed");
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    }
}

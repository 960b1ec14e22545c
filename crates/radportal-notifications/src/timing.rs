//! Explicit timing wrapper and engine metric names.

use std::future::Future;
use std::time::Instant;

use metrics::histogram;
use tracing::debug;

pub mod names {
    pub const SENT_TOTAL: &str = "notifications_sent_total";
    pub const FAILED_TOTAL: &str = "notifications_failed_total";
    pub const CONSENT_DENIED_TOTAL: &str = "notifications_consent_denied_total";
    pub const DEFERRED_TOTAL: &str = "notifications_deferred_total";
    pub const RETRY_EXHAUSTED_TOTAL: &str = "notifications_retry_exhausted_total";
    pub const DELIVERED_TOTAL: &str = "notifications_delivered_total";
    pub const OPERATION_DURATION_SECONDS: &str = "notification_operation_duration_seconds";
}

/// Await `fut`, logging and recording how long it took under `operation`.
pub async fn timed<F>(operation: &'static str, fut: F) -> F::Output
where
    F: Future,
{
    let started = Instant::now();
    let output = fut.await;
    let elapsed = started.elapsed();
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(elapsed.as_secs_f64());
    debug!(
        operation,
        elapsed_ms = elapsed.as_millis() as u64,
        "Operation finished"
    );
    output
}

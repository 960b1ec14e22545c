//! Timer-driven background work: scheduled sweep, retries, lease release and
//! opt-out audit retention.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::consent::ConsentGate;
use crate::retry::RetryEngine;
use crate::service::{NotificationEngine, NotificationService};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Background processor driving the periodic batch jobs
pub struct NotificationProcessor {
    engine: Arc<NotificationEngine>,
    retry: Arc<RetryEngine>,
    consent: Arc<ConsentGate>,
    poll_interval: Duration,
    retry_interval: Duration,
}

impl NotificationProcessor {
    pub fn new(
        engine: Arc<NotificationEngine>,
        retry: Arc<RetryEngine>,
        consent: Arc<ConsentGate>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            engine,
            retry,
            consent,
            poll_interval: Duration::from_secs(config.processor.poll_interval_secs),
            retry_interval: Duration::from_secs(config.retry.interval_secs),
        }
    }

    /// Start the processing loop in the background.
    ///
    /// Returns a shutdown sender that can be used to stop the processor.
    pub fn start(self) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            info!(
                poll_interval_secs = self.poll_interval.as_secs(),
                retry_interval_secs = self.retry_interval.as_secs(),
                "Notification processor started"
            );

            let mut poll = interval(self.poll_interval);
            let mut retry = interval(self.retry_interval);
            let mut purge = interval(PURGE_INTERVAL);

            loop {
                tokio::select! {
                    _ = poll.tick() => self.sweep().await,
                    _ = retry.tick() => self.retry_pass().await,
                    _ = purge.tick() => self.purge().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Notification processor shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// Release stale leases, then dispatch due scheduled notifications.
    pub async fn sweep(&self) {
        if let Err(e) = self.engine.release_stale_leases().await {
            error!(error = %e, "Error releasing stale leases");
        }
        match self.engine.process_scheduled().await {
            Ok(processed) if processed > 0 => {
                info!(count = processed, "Processed scheduled notifications");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Error processing scheduled notifications"),
        }
    }

    pub async fn retry_pass(&self) {
        match self.retry.retry_eligible().await {
            Ok(report) if report.attempted > 0 => {
                info!(
                    attempted = report.attempted,
                    sent = report.sent,
                    exhausted = report.exhausted,
                    "Retry pass complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Error retrying notifications"),
        }
    }

    pub async fn purge(&self) {
        if let Err(e) = self.consent.purge_opt_out_audit().await {
            error!(error = %e, "Error purging opt-out audit records");
        }
    }
}

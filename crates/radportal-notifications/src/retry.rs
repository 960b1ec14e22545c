//! Periodic re-attempts of failed notifications.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info};

use crate::config::RetryConfig;
use crate::error::NotificationError;
use crate::service::NotificationEngine;
use crate::store::DeliveryLog;
use crate::types::{DeliveryEvent, DeliveryLogEntry, NotificationStatus, SendOutcome};

/// Summary of one retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: u32,
    pub sent: u32,
    pub exhausted: u32,
}

pub struct RetryEngine {
    engine: Arc<NotificationEngine>,
    log: Arc<dyn DeliveryLog>,
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(engine: Arc<NotificationEngine>, log: Arc<dyn DeliveryLog>, config: RetryConfig) -> Self {
        Self {
            engine,
            log,
            config,
        }
    }

    /// Oldest creation time still inside the retry window
    pub fn window_start(&self, now: OffsetDateTime) -> OffsetDateTime {
        now - Duration::hours(self.config.window_hours as i64)
    }

    /// Re-attempt failed requests created inside the window with budget left.
    ///
    /// Each candidate goes back through consent and business hours, so a
    /// retry can also end up scheduled or suppressed.
    pub async fn retry_eligible(&self) -> Result<RetryReport, NotificationError> {
        let store = self.engine.store();
        let now = self.engine.clock().now();
        let candidates = store
            .list_retry_candidates(
                self.window_start(now),
                self.config.max_retries,
                self.config.batch_size,
            )
            .await?;

        let mut report = RetryReport::default();
        if candidates.is_empty() {
            return Ok(report);
        }
        debug!(count = candidates.len(), "Retrying failed notifications");

        for candidate in candidates {
            let Some(mut claimed) = store
                .claim(&candidate.id, &[NotificationStatus::Failed], now)
                .await?
            else {
                continue;
            };

            let attempt = store
                .increment_retry(&claimed.id, self.config.max_retries)
                .await?;
            claimed.retry_count = attempt;
            self.log
                .append(&DeliveryLogEntry::new(
                    &claimed.id,
                    DeliveryEvent::RetryAttempt,
                    Some(format!("retry {attempt} of {}", self.config.max_retries)),
                    now,
                ))
                .await?;
            report.attempted += 1;

            let outcome = match self.engine.run_claimed(&claimed).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(notification_id = %claimed.id, error = %e, "Retry attempt errored");
                    SendOutcome::Failed {
                        notification_id: claimed.id.clone(),
                        error: e.to_string(),
                    }
                }
            };

            match outcome {
                SendOutcome::Sent { .. } => {
                    report.sent += 1;
                    info!(notification_id = %claimed.id, retry_count = attempt, "Retry succeeded");
                }
                // The engine audits exhaustion itself
                SendOutcome::Failed { .. } if attempt >= self.config.max_retries => {
                    report.exhausted += 1;
                }
                _ => {}
            }
        }

        Ok(report)
    }
}

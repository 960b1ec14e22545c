//! Reconciles asynchronous provider delivery callbacks.

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::NotificationError;
use crate::store::{DeliveryLog, NotificationStore};
use crate::timing::names;
use crate::types::{DeliveryEvent, DeliveryLogEntry};

/// Final delivery states in the internal vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
}

/// Inbound provider callback body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCallback {
    pub provider_message_id: String,
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Map a provider status onto the internal vocabulary.
///
/// Intermediate states (queued, accepted, sending, ...) return `None`.
pub fn map_provider_status(status: &str) -> Option<DeliveryOutcome> {
    match status.trim().to_ascii_lowercase().as_str() {
        "delivered" | "delivrd" | "read" | "received" => Some(DeliveryOutcome::Delivered),
        "failed" | "undelivered" | "undeliverable" | "undeliv" | "rejected" | "rejectd"
        | "expired" | "canceled" | "cancelled" | "error" => Some(DeliveryOutcome::Failed),
        _ => None,
    }
}

pub struct DeliveryTracker {
    store: Arc<dyn NotificationStore>,
    log: Arc<dyn DeliveryLog>,
    clock: Arc<dyn Clock>,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        log: Arc<dyn DeliveryLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, log, clock }
    }

    pub async fn handle(&self, callback: &ProviderCallback) -> Result<(), NotificationError> {
        self.on_provider_callback(
            &callback.provider_message_id,
            &callback.status,
            callback.error_message.as_deref(),
        )
        .await
    }

    /// Apply a provider delivery status.
    ///
    /// Unknown correlation ids are logged and discarded. A `failed` report
    /// for a sent message is recorded as an error and audit entry; the
    /// request itself stays `sent`.
    pub async fn on_provider_callback(
        &self,
        provider_correlation_id: &str,
        provider_status: &str,
        error_detail: Option<&str>,
    ) -> Result<(), NotificationError> {
        let Some(request) = self
            .store
            .find_by_provider_id(provider_correlation_id)
            .await?
        else {
            warn!(
                provider_message_id = %provider_correlation_id,
                status = %provider_status,
                "Delivery callback for unknown message discarded"
            );
            return Ok(());
        };

        let Some(outcome) = map_provider_status(provider_status) else {
            debug!(
                notification_id = %request.id,
                status = %provider_status,
                "Intermediate delivery status ignored"
            );
            return Ok(());
        };

        let now = self.clock.now();
        match outcome {
            DeliveryOutcome::Delivered => {
                if self.store.mark_delivered(&request.id, now).await? {
                    self.log
                        .append(&DeliveryLogEntry::new(
                            &request.id,
                            DeliveryEvent::Delivered,
                            Some(provider_status.to_string()),
                            now,
                        ))
                        .await?;
                    counter!(names::DELIVERED_TOTAL).increment(1);
                    info!(notification_id = %request.id, "Notification delivered");
                } else {
                    debug!(
                        notification_id = %request.id,
                        status = ?request.status,
                        "Delivered callback for request not in sent state"
                    );
                }
            }
            DeliveryOutcome::Failed => {
                let error = match error_detail {
                    Some(detail) => format!("{provider_status}: {detail}"),
                    None => provider_status.to_string(),
                };
                self.store.record_delivery_error(&request.id, &error).await?;
                self.log
                    .append(&DeliveryLogEntry::new(
                        &request.id,
                        DeliveryEvent::DeliveryFailed,
                        Some(error.clone()),
                        now,
                    ))
                    .await?;
                warn!(
                    notification_id = %request.id,
                    error = %error,
                    "Provider reported delivery failure"
                );
            }
        }
        Ok(())
    }
}

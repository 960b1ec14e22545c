//! The send pipeline: consent gate → business hours → dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use time::Duration;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{EngineConfig, GatewayConfig};
use crate::consent::ConsentGate;
use crate::dispatcher::Dispatcher;
use crate::error::NotificationError;
use crate::hours::BusinessHours;
use crate::phone;
use crate::store::{DeliveryLog, NotificationStore};
use crate::templates::TemplateRenderer;
use crate::timing::names;
use crate::types::{
    DeliveryEvent, DeliveryLogEntry, NewNotification, NotificationRequest, NotificationStats,
    NotificationStatus, SendOutcome,
};

#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Validate, persist and push a notification through the pipeline
    async fn send(&self, request: NewNotification) -> Result<SendOutcome, NotificationError>;

    /// Get notification by ID
    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>, NotificationError>;

    /// Void a pending or scheduled notification
    async fn cancel(&self, id: &str) -> Result<bool, NotificationError>;

    /// Dispatch scheduled notifications that are due (called by the processor)
    async fn process_scheduled(&self) -> Result<u32, NotificationError>;
}

pub struct NotificationEngine {
    store: Arc<dyn NotificationStore>,
    log: Arc<dyn DeliveryLog>,
    consent: Arc<ConsentGate>,
    hours: BusinessHours,
    dispatcher: Arc<Dispatcher>,
    templates: Arc<TemplateRenderer>,
    clock: Arc<dyn Clock>,
    gateway: GatewayConfig,
    scheduled_batch_size: u32,
    lease_timeout: Duration,
    max_retries: u32,
}

impl NotificationEngine {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        log: Arc<dyn DeliveryLog>,
        consent: Arc<ConsentGate>,
        dispatcher: Arc<Dispatcher>,
        templates: Arc<TemplateRenderer>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Result<Self, NotificationError> {
        Ok(Self {
            store,
            log,
            consent,
            hours: BusinessHours::from_config(&config.business_hours)?,
            dispatcher,
            templates,
            clock,
            gateway: config.gateway.clone(),
            scheduled_batch_size: config.processor.scheduled_batch_size,
            lease_timeout: Duration::seconds(config.retry.lease_timeout_secs as i64),
            max_retries: config.retry.max_retries,
        })
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Audit trail for a notification, oldest first
    pub async fn history(
        &self,
        id: &str,
    ) -> Result<Vec<DeliveryLogEntry>, NotificationError> {
        self.log.list_for(id).await
    }

    pub async fn stats(&self) -> Result<NotificationStats, NotificationError> {
        self.store.stats().await
    }

    /// Release in-flight leases held longer than the lease timeout.
    ///
    /// Released rows become `failed` and are picked up by the retry engine.
    pub async fn release_stale_leases(&self) -> Result<usize, NotificationError> {
        let now = self.clock.now();
        let released = self
            .store
            .release_stale_leases(now - self.lease_timeout)
            .await?;
        for id in &released {
            self.log
                .append(&DeliveryLogEntry::new(
                    id,
                    DeliveryEvent::LeaseReleased,
                    None,
                    now,
                ))
                .await?;
            warn!(notification_id = %id, "Released stale in-flight lease");
            if let Some(row) = self.store.get(id).await?
                && row.retry_count >= self.max_retries
            {
                self.note_exhausted(id, row.retry_count, "lease expired")
                    .await;
            }
        }
        Ok(released.len())
    }

    /// Run a claimed (`in_flight`) request through consent, business hours and dispatch.
    ///
    /// A failure on a request with no retry budget left is recorded as
    /// exhausted here, whichever path claimed it.
    pub async fn run_claimed(
        &self,
        request: &NotificationRequest,
    ) -> Result<SendOutcome, NotificationError> {
        let result = self.run_stages(request).await;
        let failure = match &result {
            Ok(SendOutcome::Failed { error, .. }) => Some(error.clone()),
            Ok(_) => None,
            Err(e) => {
                // Leave the row retryable instead of stuck in flight
                if let Err(mark_err) = self.store.mark_failed(&request.id, &e.to_string()).await {
                    error!(
                        notification_id = %request.id,
                        error = %mark_err,
                        "Failed to release request after pipeline error"
                    );
                }
                Some(e.to_string())
            }
        };
        if let Some(error) = failure
            && request.retry_count >= self.max_retries
        {
            self.note_exhausted(&request.id, request.retry_count, &error)
                .await;
        }
        result
    }

    async fn note_exhausted(&self, id: &str, retry_count: u32, error: &str) {
        if let Err(e) = self
            .audit(id, DeliveryEvent::RetryExhausted, Some(error.to_string()))
            .await
        {
            error!(notification_id = %id, error = %e, "Failed to record retry exhaustion");
        }
        counter!(names::RETRY_EXHAUSTED_TOTAL).increment(1);
        warn!(
            notification_id = %id,
            retry_count,
            error = %error,
            "Notification retries exhausted"
        );
    }

    async fn run_stages(
        &self,
        request: &NotificationRequest,
    ) -> Result<SendOutcome, NotificationError> {
        let id = request.id.clone();

        let allowed = self
            .consent
            .can_send(request.patient_id.as_deref(), &request.template_type)
            .await?;
        if !allowed {
            if !self.store.mark_cancelled(&id, "consent denied").await? {
                warn!(notification_id = %id, "Lease lost before consent suppression");
            }
            self.audit(&id, DeliveryEvent::ConsentDenied, request.patient_id.clone())
                .await?;
            counter!(names::CONSENT_DENIED_TOTAL).increment(1);
            info!(
                notification_id = %id,
                patient_id = ?request.patient_id,
                template = %request.template_type,
                "Notification suppressed by consent"
            );
            return Ok(SendOutcome::ConsentDenied {
                notification_id: id,
            });
        }
        self.audit(&id, DeliveryEvent::ConsentAllowed, None).await?;

        let decision = self.hours.decide(self.clock.now(), request.priority);
        if !decision.send_now {
            let at = decision.next_window_start;
            if !self.store.mark_scheduled(&id, at).await? {
                warn!(notification_id = %id, "Lease lost before deferral");
            }
            self.audit(&id, DeliveryEvent::Deferred, Some(at.to_string()))
                .await?;
            counter!(names::DEFERRED_TOTAL).increment(1);
            info!(
                notification_id = %id,
                priority = request.priority.as_str(),
                scheduled_at = %at,
                "Notification deferred to business hours"
            );
            return Ok(SendOutcome::Scheduled {
                notification_id: id,
                at,
            });
        }

        match self.dispatcher.dispatch(request).await {
            Ok(provider_correlation_id) => Ok(SendOutcome::Sent {
                notification_id: id,
                provider_correlation_id,
            }),
            Err(e) if e.is_retryable() || e.is_validation() => Ok(SendOutcome::Failed {
                notification_id: id,
                error: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn audit(
        &self,
        id: &str,
        event: DeliveryEvent,
        detail: Option<String>,
    ) -> Result<(), NotificationError> {
        self.log
            .append(&DeliveryLogEntry::new(id, event, detail, self.clock.now()))
            .await
    }
}

#[async_trait]
impl NotificationService for NotificationEngine {
    async fn send(&self, new: NewNotification) -> Result<SendOutcome, NotificationError> {
        if self.templates.get(&new.template_type).is_none() {
            return Err(NotificationError::UnknownTemplate(new.template_type));
        }
        phone::normalize(&new.recipient_phone, &self.gateway)?;

        let now = self.clock.now();
        let not_before = new.not_before.filter(|at| *at > now);
        let mut request =
            NotificationRequest::from_new(uuid::Uuid::new_v4().to_string(), new, now);
        let id = request.id.clone();

        if let Some(at) = not_before {
            request.status = NotificationStatus::Scheduled;
            request.scheduled_at = Some(at);
            self.store.insert(&request).await?;
            self.audit(&id, DeliveryEvent::Created, Some(request.template_type.clone()))
                .await?;
            self.audit(&id, DeliveryEvent::Deferred, Some(at.to_string()))
                .await?;
            info!(
                notification_id = %id,
                template = %request.template_type,
                scheduled_at = %at,
                "Notification scheduled"
            );
            return Ok(SendOutcome::Scheduled {
                notification_id: id,
                at,
            });
        }

        self.store.insert(&request).await?;
        self.audit(&id, DeliveryEvent::Created, Some(request.template_type.clone()))
            .await?;

        let claimed = self
            .store
            .claim(&id, &[NotificationStatus::Pending], now)
            .await?
            .ok_or_else(|| {
                NotificationError::Internal(format!("could not claim new notification {id}"))
            })?;
        self.run_claimed(&claimed).await
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationRequest>, NotificationError> {
        self.store.get(id).await
    }

    async fn cancel(&self, id: &str) -> Result<bool, NotificationError> {
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            self.audit(id, DeliveryEvent::Cancelled, None).await?;
            info!(notification_id = %id, "Notification cancelled");
        }
        Ok(cancelled)
    }

    async fn process_scheduled(&self) -> Result<u32, NotificationError> {
        let now = self.clock.now();
        let due = self
            .store
            .list_due_scheduled(now, self.scheduled_batch_size)
            .await?;
        let mut processed = 0;

        for candidate in due {
            let Some(claimed) = self
                .store
                .claim(&candidate.id, &[NotificationStatus::Scheduled], now)
                .await?
            else {
                // Cancelled or taken by another worker since listing
                continue;
            };

            match self.run_claimed(&claimed).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    error!(
                        notification_id = %claimed.id,
                        error = %e,
                        "Error processing scheduled notification"
                    );
                }
            }
        }

        Ok(processed)
    }
}

//! Gateway dispatch of a single claimed request.
//!
//! The dispatcher never retries inline: a failed send is persisted as
//! `failed` and left to the retry engine.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::NotificationError;
use crate::gateway::{OutboundSms, SmsGateway};
use crate::phone;
use crate::store::{DeliveryLog, NotificationStore};
use crate::templates::TemplateRenderer;
use crate::timing::{names, timed};
use crate::types::{DeliveryEvent, DeliveryLogEntry, NotificationRequest};

pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    log: Arc<dyn DeliveryLog>,
    gateway: Arc<dyn SmsGateway>,
    templates: Arc<TemplateRenderer>,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        log: Arc<dyn DeliveryLog>,
        gateway: Arc<dyn SmsGateway>,
        templates: Arc<TemplateRenderer>,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            log,
            gateway,
            templates,
            clock,
            config,
        }
    }

    /// Normalize, render and size-limit the outbound message.
    pub fn build_message(
        &self,
        request: &NotificationRequest,
    ) -> Result<OutboundSms, NotificationError> {
        let to = phone::normalize(&request.recipient_phone, &self.config)?;
        let rendered = self
            .templates
            .render(&request.template_type, &request.variables)?;

        Ok(OutboundSms {
            to,
            body: self.enforce_length(&request.id, rendered.body),
            from: self.config.sender_id.clone(),
            status_callback_url: self.config.status_callback_url.clone(),
            correlation_string: request.correlation_string(),
        })
    }

    /// Send a request the caller has already claimed (status `in_flight`).
    ///
    /// Returns the provider correlation id on success.
    pub async fn dispatch(&self, request: &NotificationRequest) -> Result<String, NotificationError> {
        self.audit(
            request,
            DeliveryEvent::DispatchAttempt,
            Some(format!("attempt {}", request.retry_count + 1)),
        )
        .await?;

        let result = match self.build_message(request) {
            Ok(message) => self.send(&message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(provider_id) => {
                let now = self.clock.now();
                if !self.store.mark_sent(&request.id, &provider_id, now).await? {
                    // Lease was released mid-send; the provider still accepted it.
                    let recovered = self
                        .store
                        .mark_sent_after_release(&request.id, &provider_id, now)
                        .await?;
                    warn!(
                        notification_id = %request.id,
                        provider_message_id = %provider_id,
                        recovered,
                        "Send completed after lease was released"
                    );
                }
                self.audit(request, DeliveryEvent::Sent, Some(provider_id.clone()))
                    .await?;
                counter!(names::SENT_TOTAL, "priority" => request.priority.as_str()).increment(1);
                info!(
                    notification_id = %request.id,
                    template = %request.template_type,
                    provider_message_id = %provider_id,
                    gateway = %self.gateway.name(),
                    "Notification sent"
                );
                Ok(provider_id)
            }
            Err(e) => {
                let error_msg = e.to_string();
                if !self.store.mark_failed(&request.id, &error_msg).await? {
                    warn!(notification_id = %request.id, "Failure recorded after lease was lost");
                }
                self.audit(request, DeliveryEvent::Failed, Some(error_msg.clone()))
                    .await?;
                counter!(names::FAILED_TOTAL, "priority" => request.priority.as_str())
                    .increment(1);
                warn!(
                    notification_id = %request.id,
                    error = %error_msg,
                    retry_count = request.retry_count,
                    "Notification send failed"
                );
                Err(e)
            }
        }
    }

    async fn send(&self, message: &OutboundSms) -> Result<String, NotificationError> {
        let limit = Duration::from_millis(self.config.timeout_ms);
        let receipt = timed(
            "gateway_send",
            tokio::time::timeout(limit, self.gateway.send(message)),
        )
        .await
        .map_err(|_| NotificationError::Timeout(self.config.timeout_ms))??;
        Ok(receipt.provider_message_id)
    }

    fn enforce_length(&self, notification_id: &str, body: String) -> String {
        let max = self.config.max_body_chars;
        let len = body.chars().count();
        if len <= max {
            return body;
        }
        warn!(
            notification_id = %notification_id,
            length = len,
            max,
            "Message body truncated"
        );
        let mut truncated: String = body.chars().take(max.saturating_sub(1)).collect();
        truncated.push('…');
        truncated
    }

    async fn audit(
        &self,
        request: &NotificationRequest,
        event: DeliveryEvent,
        detail: Option<String>,
    ) -> Result<(), NotificationError> {
        self.log
            .append(&DeliveryLogEntry::new(
                &request.id,
                event,
                detail,
                self.clock.now(),
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::GatewayReceipt;
    use crate::memory::{InMemoryDeliveryLog, InMemoryNotificationStore};
    use crate::templates::{Template, ids};
    use crate::types::{ConsentCategory, NewNotification, NotificationStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<OutboundSms>>,
        fail: bool,
    }

    #[async_trait]
    impl SmsGateway for RecordingGateway {
        async fn send(&self, message: &OutboundSms) -> Result<GatewayReceipt, NotificationError> {
            self.sent.lock().unwrap().push(message.clone());
            if self.fail {
                return Err(NotificationError::GatewayFailure("provider returned 500".into()));
            }
            Ok(GatewayReceipt {
                provider_message_id: format!("SM-{}", message.correlation_string),
                status: None,
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<InMemoryNotificationStore>,
        log: Arc<InMemoryDeliveryLog>,
        gateway: Arc<RecordingGateway>,
    }

    fn fixture(fail: bool, templates: TemplateRenderer, config: GatewayConfig) -> Fixture {
        let store = Arc::new(InMemoryNotificationStore::new());
        let log = Arc::new(InMemoryDeliveryLog::new());
        let gateway = Arc::new(RecordingGateway {
            fail,
            ..Default::default()
        });
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-04 00:00 UTC)));
        let dispatcher = Dispatcher::new(
            store.clone(),
            log.clone(),
            gateway.clone(),
            Arc::new(templates),
            clock,
            config,
        );
        Fixture {
            dispatcher,
            store,
            log,
            gateway,
        }
    }

    async fn claimed(store: &InMemoryNotificationStore, phone: &str) -> NotificationRequest {
        let now = datetime!(2024-03-04 00:00 UTC);
        let new = NewNotification::new(phone, ids::SCAN_COMPLETE)
            .for_patient("p1")
            .with_variable("patient_name", "Lee");
        store
            .insert(&NotificationRequest::from_new("n1".into(), new, now))
            .await
            .unwrap();
        store
            .claim("n1", &[NotificationStatus::Pending], now)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_success_marks_sent() {
        let f = fixture(false, TemplateRenderer::with_defaults(), GatewayConfig::default());
        let request = claimed(&f.store, "0412 345 678").await;

        let provider_id = f.dispatcher.dispatch(&request).await.unwrap();
        assert_eq!(provider_id, "SM-n1-0");

        let row = f.store.get("n1").await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Sent);
        assert_eq!(row.provider_correlation_id.as_deref(), Some("SM-n1-0"));
        assert!(row.sent_at.is_some());

        let sent = f.gateway.sent.lock().unwrap();
        assert_eq!(sent[0].to, "+61412345678");
        assert!(sent[0].body.starts_with("Hi Lee"));

        let events: Vec<_> = f.log.all().iter().map(|e| e.event).collect();
        assert_eq!(events, vec![DeliveryEvent::DispatchAttempt, DeliveryEvent::Sent]);
    }

    #[tokio::test]
    async fn test_dispatch_failure_does_not_retry_inline() {
        let f = fixture(true, TemplateRenderer::with_defaults(), GatewayConfig::default());
        let request = claimed(&f.store, "0412345678").await;

        let err = f.dispatcher.dispatch(&request).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.gateway.sent.lock().unwrap().len(), 1);

        let row = f.store.get("n1").await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert!(row.last_error.unwrap().contains("500"));
        assert_eq!(row.retry_count, 0);
    }

    #[tokio::test]
    async fn test_invalid_recipient_never_reaches_gateway() {
        let f = fixture(false, TemplateRenderer::with_defaults(), GatewayConfig::default());
        let request = claimed(&f.store, "12345").await;

        let err = f.dispatcher.dispatch(&request).await.unwrap_err();
        assert!(err.is_validation());
        assert!(f.gateway.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_long_body_truncated() {
        let mut templates = TemplateRenderer::new();
        templates.register(Template {
            id: ids::SCAN_COMPLETE.into(),
            category: ConsentCategory::GeneralInformation,
            body: "x".repeat(50),
        });
        let config = GatewayConfig {
            max_body_chars: 20,
            ..Default::default()
        };
        let f = fixture(false, templates, config);
        let request = claimed(&f.store, "0412345678").await;

        f.dispatcher.dispatch(&request).await.unwrap();
        let body = f.gateway.sent.lock().unwrap()[0].body.clone();
        assert_eq!(body.chars().count(), 20);
        assert!(body.ends_with('…'));
    }
}
